//! Topic service error types.
//!
//! Every error maps to a numeric status code sent to the requesting session in a
//! `{ctrl}` reply. Internal details are logged server-side but not exposed to clients.

use crate::store::StoreError;
use thiserror::Error;

/// Topic service error type.
///
/// Maps to status codes:
/// - `NoAction`: 204
/// - `NotModified`: 304
/// - `Malformed`: 400
/// - `PermissionDenied`: 403
/// - `NotFound`, `UserNotFound`: 404
/// - `OperationNotAllowed`: 405
/// - `Duplicate`, `NotAttached`: 409
/// - `Expired`: 410
/// - `Policy`: 422
/// - `Locked`: 423
/// - `Storage`, `Invariant`, `Internal`: 500
/// - `Busy`: 503
#[derive(Debug, Error)]
pub enum TopicError {
    /// Request has the wrong shape or invalid values.
    #[error("Malformed request: {0}")]
    Malformed(String),

    /// Requester lacks the needed capability.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Quota or limit exceeded.
    #[error("Policy violation: {0}")]
    Policy(String),

    /// Topic or record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Target user does not exist.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Unique value already taken.
    #[error("Duplicate value: {0}")]
    Duplicate(String),

    /// Session must attach to the topic before sending this request.
    #[error("Session is not attached to the topic")]
    NotAttached,

    /// Request refers to something that is no longer valid.
    #[error("Expired")]
    Expired,

    /// Request not applicable to this topic category.
    #[error("Operation not allowed: {0}")]
    OperationNotAllowed(String),

    /// Topic is being torn down.
    #[error("Topic is locked")]
    Locked,

    /// Topic mailbox is full.
    #[error("Server busy")]
    Busy,

    /// Request was valid but changed nothing.
    #[error("Not modified")]
    NotModified,

    /// Request was valid but there was nothing to act on.
    #[error("No action")]
    NoAction,

    /// Storage adapter failed. Effect of the request is uncertain.
    #[error("Storage error: {0}")]
    Storage(StoreError),

    /// Internal invariant violated. Fatal to the current request.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TopicError {
    /// Returns the status code sent to the client for this error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            TopicError::NoAction => 204,
            TopicError::NotModified => 304,
            TopicError::Malformed(_) => 400,
            TopicError::PermissionDenied(_) => 403,
            TopicError::NotFound(_) | TopicError::UserNotFound(_) => 404,
            TopicError::OperationNotAllowed(_) => 405,
            TopicError::Duplicate(_) | TopicError::NotAttached => 409,
            TopicError::Expired => 410,
            TopicError::Policy(_) => 422,
            TopicError::Locked => 423,
            TopicError::Storage(_) | TopicError::Invariant(_) | TopicError::Internal(_) => 500,
            TopicError::Busy => 503,
        }
    }

    /// Returns a client-safe message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            TopicError::NoAction => "no action",
            TopicError::NotModified => "not modified",
            TopicError::Malformed(_) => "malformed",
            TopicError::PermissionDenied(_) => "permission denied",
            TopicError::NotFound(_) => "not found",
            TopicError::UserNotFound(_) => "user not found",
            TopicError::OperationNotAllowed(_) => "operation or method not allowed",
            TopicError::Duplicate(_) => "duplicate value",
            TopicError::NotAttached => "must attach first",
            TopicError::Expired => "expired",
            TopicError::Policy(_) => "policy violation",
            TopicError::Locked => "locked",
            TopicError::Busy => "server busy",
            TopicError::Storage(_) | TopicError::Invariant(_) | TopicError::Internal(_) => {
                "internal error"
            }
        }
    }

    /// Whether this is an informational outcome rather than a failure.
    #[must_use]
    pub fn is_info(&self) -> bool {
        matches!(self, TopicError::NoAction | TopicError::NotModified)
    }
}

impl From<StoreError> for TopicError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => TopicError::NotFound(what),
            StoreError::Duplicate(what) => TopicError::Duplicate(what),
            other => TopicError::Storage(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TopicError::NoAction.code(), 204);
        assert_eq!(TopicError::NotModified.code(), 304);
        assert_eq!(TopicError::Malformed("x".into()).code(), 400);
        assert_eq!(TopicError::PermissionDenied("x".into()).code(), 403);
        assert_eq!(TopicError::NotFound("x".into()).code(), 404);
        assert_eq!(TopicError::UserNotFound("x".into()).code(), 404);
        assert_eq!(TopicError::OperationNotAllowed("x".into()).code(), 405);
        assert_eq!(TopicError::Duplicate("x".into()).code(), 409);
        assert_eq!(TopicError::NotAttached.code(), 409);
        assert_eq!(TopicError::Expired.code(), 410);
        assert_eq!(TopicError::Policy("x".into()).code(), 422);
        assert_eq!(TopicError::Locked.code(), 423);
        assert_eq!(
            TopicError::Storage(StoreError::Unavailable("db".into())).code(),
            500
        );
        assert_eq!(TopicError::Invariant("x".into()).code(), 500);
        assert_eq!(TopicError::Internal("x".into()).code(), 500);
        assert_eq!(TopicError::Busy.code(), 503);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = TopicError::Storage(StoreError::Unavailable("secret dsn".into()));
        assert_eq!(err.client_message(), "internal error");
        assert!(err.to_string().contains("secret dsn"));

        let err = TopicError::Invariant("p2p topic missing peer".into());
        assert_eq!(err.client_message(), "internal error");
    }

    #[test]
    fn test_store_error_conversion() {
        let err: TopicError = StoreError::NotFound("grpX".into()).into();
        assert!(matches!(err, TopicError::NotFound(_)));

        let err: TopicError = StoreError::Duplicate("sub".into()).into();
        assert!(matches!(err, TopicError::Duplicate(_)));

        let err: TopicError = StoreError::Internal("boom".into()).into();
        assert!(matches!(err, TopicError::Storage(_)));
    }

    #[test]
    fn test_info_outcomes() {
        assert!(TopicError::NotModified.is_info());
        assert!(TopicError::NoAction.is_info());
        assert!(!TopicError::Locked.is_info());
    }

    #[test]
    fn test_display() {
        assert_eq!(TopicError::Locked.to_string(), "Topic is locked");
        assert_eq!(
            TopicError::Policy("max subscribers".into()).to_string(),
            "Policy violation: max subscribers"
        );
    }
}
