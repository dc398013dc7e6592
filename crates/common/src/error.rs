//! Common error types for topic service value parsing.

use thiserror::Error;

/// Errors produced when parsing wire-level value types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Access mode string contained a character outside `JRWPASDON`.
    #[error("Invalid access mode character: {0:?}")]
    InvalidModeChar(char),

    /// User id string is not of the form `usr<hex>`.
    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    /// Authentication level name is unknown.
    #[error("Invalid auth level: {0}")]
    InvalidAuthLevel(String),
}

/// Result type alias using `ParseError`
pub type Result<T> = std::result::Result<T, ParseError>;
