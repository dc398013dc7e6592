//! Protocol envelopes exchanged between topics and sessions.
//!
//! Server-to-client messages are transport agnostic: the topic actor enqueues a
//! [`ServerMessage`] on a session and the transport decides how to encode it.
//! Request-side types describe the parts of get/set/del requests the topic
//! actor understands.

use crate::errors::TopicError;
use chrono::{DateTime, Utc};
use common::{AccessMode, DefaultAccess, Uid};
use serde::Serialize;
use serde_json::Value;

/// Outbound message to a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMessage {
    Ctrl(MsgCtrl),
    Data(MsgData),
    Pres(MsgPres),
    Info(MsgInfo),
    Meta(MsgMeta),
}

impl ServerMessage {
    /// Topic name the message is addressed to.
    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            ServerMessage::Ctrl(m) => &m.topic,
            ServerMessage::Data(m) => &m.topic,
            ServerMessage::Pres(m) => &m.topic,
            ServerMessage::Info(m) => &m.topic,
            ServerMessage::Meta(m) => &m.topic,
        }
    }

    /// Copy of the message addressed to a different topic name.
    ///
    /// Two-party topics are known to each participant by the peer's user id.
    #[must_use]
    pub fn with_topic(&self, topic: &str) -> Self {
        let mut msg = self.clone();
        match &mut msg {
            ServerMessage::Ctrl(m) => m.topic = topic.to_string(),
            ServerMessage::Data(m) => m.topic = topic.to_string(),
            ServerMessage::Pres(m) => m.topic = topic.to_string(),
            ServerMessage::Info(m) => m.topic = topic.to_string(),
            ServerMessage::Meta(m) => m.topic = topic.to_string(),
        }
        msg
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, Serialize)]
pub struct MsgCtrl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    pub code: u16,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub ts: DateTime<Utc>,
}

impl MsgCtrl {
    fn new(id: Option<&str>, topic: &str, code: u16, text: &str, params: Option<Value>) -> Self {
        Self {
            id: id.map(ToString::to_string),
            topic: topic.to_string(),
            code,
            text: text.to_string(),
            params,
            ts: Utc::now(),
        }
    }

    #[must_use]
    pub fn ok(id: Option<&str>, topic: &str, params: Option<Value>) -> Self {
        Self::new(id, topic, 200, "ok", params)
    }

    /// Request accepted and queued, e.g. a published message.
    #[must_use]
    pub fn accepted(id: Option<&str>, topic: &str, params: Option<Value>) -> Self {
        Self::new(id, topic, 202, "accepted", params)
    }

    /// Server removed the session from the topic.
    #[must_use]
    pub fn evicted(id: Option<&str>, topic: &str, params: Option<Value>) -> Self {
        Self::new(id, topic, 205, "evicted", params)
    }

    /// Server is shutting down or the topic went away.
    #[must_use]
    pub fn shutdown(id: Option<&str>, topic: &str) -> Self {
        Self::new(id, topic, 205, "server shutdown", None)
    }

    #[must_use]
    pub fn not_modified(id: Option<&str>, topic: &str) -> Self {
        Self::new(id, topic, 304, "not modified", None)
    }

    #[must_use]
    pub fn no_action(id: Option<&str>, topic: &str) -> Self {
        Self::new(id, topic, 204, "no action", None)
    }

    /// Error reply. Never carries internal details.
    #[must_use]
    pub fn from_error(id: Option<&str>, topic: &str, err: &TopicError) -> Self {
        Self::new(id, topic, err.code(), err.client_message(), None)
    }
}

/// Content message.
#[derive(Debug, Clone, Serialize)]
pub struct MsgData {
    pub topic: String,
    pub from: Uid,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<Value>,
    pub content: Value,
    pub ts: DateTime<Utc>,
}

/// Presence or event notification.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MsgPres {
    pub topic: String,
    /// Subject of the notification: a user id or a topic name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub src: String,
    pub what: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub seq: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub clear: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delseq: Vec<DelRangeWire>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ua: String,
    /// User who caused the change.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub act: String,
    /// User affected by the change.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tgt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dacs: Option<MsgAccessDelta>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Access change descriptor in a presence notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MsgAccessDelta {
    pub want: String,
    pub given: String,
}

/// Deleted range as sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DelRangeWire {
    pub low: u64,
    pub hi: u64,
}

/// Typing and watermark notice.
#[derive(Debug, Clone, Serialize)]
pub struct MsgInfo {
    pub topic: String,
    pub from: Uid,
    pub what: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub seq: u64,
}

/// Topic metadata reply.
#[derive(Debug, Clone, Serialize)]
pub struct MsgMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<MsgTopicDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<Vec<MsgTopicSub>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<MsgDelValues>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub ts: DateTime<Utc>,
}

impl MsgMeta {
    #[must_use]
    pub fn new(id: Option<&str>, topic: &str) -> Self {
        Self {
            id: id.map(ToString::to_string),
            topic: topic.to_string(),
            desc: None,
            sub: None,
            del: None,
            tags: None,
            ts: Utc::now(),
        }
    }
}

/// Access modes of one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MsgAccessMode {
    pub want: AccessMode,
    pub given: AccessMode,
    pub mode: AccessMode,
}

impl MsgAccessMode {
    #[must_use]
    pub fn new(want: AccessMode, given: AccessMode) -> Self {
        Self {
            want,
            given,
            mode: want & given,
        }
    }
}

/// Topic description.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MsgTopicDesc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub touched: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defacs: Option<DefaultAccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acs: Option<MsgAccessMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
    #[serde(skip_serializing_if = "is_zero")]
    pub seq: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub read: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub recv: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub clear: u64,
}

/// One entry of a subscription list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MsgTopicSub {
    /// Subscriber, when listing subscribers of a topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Uid>,
    /// Topic, when listing a user's own subscriptions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub online: bool,
    pub acs: Option<MsgAccessMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
    #[serde(skip_serializing_if = "is_zero")]
    pub read: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub recv: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub clear: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub seq: u64,
}

/// Deletion log reply.
#[derive(Debug, Clone, Serialize)]
pub struct MsgDelValues {
    pub clear: u64,
    pub delseq: Vec<DelRangeWire>,
}

// ============================================================================
// Request-side types
// ============================================================================

/// Options of one part of a get request.
#[derive(Debug, Clone, Default)]
pub struct GetOpts {
    pub if_modified_since: Option<DateTime<Utc>>,
    pub since_id: u64,
    pub before_id: u64,
    pub limit: usize,
    pub user: Option<Uid>,
    pub topic: Option<String>,
}

impl GetOpts {
    /// Whether any filter that the part does not accept is set.
    #[must_use]
    pub fn has_user_or_limit(&self) -> bool {
        self.user.is_some() || self.limit > 0
    }
}

/// Parts of topic metadata a get request asks for.
#[derive(Debug, Clone, Default)]
pub struct GetQuery {
    pub desc: Option<GetOpts>,
    pub sub: Option<GetOpts>,
    pub data: Option<GetOpts>,
    pub del: Option<GetOpts>,
    pub tags: bool,
}

impl GetQuery {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.desc.is_none()
            && self.sub.is_none()
            && self.data.is_none()
            && self.del.is_none()
            && !self.tags
    }
}

/// Description update.
#[derive(Debug, Clone, Default)]
pub struct SetDesc {
    pub default_acs: Option<DefaultAccess>,
    pub public: Option<Value>,
    pub private: Option<Value>,
}

/// Subscription update. `user: None` targets the requester.
#[derive(Debug, Clone, Default)]
pub struct SetSub {
    pub user: Option<Uid>,
    pub mode: AccessMode,
}

/// Parts of topic metadata a set request changes.
#[derive(Debug, Clone, Default)]
pub struct SetQuery {
    pub desc: Option<SetDesc>,
    pub sub: Option<SetSub>,
    pub tags: Option<Vec<String>>,
}

/// What a delete request removes.
#[derive(Debug, Clone)]
pub enum DelQuery {
    /// Messages in the given ranges. `hi == 0` addresses a single message.
    Msg {
        ranges: Vec<DelRangeWire>,
        hard: bool,
    },
    /// Another user's subscription.
    Sub { user: Uid },
    /// The topic itself.
    Topic { hard: bool },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ctrl_from_error_hides_details() {
        let err = TopicError::Internal("database pool exhausted".into());
        let ctrl = MsgCtrl::from_error(Some("1"), "grpabc", &err);

        assert_eq!(ctrl.code, 500);
        assert_eq!(ctrl.text, "internal error");
        assert_eq!(ctrl.id.as_deref(), Some("1"));
    }

    #[test]
    fn test_with_topic_rewrites_every_variant() {
        let pres = ServerMessage::Pres(MsgPres {
            topic: "p2pabc".into(),
            what: "on".into(),
            ..MsgPres::default()
        });

        let rewritten = pres.with_topic("usr0000000000000002");

        assert_eq!(rewritten.topic(), "usr0000000000000002");
        assert_eq!(pres.topic(), "p2pabc");
    }

    #[test]
    fn test_pres_serialization_omits_empty_fields() {
        let pres = MsgPres {
            topic: "me".into(),
            src: "grpabc".into(),
            what: "msg".into(),
            seq: 12,
            ..MsgPres::default()
        };

        let value = serde_json::to_value(&pres).unwrap();

        assert_eq!(
            value,
            json!({"topic": "me", "src": "grpabc", "what": "msg", "seq": 12})
        );
    }

    #[test]
    fn test_access_mode_effective_value() {
        let acs = MsgAccessMode::new("JRW".parse().unwrap(), "JRWP".parse().unwrap());
        assert_eq!(acs.mode.to_string(), "JRW");

        let value = serde_json::to_value(acs).unwrap();
        assert_eq!(value, json!({"want": "JRW", "given": "JRWP", "mode": "JRW"}));
    }

    #[test]
    fn test_empty_get_query() {
        assert!(GetQuery::default().is_empty());
        let query = GetQuery {
            tags: true,
            ..GetQuery::default()
        };
        assert!(!query.is_empty());
    }
}
