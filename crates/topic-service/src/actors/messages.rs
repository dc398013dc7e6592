//! Message types for actor communication.
//!
//! Client requests enter through the hub and are forwarded unchanged to the
//! topic that owns them. Requests carry the originating session so the topic
//! can reply directly; only administrative calls use `oneshot` replies.

use crate::errors::TopicError;
use crate::protocol::{DelQuery, GetQuery, MsgPres, SetQuery};
use crate::session::Session;
use common::{AccessMode, AuthLevel, TopicCategory, Uid};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A session asks to attach to a topic.
#[derive(Debug)]
pub struct JoinRequest {
    pub id: Option<String>,
    /// Topic name as the client addressed it.
    pub topic: String,
    pub session: Arc<Session>,
    pub as_user: Uid,
    pub auth_level: AuthLevel,
    pub set: Option<SetQuery>,
    pub get: Option<GetQuery>,
    /// The topic was created by this request.
    pub(crate) created: bool,
    /// The topic actor was started for this request.
    pub(crate) loaded: bool,
    /// This request created the requester's subscription.
    pub(crate) newsub: bool,
}

impl JoinRequest {
    /// Join on behalf of the session's authenticated user.
    #[must_use]
    pub fn new(session: Arc<Session>, topic: impl Into<String>) -> Self {
        Self {
            id: None,
            topic: topic.into(),
            as_user: session.uid(),
            auth_level: session.auth_level(),
            session,
            set: None,
            get: None,
            created: false,
            loaded: false,
            newsub: false,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_set(mut self, set: SetQuery) -> Self {
        self.set = Some(set);
        self
    }

    #[must_use]
    pub fn with_get(mut self, get: GetQuery) -> Self {
        self.get = Some(get);
        self
    }
}

/// A session detaches from a topic.
#[derive(Debug)]
pub struct LeaveRequest {
    pub id: Option<String>,
    pub topic: String,
    pub session: Arc<Session>,
    /// `Uid::ZERO` detaches every identity of the session.
    pub as_user: Uid,
    /// Also delete the subscription.
    pub unsub: bool,
}

impl LeaveRequest {
    #[must_use]
    pub fn new(session: Arc<Session>, topic: impl Into<String>) -> Self {
        Self {
            id: None,
            topic: topic.into(),
            as_user: session.uid(),
            session,
            unsub: false,
        }
    }

    /// Detach the whole session, e.g. on disconnect. Never replies.
    #[must_use]
    pub fn session_gone(session: Arc<Session>, topic: impl Into<String>) -> Self {
        Self {
            id: None,
            topic: topic.into(),
            as_user: Uid::ZERO,
            session,
            unsub: false,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn unsubscribe(mut self) -> Self {
        self.unsub = true;
        self
    }
}

/// Presence filters. Empty masks and `None` users do not filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresFilters {
    /// Recipient's effective mode must share a bit with this mask.
    pub filter_in: AccessMode,
    /// Recipient's effective mode must share no bit with this mask.
    pub filter_out: AccessMode,
    pub exclude_user: Option<Uid>,
    pub single_user: Option<Uid>,
}

impl Default for PresFilters {
    fn default() -> Self {
        Self {
            filter_in: AccessMode::NONE,
            filter_out: AccessMode::NONE,
            exclude_user: None,
            single_user: None,
        }
    }
}

impl PresFilters {
    #[must_use]
    pub fn filter_in(mode: AccessMode) -> Self {
        Self {
            filter_in: mode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn excluding(mut self, uid: Uid) -> Self {
        self.exclude_user = Some(uid);
        self
    }

    /// Whether a subscriber with effective `mode` passes the masks and the
    /// user filters.
    #[must_use]
    pub fn admits(&self, uid: Uid, mode: AccessMode) -> bool {
        if self.exclude_user == Some(uid) {
            return false;
        }
        if self.single_user.is_some_and(|single| single != uid) {
            return false;
        }
        if self.filter_in != AccessMode::NONE && (mode & self.filter_in) == AccessMode::NONE {
            return false;
        }
        self.filter_out == AccessMode::NONE || (mode & self.filter_out) == AccessMode::NONE
    }
}

/// A presence notification travelling between topics.
#[derive(Debug, Clone)]
pub struct PresenceNotice {
    pub pres: MsgPres,
    pub filters: PresFilters,
    /// Skip sessions attached to this topic; they were notified there.
    pub skip_topic: Option<String>,
    /// The sender wants this user's status in return.
    pub want_reply: bool,
}

/// What a broadcast carries.
#[derive(Debug, Clone)]
pub enum BroadcastPayload {
    /// Content message to persist and fan out.
    Data { head: Option<Value>, content: Value },
    Presence(PresenceNotice),
    /// Typing notification or read/received watermark.
    Info { what: String, seq: u64 },
}

/// A message to distribute to a topic's sessions.
#[derive(Debug)]
pub struct BroadcastMessage {
    pub id: Option<String>,
    pub topic: String,
    pub session: Option<Arc<Session>>,
    pub from: Uid,
    pub skip_sid: Option<String>,
    pub payload: BroadcastPayload,
}

impl BroadcastMessage {
    /// A content message from the session's user.
    #[must_use]
    pub fn data(session: Arc<Session>, topic: impl Into<String>, content: Value) -> Self {
        Self {
            id: None,
            topic: topic.into(),
            from: session.uid(),
            session: Some(session),
            skip_sid: None,
            payload: BroadcastPayload::Data {
                head: None,
                content,
            },
        }
    }

    /// A `kp`, `read` or `recv` note. Not echoed to the sending session.
    #[must_use]
    pub fn info(
        session: Arc<Session>,
        topic: impl Into<String>,
        what: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            id: None,
            topic: topic.into(),
            from: session.uid(),
            skip_sid: Some(session.sid().to_string()),
            session: Some(session),
            payload: BroadcastPayload::Info {
                what: what.into(),
                seq,
            },
        }
    }

    /// Presence routed from another topic.
    #[must_use]
    pub fn presence(notice: PresenceNotice, skip_sid: Option<String>) -> Self {
        Self {
            id: None,
            topic: notice.pres.topic.clone(),
            session: None,
            from: Uid::ZERO,
            skip_sid,
            payload: BroadcastPayload::Presence(notice),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_head(mut self, new_head: Value) -> Self {
        if let BroadcastPayload::Data { head, .. } = &mut self.payload {
            *head = Some(new_head);
        }
        self
    }
}

/// Metadata request kinds.
#[derive(Debug, Clone)]
pub enum MetaKind {
    Get(GetQuery),
    Set(SetQuery),
    Del(DelQuery),
}

/// A metadata request from an attached session.
#[derive(Debug)]
pub struct MetaRequest {
    pub id: Option<String>,
    pub topic: String,
    pub session: Arc<Session>,
    pub as_user: Uid,
    pub auth_level: AuthLevel,
    pub kind: MetaKind,
}

impl MetaRequest {
    #[must_use]
    pub fn new(session: Arc<Session>, topic: impl Into<String>, kind: MetaKind) -> Self {
        Self {
            id: None,
            topic: topic.into(),
            as_user: session.uid(),
            auth_level: session.auth_level(),
            session,
            kind,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Why a topic actor is told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// No sessions for the idle period.
    Timeout,
    /// The topic was deleted.
    Deleted,
    /// The server is shutting down.
    Shutdown,
    /// The topic moved to another cluster node.
    Rehashing,
}

impl ExitReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Timeout => "timeout",
            ExitReason::Deleted => "deleted",
            ExitReason::Shutdown => "shutdown",
            ExitReason::Rehashing => "rehashing",
        }
    }
}

/// Messages sent to a `TopicActor`.
#[derive(Debug)]
pub enum TopicMessage {
    /// Attach a session, creating or updating its subscription.
    Join(Box<JoinRequest>),

    /// Detach a session, optionally unsubscribing.
    Leave(Box<LeaveRequest>),

    /// Data, presence or info to distribute.
    Broadcast(Box<BroadcastMessage>),

    /// Get, set or delete metadata.
    Meta(Box<MetaRequest>),

    /// The user agent of the `me` topic's user changed. Debounced.
    UaChange(String),

    /// Stop the actor. `done` is signalled once sessions are detached.
    Exit {
        reason: ExitReason,
        done: Option<oneshot::Sender<()>>,
    },

    /// Snapshot of the topic state.
    GetState {
        respond_to: oneshot::Sender<TopicState>,
    },
}

impl TopicMessage {
    /// Label used for latency metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            TopicMessage::Join(_) => "join",
            TopicMessage::Leave(_) => "leave",
            TopicMessage::Broadcast(_) => "broadcast",
            TopicMessage::Meta(_) => "meta",
            TopicMessage::UaChange(_) => "ua",
            TopicMessage::Exit { .. } => "exit",
            TopicMessage::GetState { .. } => "state",
        }
    }
}

/// Who asked for a topic deletion, so the hub can answer once it is done.
#[derive(Debug)]
pub struct Requester {
    pub session: Arc<Session>,
    pub id: Option<String>,
    /// Topic name as the requester sees it.
    pub topic: String,
}

/// Messages sent to the `HubActor`.
#[derive(Debug)]
pub enum HubMessage {
    /// Attach a session, starting the topic if needed.
    Join(Box<JoinRequest>),

    Leave(Box<LeaveRequest>),

    /// Client-originated data or info.
    Publish(Box<BroadcastMessage>),

    Meta(Box<MetaRequest>),

    /// Forward to a running topic by internal name. Never starts a topic.
    Route { topic: String, msg: TopicMessage },

    /// A topic stopped on its own.
    TopicStopped { name: String, instance: u64 },

    /// Stop a topic, deleting it from storage first if `reason` is
    /// `Deleted`.
    Unregister {
        topic: String,
        reason: ExitReason,
        requester: Option<Requester>,
        respond_to: Option<oneshot::Sender<Result<(), TopicError>>>,
    },

    /// Look up a running topic by internal name.
    GetTopic {
        topic: String,
        respond_to: oneshot::Sender<Option<super::topic::TopicHandle>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<HubStatus>,
    },

    /// Stop every topic and the session registry.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Cached state of one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberState {
    pub user: Uid,
    pub want: AccessMode,
    pub given: AccessMode,
    pub online: usize,
    pub read_id: u64,
    pub recv_id: u64,
    pub del_id: u64,
    pub deleted: bool,
}

/// Snapshot of a topic for status queries and tests.
#[derive(Debug, Clone)]
pub struct TopicState {
    pub name: String,
    pub category: TopicCategory,
    pub owner: Uid,
    pub last_id: u64,
    pub del_id: u64,
    pub sessions: usize,
    pub suspended: bool,
    pub subscribers: Vec<SubscriberState>,
}

impl TopicState {
    #[must_use]
    pub fn subscriber(&self, uid: Uid) -> Option<&SubscriberState> {
        self.subscribers.iter().find(|s| s.user == uid)
    }
}

/// Hub status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStatus {
    pub topic_count: usize,
    pub session_count: usize,
    pub mailbox_depth: usize,
    pub messages_processed: u64,
    pub panics: u64,
    pub stuck_detaches: u64,
    pub suspensions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_default_admits_everyone() {
        let filters = PresFilters::default();
        assert!(filters.admits(Uid::new(1), AccessMode::NONE));
    }

    #[test]
    fn test_filter_in_and_out() {
        let uid = Uid::new(1);
        let sharers = PresFilters::filter_in(AccessMode::CSHARER);
        assert!(sharers.admits(uid, AccessMode::JOIN | AccessMode::APPROVE));
        assert!(!sharers.admits(uid, AccessMode::CPUBLIC));

        let no_writers = PresFilters {
            filter_out: AccessMode::WRITE,
            ..PresFilters::default()
        };
        assert!(no_writers.admits(uid, AccessMode::JOIN | AccessMode::READ));
        assert!(!no_writers.admits(uid, AccessMode::CPUBLIC));
    }

    #[test]
    fn test_user_filters() {
        let alice = Uid::new(1);
        let bob = Uid::new(2);

        let excluding = PresFilters::default().excluding(alice);
        assert!(!excluding.admits(alice, AccessMode::CFULL));
        assert!(excluding.admits(bob, AccessMode::CFULL));

        let single = PresFilters {
            single_user: Some(bob),
            ..PresFilters::default()
        };
        assert!(!single.admits(alice, AccessMode::CFULL));
        assert!(single.admits(bob, AccessMode::CFULL));
    }

    #[test]
    fn test_exit_reason_labels() {
        assert_eq!(ExitReason::Deleted.as_str(), "deleted");
        assert_eq!(ExitReason::Rehashing.as_str(), "rehashing");
    }
}
