//! Live client sessions.
//!
//! A [`Session`] is the transport-agnostic handle topics use to reach a
//! connected client. Topics only ever enqueue envelopes, ask the session to
//! forget a topic, or stop it. All three are non-blocking: a full outbound
//! queue is reported back so the caller can drop the slow consumer.
//!
//! The transport side owns the matching [`SessionReceivers`].

pub mod registry;

pub use registry::SessionStore;

use crate::protocol::ServerMessage;
use common::{AuthLevel, Uid};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Capacity of the stop channel. One stop request is enough.
const STOP_CHANNEL_CAPACITY: usize = 1;

/// Transport kind of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionProto {
    WebSocket,
    /// Long polling. No persistent connection, so idle sessions expire.
    LongPoll,
    /// Proxy for a session on another cluster node.
    Cluster,
    Grpc,
}

impl SessionProto {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionProto::WebSocket => "ws",
            SessionProto::LongPoll => "lp",
            SessionProto::Cluster => "cluster",
            SessionProto::Grpc => "grpc",
        }
    }
}

#[derive(Debug)]
struct SessionState {
    uid: Uid,
    auth_level: AuthLevel,
    user_agent: String,
    device_id: String,
    last_touched: Instant,
    subs: HashSet<String>,
}

/// Handle to a live session.
#[derive(Debug)]
pub struct Session {
    sid: String,
    proto: SessionProto,
    send: mpsc::Sender<ServerMessage>,
    detach: mpsc::Sender<String>,
    stop: mpsc::Sender<Option<ServerMessage>>,
    state: Mutex<SessionState>,
}

/// Receiving ends of a session's channels, owned by the transport.
#[derive(Debug)]
pub struct SessionReceivers {
    /// Envelopes to write to the client.
    pub send: mpsc::Receiver<ServerMessage>,
    /// Names of topics the session was detached from.
    pub detach: mpsc::Receiver<String>,
    /// Stop request, with an optional final message.
    pub stop: mpsc::Receiver<Option<ServerMessage>>,
}

impl Session {
    /// Create a session and its receiving channels.
    #[must_use]
    pub fn new(
        sid: String,
        proto: SessionProto,
        queue_capacity: usize,
        detach_capacity: usize,
    ) -> (Self, SessionReceivers) {
        let (send_tx, send_rx) = mpsc::channel(queue_capacity.max(1));
        let (detach_tx, detach_rx) = mpsc::channel(detach_capacity.max(1));
        let (stop_tx, stop_rx) = mpsc::channel(STOP_CHANNEL_CAPACITY);

        let session = Self {
            sid,
            proto,
            send: send_tx,
            detach: detach_tx,
            stop: stop_tx,
            state: Mutex::new(SessionState {
                uid: Uid::ZERO,
                auth_level: AuthLevel::None,
                user_agent: String::new(),
                device_id: String::new(),
                last_touched: Instant::now(),
                subs: HashSet::new(),
            }),
        };
        let receivers = SessionReceivers {
            send: send_rx,
            detach: detach_rx,
            stop: stop_rx,
        };
        (session, receivers)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn sid(&self) -> &str {
        &self.sid
    }

    #[must_use]
    pub fn proto(&self) -> SessionProto {
        self.proto
    }

    /// Authenticated user, `Uid::ZERO` before login.
    #[must_use]
    pub fn uid(&self) -> Uid {
        self.state().uid
    }

    #[must_use]
    pub fn auth_level(&self) -> AuthLevel {
        self.state().auth_level
    }

    /// Bind the session to a user after authentication.
    pub fn authenticate(&self, uid: Uid, level: AuthLevel) {
        let mut state = self.state();
        state.uid = uid;
        state.auth_level = level;
    }

    #[must_use]
    pub fn user_agent(&self) -> String {
        self.state().user_agent.clone()
    }

    pub fn set_user_agent(&self, ua: impl Into<String>) {
        self.state().user_agent = ua.into();
    }

    #[must_use]
    pub fn device_id(&self) -> String {
        self.state().device_id.clone()
    }

    pub fn set_device_id(&self, device_id: impl Into<String>) {
        self.state().device_id = device_id.into();
    }

    /// Mark activity now.
    pub fn touch(&self) {
        self.state().last_touched = Instant::now();
    }

    #[must_use]
    pub fn last_touched(&self) -> Instant {
        self.state().last_touched
    }

    /// Remember that the session is attached to `topic`.
    pub fn add_sub(&self, topic: &str) {
        self.state().subs.insert(topic.to_string());
    }

    #[must_use]
    pub fn has_sub(&self, topic: &str) -> bool {
        self.state().subs.contains(topic)
    }

    pub fn del_sub(&self, topic: &str) {
        self.state().subs.remove(topic);
    }

    /// Topics the session is attached to.
    #[must_use]
    pub fn subs(&self) -> Vec<String> {
        self.state().subs.iter().cloned().collect()
    }

    /// Enqueue an envelope without blocking.
    ///
    /// Returns `false` when the queue is full or the transport is gone.
    pub fn queue_out(&self, msg: ServerMessage) -> bool {
        self.send.try_send(msg).is_ok()
    }

    /// Forget `topic` and tell the transport about it.
    pub fn detach(&self, topic: &str) {
        self.del_sub(topic);
        // Transport may already be gone.
        let _ = self.detach.try_send(topic.to_string());
    }

    /// Ask the transport to terminate the session.
    pub fn stop(&self, last: Option<ServerMessage>) {
        let _ = self.stop.try_send(last);
    }
}
