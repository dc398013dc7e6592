//! Process-wide registry of live sessions.
//!
//! Sessions are keyed by id. Long-poll sessions have no persistent connection
//! and are additionally kept in a recency list, most recent first, so stale
//! ones can be expired from the back. One mutex guards both structures;
//! sessions removed under the lock are stopped after it is released.

use super::{Session, SessionProto, SessionReceivers};
use crate::config::Config;
use crate::observability::metrics;
use crate::protocol::{MsgCtrl, ServerMessage};
use common::Uid;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    /// Long-poll session ids, most recently touched first.
    lru: VecDeque<String>,
}

impl Registry {
    fn lru_remove(&mut self, sid: &str) {
        if let Some(pos) = self.lru.iter().position(|s| s == sid) {
            self.lru.remove(pos);
        }
    }

    fn remove(&mut self, sid: &str) -> Option<Arc<Session>> {
        let session = self.sessions.remove(sid)?;
        if session.proto() == SessionProto::LongPoll {
            self.lru_remove(sid);
        }
        Some(session)
    }
}

/// Session registry.
pub struct SessionStore {
    inner: Mutex<Registry>,
    lp_lifetime: Duration,
    queue_capacity: usize,
    detach_capacity: usize,
}

impl SessionStore {
    #[must_use]
    pub fn new(lp_lifetime: Duration, queue_capacity: usize, detach_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            lp_lifetime,
            queue_capacity,
            detach_capacity,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.lp_session_lifetime,
            config.session_queue_capacity,
            config.session_detach_capacity,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session.
    ///
    /// A missing `sid` gets a random one. Long-poll sessions idle for longer
    /// than the configured lifetime are expired in the same critical section.
    /// Returns the session, its receivers and the live session count.
    pub fn new_session(
        &self,
        proto: SessionProto,
        sid: Option<String>,
    ) -> (Arc<Session>, SessionReceivers, usize) {
        let sid = sid.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let (session, receivers) =
            Session::new(sid.clone(), proto, self.queue_capacity, self.detach_capacity);
        let session = Arc::new(session);

        let (expired, count) = {
            let mut reg = self.lock();
            if let Some(old) = reg.sessions.insert(sid.clone(), Arc::clone(&session)) {
                if old.proto() == SessionProto::LongPoll {
                    reg.lru_remove(&sid);
                }
            }
            if proto == SessionProto::LongPoll {
                reg.lru.push_front(sid.clone());
            }

            let mut expired = Vec::new();
            let now = Instant::now();
            while let Some(oldest) = reg.lru.back().cloned() {
                let Some(candidate) = reg.sessions.get(&oldest) else {
                    reg.lru.pop_back();
                    continue;
                };
                if candidate.last_touched() + self.lp_lifetime >= now {
                    break;
                }
                reg.lru.pop_back();
                if let Some(stale) = reg.sessions.remove(&oldest) {
                    expired.push(stale);
                }
            }
            (expired, reg.sessions.len())
        };

        for stale in &expired {
            debug!(
                target: "topic.session.registry",
                sid = %stale.sid(),
                "Long-poll session expired"
            );
            stale.stop(None);
            metrics::record_session_evicted("expired");
        }
        metrics::set_sessions_live(count as u64);

        (session, receivers, count)
    }

    /// Look up a session. Refreshes recency of long-poll sessions.
    pub fn get(&self, sid: &str) -> Option<Arc<Session>> {
        let mut reg = self.lock();
        let session = reg.sessions.get(sid).cloned()?;
        if session.proto() == SessionProto::LongPoll {
            reg.lru_remove(sid);
            reg.lru.push_front(sid.to_string());
            session.touch();
        }
        Some(session)
    }

    /// Remove a session, e.g. when its transport closed.
    pub fn delete(&self, session: &Session) {
        let count = {
            let mut reg = self.lock();
            reg.remove(session.sid());
            reg.sessions.len()
        };
        metrics::set_sessions_live(count as u64);
    }

    /// Terminate every session of `uid` except `skip_sid`.
    pub fn evict_user(&self, uid: Uid, skip_sid: Option<&str>) {
        let (evicted, count) = {
            let mut reg = self.lock();
            let sids: Vec<String> = reg
                .sessions
                .values()
                .filter(|s| s.uid() == uid && Some(s.sid()) != skip_sid)
                .map(|s| s.sid().to_string())
                .collect();
            let evicted: Vec<Arc<Session>> = sids.iter().filter_map(|sid| reg.remove(sid)).collect();
            (evicted, reg.sessions.len())
        };

        for session in &evicted {
            session.stop(Some(ServerMessage::Ctrl(MsgCtrl::evicted(
                None,
                "",
                Some(json!({"reason": "user evicted"})),
            ))));
            metrics::record_session_evicted("user");
        }
        if !evicted.is_empty() {
            info!(
                target: "topic.session.registry",
                user = %uid,
                sessions = evicted.len(),
                "User sessions evicted"
            );
        }
        metrics::set_sessions_live(count as u64);
    }

    /// Ask every non-cluster session to terminate. Does not wait.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.lock().sessions.values().cloned().collect();
        let mut stopped = 0usize;
        for session in sessions
            .iter()
            .filter(|s| s.proto() != SessionProto::Cluster)
        {
            session.stop(Some(ServerMessage::Ctrl(MsgCtrl::shutdown(None, ""))));
            stopped += 1;
        }
        info!(
            target: "topic.session.registry",
            sessions = stopped,
            "Session registry shut down"
        );
    }

    /// Live session count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::AuthLevel;

    fn store() -> SessionStore {
        SessionStore::new(Duration::from_secs(55), 8, 8)
    }

    #[tokio::test]
    async fn test_new_session_assigns_id_and_counts() {
        let store = store();

        let (a, _rx_a, count) = store.new_session(SessionProto::WebSocket, None);
        assert_eq!(count, 1);
        assert!(!a.sid().is_empty());

        let (b, _rx_b, count) = store.new_session(SessionProto::WebSocket, Some("fixed".into()));
        assert_eq!(count, 2);
        assert_eq!(b.sid(), "fixed");
        assert!(store.get("fixed").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_sessions_expire_from_the_back() {
        let store = store();
        let (_old, mut old_rx, _) = store.new_session(SessionProto::LongPoll, Some("old".into()));
        let (_ws, _ws_rx, _) = store.new_session(SessionProto::WebSocket, Some("ws".into()));

        tokio::time::advance(Duration::from_secs(30)).await;
        let (_mid, _mid_rx, _) = store.new_session(SessionProto::LongPoll, Some("mid".into()));

        tokio::time::advance(Duration::from_secs(30)).await;
        let (_new, _new_rx, count) = store.new_session(SessionProto::LongPoll, Some("new".into()));

        // "old" is 60s idle, "mid" 30s, websocket sessions never expire.
        assert_eq!(count, 3);
        assert!(store.get("old").is_none());
        assert!(store.get("mid").is_some());
        assert!(store.get("ws").is_some());
        assert!(old_rx.stop.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_refreshes_long_poll_recency() {
        let store = store();
        let (_a, _rx_a, _) = store.new_session(SessionProto::LongPoll, Some("a".into()));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(store.get("a").is_some());

        tokio::time::advance(Duration::from_secs(50)).await;
        let (_b, _rx_b, count) = store.new_session(SessionProto::LongPoll, Some("b".into()));

        assert_eq!(count, 2);
        assert!(store.get("a").is_some());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store();
        let (a, _rx, _) = store.new_session(SessionProto::LongPoll, None);

        store.delete(&a);

        assert!(store.is_empty());
        assert!(store.get(a.sid()).is_none());
    }

    #[tokio::test]
    async fn test_evict_user_skips_requesting_session() {
        let store = store();
        let alice = Uid::new(1);
        let (a1, mut rx1, _) = store.new_session(SessionProto::WebSocket, Some("a1".into()));
        let (a2, mut rx2, _) = store.new_session(SessionProto::LongPoll, Some("a2".into()));
        let (b, mut rx_b, _) = store.new_session(SessionProto::WebSocket, Some("b".into()));
        a1.authenticate(alice, AuthLevel::Auth);
        a2.authenticate(alice, AuthLevel::Auth);
        b.authenticate(Uid::new(2), AuthLevel::Auth);

        store.evict_user(alice, Some("a1"));

        assert!(store.get("a1").is_some());
        assert!(store.get("a2").is_none());
        assert!(store.get("b").is_some());
        assert!(rx1.stop.try_recv().is_err());
        assert!(rx2.stop.try_recv().unwrap().is_some());
        assert!(rx_b.stop.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_skips_cluster_sessions() {
        let store = store();
        let (_ws, mut ws_rx, _) = store.new_session(SessionProto::WebSocket, None);
        let (_cl, mut cl_rx, _) = store.new_session(SessionProto::Cluster, None);

        store.shutdown();

        assert!(ws_rx.stop.try_recv().is_ok());
        assert!(cl_rx.stop.try_recv().is_err());
    }
}
