//! Running hub and connected test clients.
//!
//! [`TestServer`] starts a hub over a [`MemoryStore`] with recording push
//! and plugin sinks. [`TestClient`] is an authenticated session whose
//! outbound queue the test reads directly.
//!
//! ```rust,ignore
//! let server = TestServer::start(MemoryStore::new().with_user(User::new(alice))).await;
//! let mut client = server.connect(alice);
//! client.join("me", "1").await;
//! assert_eq!(client.next_ctrl().await.code, 200);
//! ```

use crate::memory_store::MemoryStore;
use crate::recording::{RecordingPlugins, RecordingPush};
use common::{AuthLevel, Uid};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use topic_service::actors::{
    BroadcastMessage, HubActor, HubHandle, JoinRequest, LeaveRequest, MetaKind, MetaRequest,
};
use topic_service::config::Config;
use topic_service::context::ServerContext;
use topic_service::protocol::{MsgCtrl, MsgData, MsgMeta, MsgPres, ServerMessage};
use topic_service::session::{Session, SessionProto, SessionReceivers};

/// How long a client waits for an expected message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration with short timers for tests.
#[must_use]
pub fn test_config() -> Config {
    test_config_with(&[])
}

/// [`test_config`] with some variables overridden.
#[must_use]
pub fn test_config_with(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("TOPIC_IDLE_TIMEOUT_MS", "200"),
        ("TOPIC_UA_DEBOUNCE_MS", "20"),
        ("TOPIC_MAX_SUBSCRIBERS", "16"),
        ("TOPIC_MAX_DELETE_COUNT", "32"),
        ("SESSION_QUEUE_CAPACITY", "64"),
        ("HUB_SHUTDOWN_TIMEOUT_SECONDS", "1"),
        ("SERVER_ID", "topic-test"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert((*k).to_string(), (*v).to_string());
    }
    Config::from_vars(&vars).expect("test config is valid")
}

/// A hub running over in-memory collaborators.
pub struct TestServer {
    pub hub: HubHandle,
    pub ctx: ServerContext,
    pub store: MemoryStore,
    pub push: RecordingPush,
    pub plugins: RecordingPlugins,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(store: MemoryStore) -> Self {
        Self::start_with(store, test_config(), RecordingPlugins::new()).await
    }

    pub async fn start_with(store: MemoryStore, config: Config, plugins: RecordingPlugins) -> Self {
        let push = RecordingPush::new();
        let ctx = ServerContext::new(config, Arc::new(store.clone()))
            .with_push(Arc::new(push.clone()))
            .with_plugins(Arc::new(plugins.clone()));
        let (hub, task) = HubActor::spawn(ctx.clone());
        Self {
            hub,
            ctx,
            store,
            push,
            plugins,
            task,
        }
    }

    /// Open a WebSocket session authenticated as `uid`.
    #[must_use]
    pub fn connect(&self, uid: Uid) -> TestClient {
        self.connect_with(uid, SessionProto::WebSocket)
    }

    #[must_use]
    pub fn connect_with(&self, uid: Uid, proto: SessionProto) -> TestClient {
        let (session, rx, _) = self.ctx.sessions.new_session(proto, None);
        session.authenticate(uid, AuthLevel::Auth);
        TestClient {
            session,
            rx,
            hub: self.hub.clone(),
        }
    }

    /// Shut the hub down and wait for its task.
    pub async fn stop(self) {
        self.hub.shutdown().await.expect("hub shutdown");
        tokio::time::timeout(RECV_TIMEOUT, self.task)
            .await
            .expect("hub stopped in time")
            .expect("hub task did not panic");
    }
}

/// An authenticated session driven by a test.
pub struct TestClient {
    pub session: Arc<Session>,
    pub rx: SessionReceivers,
    hub: HubHandle,
}

impl TestClient {
    #[must_use]
    pub fn uid(&self) -> Uid {
        self.session.uid()
    }

    pub async fn join(&self, topic: &str, id: &str) {
        self.join_with(JoinRequest::new(Arc::clone(&self.session), topic).with_id(id))
            .await;
    }

    pub async fn join_with(&self, req: JoinRequest) {
        self.hub.join(req).await.expect("hub accepts join");
    }

    pub async fn leave(&self, topic: &str, id: &str, unsub: bool) {
        let mut req = LeaveRequest::new(Arc::clone(&self.session), topic).with_id(id);
        if unsub {
            req = req.unsubscribe();
        }
        self.hub.leave(req).await.expect("hub accepts leave");
    }

    pub async fn publish(&self, topic: &str, id: &str, content: Value) {
        let msg = BroadcastMessage::data(Arc::clone(&self.session), topic, content).with_id(id);
        self.hub.publish(msg).await.expect("hub accepts publish");
    }

    pub async fn note(&self, topic: &str, what: &str, seq: u64) {
        let msg = BroadcastMessage::info(Arc::clone(&self.session), topic, what, seq);
        self.hub.publish(msg).await.expect("hub accepts note");
    }

    pub async fn meta(&self, topic: &str, id: &str, kind: MetaKind) {
        let req = MetaRequest::new(Arc::clone(&self.session), topic, kind).with_id(id);
        self.hub.meta(req).await.expect("hub accepts meta");
    }

    /// Next outbound message.
    pub async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.send.recv())
            .await
            .expect("message within timeout")
            .expect("session queue open")
    }

    /// Next control reply, skipping anything else.
    pub async fn next_ctrl(&mut self) -> MsgCtrl {
        loop {
            if let ServerMessage::Ctrl(ctrl) = self.recv().await {
                return ctrl;
            }
        }
    }

    /// Control reply with the given request id.
    pub async fn ctrl_for(&mut self, id: &str) -> MsgCtrl {
        loop {
            let ctrl = self.next_ctrl().await;
            if ctrl.id.as_deref() == Some(id) {
                return ctrl;
            }
        }
    }

    pub async fn next_data(&mut self) -> MsgData {
        loop {
            if let ServerMessage::Data(data) = self.recv().await {
                return data;
            }
        }
    }

    pub async fn next_meta(&mut self) -> MsgMeta {
        loop {
            if let ServerMessage::Meta(meta) = self.recv().await {
                return meta;
            }
        }
    }

    /// Next presence notice of kind `what`.
    pub async fn next_pres(&mut self, what: &str) -> MsgPres {
        loop {
            if let ServerMessage::Pres(pres) = self.recv().await {
                if pres.what == what {
                    return pres;
                }
            }
        }
    }

    /// Discard everything queued so far.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.send.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Assert nothing arrives for `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(msg)) = tokio::time::timeout(wait, self.rx.send.recv()).await {
            panic!("unexpected message: {msg:?}");
        }
    }

    /// Next topic the session was detached from.
    pub async fn detached(&mut self) -> String {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.detach.recv())
            .await
            .expect("detach within timeout")
            .expect("detach queue open")
    }
}
