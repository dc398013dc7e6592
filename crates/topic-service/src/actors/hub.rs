//! `HubActor` - singleton supervisor for topic actors.
//!
//! The hub:
//!
//! - Resolves client topic names and starts topic actors on first join
//! - Routes client requests and inter-topic presence to running topics
//! - Stops topics on request, deleting them from storage first when asked
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! The hub never awaits a topic's mailbox: deliveries use `try_send`, and a
//! full mailbox is reported to the client as `Busy`. Topic initialization
//! (storage reads for the first join) runs inline on the hub task.
//!
//! # Graceful Shutdown
//!
//! On shutdown or cancellation the hub:
//! 1. Tells every topic to exit with `ExitReason::Shutdown`
//! 2. Waits up to `shutdown_timeout` for them to finish
//! 3. Cancels whatever is left
//! 4. Stops all sessions in the registry

use super::init;
use super::messages::{
    BroadcastMessage, ExitReason, HubMessage, HubStatus, JoinRequest, LeaveRequest, MetaRequest,
    Requester, TopicMessage, TopicState,
};
use super::metrics::{ActorType, MailboxMonitor};
use super::topic::{reply_error, TopicActor, TopicHandle};
use crate::context::ServerContext;
use crate::errors::TopicError;
use crate::observability::metrics;
use crate::protocol::{MsgCtrl, ServerMessage};
use crate::session::Session;
use crate::store::StoreError;

use common::{TopicCategory, Uid};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Channel buffer size for the hub mailbox.
const HUB_CHANNEL_BUFFER: usize = 1024;

/// Handle to the `HubActor`.
///
/// Async methods wait for mailbox space. Sync methods are used by topic
/// actors and never block; they return `false` when the hub is saturated.
#[derive(Clone, Debug)]
pub struct HubHandle {
    sender: mpsc::Sender<HubMessage>,
    cancel_token: CancellationToken,
}

impl HubHandle {
    async fn send(&self, msg: HubMessage) -> Result<(), TopicError> {
        self.sender
            .send(msg)
            .await
            .map_err(|e| TopicError::Internal(format!("channel send failed: {e}")))
    }

    fn try_send(&self, msg: HubMessage) -> bool {
        match self.sender.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    target: "topic.actor.hub",
                    error = %e,
                    "Hub mailbox unavailable, dropping message"
                );
                false
            }
        }
    }

    /// Attach a session to a topic. The outcome is sent to the session.
    pub async fn join(&self, req: JoinRequest) -> Result<(), TopicError> {
        self.send(HubMessage::Join(Box::new(req))).await
    }

    pub async fn leave(&self, req: LeaveRequest) -> Result<(), TopicError> {
        self.send(HubMessage::Leave(Box::new(req))).await
    }

    /// Publish data or an info note to an attached topic.
    pub async fn publish(&self, msg: BroadcastMessage) -> Result<(), TopicError> {
        self.send(HubMessage::Publish(Box::new(msg))).await
    }

    pub async fn meta(&self, req: MetaRequest) -> Result<(), TopicError> {
        self.send(HubMessage::Meta(Box::new(req))).await
    }

    /// Forward to a running topic by internal name.
    pub fn route(&self, topic: &str, msg: TopicMessage) -> bool {
        self.try_send(HubMessage::Route {
            topic: topic.to_string(),
            msg,
        })
    }

    /// The user's agent changed; their `me` topic announces it.
    pub fn user_agent_changed(&self, uid: Uid, ua: impl Into<String>) -> bool {
        self.route(&uid.user_id(), TopicMessage::UaChange(ua.into()))
    }

    /// Detach a closed session from every topic it is attached to.
    pub fn session_closed(&self, session: &Arc<Session>) {
        for topic in session.subs() {
            let leave = LeaveRequest::session_gone(Arc::clone(session), topic.as_str());
            self.route(&topic, TopicMessage::Leave(Box::new(leave)));
        }
    }

    pub(crate) fn topic_stopped(&self, name: &str, instance: u64) {
        self.try_send(HubMessage::TopicStopped {
            name: name.to_string(),
            instance,
        });
    }

    /// Re-enter a join that reached a stopping topic.
    pub(crate) fn rejoin(&self, req: Box<JoinRequest>) {
        self.try_send(HubMessage::Join(req));
    }

    /// Delete a topic on a client's behalf. The hub answers the requester.
    pub(crate) fn request_delete(&self, topic: &str, requester: Requester) -> bool {
        self.try_send(HubMessage::Unregister {
            topic: topic.to_string(),
            reason: ExitReason::Deleted,
            requester: Some(requester),
            respond_to: None,
        })
    }

    /// Stop a topic, deleting it from storage first for `ExitReason::Deleted`.
    ///
    /// Resolves once the topic has exited or the shutdown timeout passed.
    pub async fn unregister(&self, topic: &str, reason: ExitReason) -> Result<(), TopicError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::Unregister {
            topic: topic.to_string(),
            reason,
            requester: None,
            respond_to: Some(tx),
        })
        .await?;

        rx.await
            .map_err(|e| TopicError::Internal(format!("response receive failed: {e}")))?
    }

    /// Handle of a running topic, `None` if it is not running.
    pub async fn topic_handle(&self, topic: &str) -> Result<Option<TopicHandle>, TopicError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::GetTopic {
            topic: topic.to_string(),
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| TopicError::Internal(format!("response receive failed: {e}")))
    }

    /// Snapshot of a running topic, `None` if it is not running.
    pub async fn topic_state(&self, topic: &str) -> Result<Option<TopicState>, TopicError> {
        match self.topic_handle(topic).await? {
            Some(handle) => handle.get_state().await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn status(&self) -> Result<HubStatus, TopicError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::GetStatus { respond_to: tx }).await?;

        rx.await
            .map_err(|e| TopicError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop all topics and sessions. Resolves when the hub is done.
    pub async fn shutdown(&self) -> Result<(), TopicError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::Shutdown { respond_to: tx }).await?;

        rx.await
            .map_err(|e| TopicError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the hub and, through child tokens, every topic.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// A running topic.
struct ManagedTopic {
    handle: TopicHandle,
    task_handle: JoinHandle<()>,
}

/// The `HubActor` implementation.
pub struct HubActor {
    ctx: ServerContext,
    receiver: mpsc::Receiver<HubMessage>,
    cancel_token: CancellationToken,
    /// Given to topics so they can reach the hub.
    handle: HubHandle,
    /// Running topics by internal name.
    topics: HashMap<String, ManagedTopic>,
    next_instance: u64,
    mailbox: MailboxMonitor,
}

impl HubActor {
    /// Spawn the hub.
    ///
    /// Returns a handle and the task join handle.
    #[must_use]
    pub fn spawn(ctx: ServerContext) -> (HubHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(HUB_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let handle = HubHandle {
            sender,
            cancel_token: cancel_token.clone(),
        };
        let mailbox = MailboxMonitor::new(ActorType::Hub, ctx.config.server_id.clone());

        let actor = Self {
            ctx,
            receiver,
            cancel_token,
            handle: handle.clone(),
            topics: HashMap::new(),
            next_instance: 1,
            mailbox,
        };

        let task_handle = tokio::spawn(actor.run());
        (handle, task_handle)
    }

    #[instrument(skip_all, name = "topic.actor.hub", fields(server_id = %self.ctx.config.server_id))]
    async fn run(mut self) {
        info!(
            target: "topic.actor.hub",
            server_id = %self.ctx.config.server_id,
            "HubActor started"
        );

        loop {
            self.check_topic_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "topic.actor.hub",
                        "HubActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let flow = self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());
                            self.ctx.metrics.record_message_processed();
                            if flow.is_break() {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "topic.actor.hub",
                                "HubActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "topic.actor.hub",
            topics_remaining = self.topics.len(),
            messages_processed = self.mailbox.messages_processed(),
            "HubActor stopped"
        );
    }

    async fn handle_message(&mut self, message: HubMessage) -> ControlFlow<()> {
        match message {
            HubMessage::Join(req) => self.handle_join(req).await,
            HubMessage::Leave(req) => {
                let as_uid = if req.as_user.is_zero() {
                    req.session.uid()
                } else {
                    req.as_user
                };
                let (session, id, topic) = (Arc::clone(&req.session), req.id.clone(), req.topic.clone());
                self.forward(&session, id.as_deref(), &topic, as_uid, false, TopicMessage::Leave(req));
            }
            HubMessage::Publish(msg) => {
                let Some(session) = msg.session.clone() else {
                    debug!(target: "topic.actor.hub", "Publish without a session dropped");
                    return ControlFlow::Continue(());
                };
                let (id, topic, from) = (msg.id.clone(), msg.topic.clone(), msg.from);
                self.forward(&session, id.as_deref(), &topic, from, true, TopicMessage::Broadcast(msg));
            }
            HubMessage::Meta(req) => {
                let (session, id, topic, as_uid) =
                    (Arc::clone(&req.session), req.id.clone(), req.topic.clone(), req.as_user);
                self.forward(&session, id.as_deref(), &topic, as_uid, false, TopicMessage::Meta(req));
            }
            HubMessage::Route { topic, msg } => self.route(&topic, msg),
            HubMessage::TopicStopped { name, instance } => self.topic_stopped(&name, instance),
            HubMessage::Unregister {
                topic,
                reason,
                requester,
                respond_to,
            } => self.unregister(topic, reason, requester, respond_to).await,
            HubMessage::GetTopic { topic, respond_to } => {
                let handle = self.topics.get(&topic).map(|m| m.handle.clone());
                let _ = respond_to.send(handle);
            }
            HubMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }
            HubMessage::Shutdown { respond_to } => {
                self.graceful_shutdown().await;
                let _ = respond_to.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Deliver a join to its topic, starting the topic if it is not running.
    async fn handle_join(&mut self, mut req: Box<JoinRequest>) {
        let (name, category, create) = match init::resolve_join_name(&req.topic, req.as_user) {
            Ok(resolved) => resolved,
            Err(e) => {
                reply_error(&req.session, req.id.as_deref(), &req.topic, &e);
                return;
            }
        };

        if let Some(managed) = self.topics.get(&name) {
            let (session, id, topic) = (Arc::clone(&req.session), req.id.clone(), req.topic.clone());
            match managed.handle.try_deliver(TopicMessage::Join(req)) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        target: "topic.actor.hub",
                        topic = %name,
                        "Topic mailbox full, join rejected"
                    );
                    reply_error(&session, id.as_deref(), &topic, &TopicError::Busy);
                    return;
                }
                Err(TrySendError::Closed(TopicMessage::Join(returned))) => {
                    // Stopping; its TopicStopped is still in our mailbox.
                    self.topics.remove(&name);
                    req = returned;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }

        let seed = match init::load_seed(&self.ctx, &mut req, name.clone(), category, create).await {
            Ok(seed) => seed,
            Err(e) => {
                debug!(
                    target: "topic.actor.hub",
                    topic = %name,
                    error = %e,
                    "Topic initialization failed"
                );
                reply_error(&req.session, req.id.as_deref(), &req.topic, &e);
                return;
            }
        };

        let instance = self.next_instance;
        self.next_instance += 1;
        let (handle, task_handle) = TopicActor::spawn(
            seed,
            instance,
            self.ctx.clone(),
            self.handle.clone(),
            self.cancel_token.child_token(),
        );

        if let Err(e) = handle.try_deliver(TopicMessage::Join(req)) {
            error!(
                target: "topic.actor.hub",
                topic = %name,
                error = %e,
                "Fresh topic refused its first join"
            );
        }

        self.topics.insert(
            name.clone(),
            ManagedTopic {
                handle,
                task_handle,
            },
        );
        debug!(
            target: "topic.actor.hub",
            topic = %name,
            instance,
            total_topics = self.topics.len(),
            "Topic actor started"
        );
    }

    /// Deliver a request from an attached session.
    fn forward(
        &mut self,
        session: &Session,
        id: Option<&str>,
        topic: &str,
        as_uid: Uid,
        publish: bool,
        msg: TopicMessage,
    ) {
        let name = match init::resolve_name(topic, as_uid) {
            Ok((_, TopicCategory::Me | TopicCategory::Fnd)) if publish => {
                reply_error(
                    session,
                    id,
                    topic,
                    &TopicError::PermissionDenied("cannot publish to this topic".into()),
                );
                return;
            }
            Ok((name, _)) => name,
            Err(e) => {
                reply_error(session, id, topic, &e);
                return;
            }
        };

        if !session.has_sub(&name) {
            reply_error(session, id, topic, &TopicError::NotAttached);
            return;
        }

        let delivered = self
            .topics
            .get(&name)
            .map(|managed| managed.handle.try_deliver(msg));
        match delivered {
            Some(Ok(())) => {}
            Some(Err(TrySendError::Full(_))) => {
                warn!(
                    target: "topic.actor.hub",
                    topic = %name,
                    "Topic mailbox full, request rejected"
                );
                reply_error(session, id, topic, &TopicError::Busy);
            }
            Some(Err(TrySendError::Closed(_))) | None => {
                session.del_sub(&name);
                reply_error(session, id, topic, &TopicError::NotAttached);
            }
        }
    }

    /// Forward to a running topic. Never starts one.
    fn route(&self, topic: &str, msg: TopicMessage) {
        let Some(managed) = self.topics.get(topic) else {
            debug!(
                target: "topic.actor.hub",
                topic = %topic,
                kind = msg.kind(),
                "Route target not running, dropped"
            );
            return;
        };
        if let Err(e) = managed.handle.try_deliver(msg) {
            debug!(
                target: "topic.actor.hub",
                topic = %topic,
                error = %e,
                "Route delivery failed, dropped"
            );
        }
    }

    /// A topic stopped on its own. A newer instance under the same name is
    /// left alone.
    fn topic_stopped(&mut self, name: &str, instance: u64) {
        let current = self
            .topics
            .get(name)
            .is_some_and(|m| m.handle.instance() == instance);
        if !current {
            return;
        }
        if let Some(managed) = self.topics.remove(name) {
            debug!(
                target: "topic.actor.hub",
                topic = %name,
                instance,
                total_topics = self.topics.len(),
                "Topic actor removed"
            );
            self.await_exit(name, managed.task_handle);
        }
    }

    /// Wait for a removed topic's task in the background.
    fn await_exit(&self, name: &str, task_handle: JoinHandle<()>) {
        let name = name.to_string();
        let timeout = self.ctx.config.shutdown_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "topic.actor.hub",
                        topic = %name,
                        "Topic actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "topic.actor.hub",
                        topic = %name,
                        error = ?e,
                        "Topic actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "topic.actor.hub",
                        topic = %name,
                        "Topic actor task cleanup timed out"
                    );
                }
            }
        });
    }

    /// Stop a topic. For `Deleted`, storage is deleted first and a failure
    /// leaves the topic running.
    async fn unregister(
        &mut self,
        topic: String,
        reason: ExitReason,
        requester: Option<Requester>,
        respond_to: Option<oneshot::Sender<Result<(), TopicError>>>,
    ) {
        if let Some(managed) = self.topics.get(&topic) {
            if managed.handle.suspend() {
                self.ctx.metrics.record_suspended(&topic);
            }
        }

        if reason == ExitReason::Deleted {
            match self.ctx.store.topic_delete(&topic).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {
                    info!(target: "topic.actor.hub", topic = %topic, "Topic deleted");
                }
                Err(e) => {
                    metrics::record_storage_error("topic_delete");
                    warn!(
                        target: "topic.actor.hub",
                        topic = %topic,
                        error = %e,
                        "Topic deletion failed"
                    );
                    if let Some(managed) = self.topics.get(&topic) {
                        if managed.handle.resume() {
                            self.ctx.metrics.record_resumed(&topic);
                        }
                    }
                    let err = TopicError::from(e);
                    if let Some(r) = &requester {
                        reply_error(&r.session, r.id.as_deref(), &r.topic, &err);
                    }
                    if let Some(tx) = respond_to {
                        let _ = tx.send(Err(err));
                    }
                    return;
                }
            }
        }

        let Some(managed) = self.topics.remove(&topic) else {
            if let Some(r) = requester {
                r.session
                    .queue_out(ServerMessage::Ctrl(MsgCtrl::ok(r.id.as_deref(), &r.topic, None)));
            }
            if let Some(tx) = respond_to {
                let _ = tx.send(Ok(()));
            }
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        let exit = TopicMessage::Exit {
            reason,
            done: Some(done_tx),
        };
        if let Err(e) = managed.handle.try_deliver(exit) {
            warn!(
                target: "topic.actor.hub",
                topic = %topic,
                error = %e,
                "Exit not delivered, cancelling topic"
            );
            managed.handle.cancel();
        }

        let timeout = self.ctx.config.shutdown_timeout;
        let ManagedTopic {
            handle,
            task_handle,
        } = managed;
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, done_rx).await.is_err() {
                warn!(
                    target: "topic.actor.hub",
                    topic = %topic,
                    "Topic exit timed out, cancelling"
                );
                handle.cancel();
            }
            if let Some(r) = requester {
                r.session
                    .queue_out(ServerMessage::Ctrl(MsgCtrl::ok(r.id.as_deref(), &r.topic, None)));
            }
            if let Some(tx) = respond_to {
                let _ = tx.send(Ok(()));
            }
            if tokio::time::timeout(timeout, task_handle).await.is_err() {
                warn!(
                    target: "topic.actor.hub",
                    topic = %topic,
                    "Topic actor task cleanup timed out"
                );
            }
        });
    }

    fn get_status(&self) -> HubStatus {
        HubStatus {
            topic_count: self.topics.len(),
            session_count: self.ctx.sessions.len(),
            mailbox_depth: self.receiver.len(),
            messages_processed: self.mailbox.messages_processed(),
            panics: self.ctx.metrics.panic_count(),
            stuck_detaches: self.ctx.metrics.stuck_detaches(),
            suspensions: self.ctx.metrics.suspensions(),
        }
    }

    /// Stop every topic, then the session registry.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "topic.actor.hub",
            topic_count = self.topics.len(),
            "Performing graceful shutdown"
        );

        let deadline = Instant::now() + self.ctx.config.shutdown_timeout;

        let mut pending = Vec::with_capacity(self.topics.len());
        for (name, managed) in &self.topics {
            let (tx, rx) = oneshot::channel();
            let exit = TopicMessage::Exit {
                reason: ExitReason::Shutdown,
                done: Some(tx),
            };
            if managed.handle.try_deliver(exit).is_ok() {
                pending.push(rx);
            } else {
                debug!(
                    target: "topic.actor.hub",
                    topic = %name,
                    "Exit not delivered, topic will be cancelled"
                );
            }
        }
        for rx in pending {
            if tokio::time::timeout_at(deadline, rx).await.is_err() {
                warn!(
                    target: "topic.actor.hub",
                    "Topics did not exit before the shutdown deadline"
                );
                break;
            }
        }

        for (name, managed) in self.topics.drain() {
            managed.handle.cancel();
            match tokio::time::timeout_at(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "topic.actor.hub",
                        topic = %name,
                        "Topic actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "topic.actor.hub",
                        topic = %name,
                        error = ?e,
                        "Topic actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "topic.actor.hub",
                        topic = %name,
                        "Topic actor shutdown timed out"
                    );
                }
            }
        }

        self.ctx.sessions.shutdown();

        info!(target: "topic.actor.hub", "Graceful shutdown complete");
    }

    /// Reap topic tasks that finished without telling the hub.
    async fn check_topic_health(&mut self) {
        let finished: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, m)| m.task_handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        for name in finished {
            let Some(managed) = self.topics.remove(&name) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "topic.actor.hub",
                        topic = %name,
                        "Topic actor exited cleanly"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        target: "topic.actor.hub",
                        topic = %name,
                        error = ?join_error,
                        "Topic actor panicked"
                    );
                    self.ctx.metrics.record_panic(ActorType::Topic);
                    // The panicked task never ran its shutdown bookkeeping.
                    self.ctx.metrics.topic_stopped();
                }
                Err(join_error) => {
                    debug!(
                        target: "topic.actor.hub",
                        topic = %name,
                        error = ?join_error,
                        "Topic actor task cancelled"
                    );
                }
            }
        }
    }
}
