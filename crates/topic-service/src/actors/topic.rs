//! `TopicActor` - per-topic actor that owns one topic's state.
//!
//! Each `TopicActor`:
//! - Owns the subscriber cache (`per_user`) and, for `me` topics, the contact
//!   presence cache (`per_subs`)
//! - Assigns message sequence ids and delete transaction ids
//! - Runs the subscription protocol (see `subscription.rs`)
//! - Fans out presence (see `presence.rs`) and answers metadata requests
//!   (see `meta.rs`)
//!
//! All mutations of a topic happen on this task, one mailbox item at a time.
//! The only blocking points are the mailbox and storage calls.
//!
//! # Timers
//!
//! - Idle timer: armed when the last session leaves. On expiry the actor
//!   deregisters from the hub and exits.
//! - User-agent timer (`me` only): coalesces agent changes before they are
//!   announced to contacts.

use super::hub::HubHandle;
use super::messages::{
    BroadcastMessage, BroadcastPayload, ExitReason, JoinRequest, LeaveRequest, PresenceNotice,
    SubscriberState, TopicMessage, TopicState,
};
use super::metrics::{ActorType, MailboxMonitor};
use super::presence::PresParams;
use crate::context::ServerContext;
use crate::errors::TopicError;
use crate::observability::metrics;
use crate::plugins::{self, PluginAction};
use crate::protocol::{MsgAccessMode, MsgCtrl, MsgData, MsgInfo, ServerMessage};
use crate::push::{PushPayload, PushReceipt};
use crate::session::Session;
use crate::store::{Message, StoreError, SubUpdate};

use chrono::{DateTime, Utc};
use common::{AccessMode, AuthLevel, DefaultAccess, TopicCategory, Uid};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Handle to a `TopicActor`.
#[derive(Clone, Debug)]
pub struct TopicHandle {
    sender: mpsc::Sender<TopicMessage>,
    cancel_token: CancellationToken,
    suspended: Arc<AtomicBool>,
    mailbox: Arc<MailboxMonitor>,
    name: String,
    instance: u64,
}

impl TopicHandle {
    /// Internal topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Distinguishes successive actors serving the same name.
    #[must_use]
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Enqueue without waiting.
    pub(crate) fn try_deliver(&self, msg: TopicMessage) -> Result<(), TrySendError<TopicMessage>> {
        let result = self.sender.try_send(msg);
        if matches!(result, Err(TrySendError::Full(_))) {
            self.mailbox.record_refused();
        }
        result
    }

    /// Ask the actor to stop. The receiver fires once sessions are detached.
    pub async fn exit(&self, reason: ExitReason) -> Result<oneshot::Receiver<()>, TopicError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TopicMessage::Exit {
                reason,
                done: Some(tx),
            })
            .await
            .map_err(|e| TopicError::Internal(format!("channel send failed: {e}")))?;
        Ok(rx)
    }

    /// Get a snapshot of the topic.
    pub async fn get_state(&self) -> Result<TopicState, TopicError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TopicMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| TopicError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| TopicError::Internal(format!("response receive failed: {e}")))
    }

    /// Reject joins and broadcasts with `Locked` until the actor exits.
    /// Returns `false` if the topic was already suspended.
    pub fn suspend(&self) -> bool {
        !self.suspended.swap(true, Ordering::AcqRel)
    }

    /// Returns `false` if the topic was not suspended.
    pub fn resume(&self) -> bool {
        self.suspended.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Whether the actor has stopped receiving.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// Cached subscription of one user.
#[derive(Debug, Clone)]
pub(super) struct PerUser {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Attached sessions of this user.
    pub online: usize,
    pub recv_id: u64,
    pub read_id: u64,
    pub del_id: u64,
    pub private: Option<Value>,
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    /// Two-party topics: the other user's public profile.
    pub public: Option<Value>,
    /// Two-party topics only: the user left but the record is kept.
    pub deleted: bool,
}

impl PerUser {
    pub fn new(want: AccessMode, given: AccessMode) -> Self {
        let now = Utc::now();
        Self {
            created: now,
            updated: now,
            online: 0,
            recv_id: 0,
            read_id: 0,
            del_id: 0,
            private: None,
            mode_want: want,
            mode_given: given,
            public: None,
            deleted: false,
        }
    }

    /// Effective mode.
    pub fn mode(&self) -> AccessMode {
        self.mode_given & self.mode_want
    }
}

/// Cached presence of one contact of a `me` topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct PerSubs {
    pub online: bool,
    /// Updates from this contact reach the user's sessions.
    pub enabled: bool,
}

/// A session attached to the topic and the identities it acts for.
#[derive(Debug)]
pub(super) struct Attached {
    pub session: Arc<Session>,
    pub uids: Vec<Uid>,
}

/// Initial state of a topic, built by the hub from storage.
#[derive(Debug)]
pub(super) struct TopicSeed {
    pub name: String,
    /// Name clients see, except for two-party topics.
    pub xoriginal: String,
    pub category: TopicCategory,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub touched: Option<DateTime<Utc>>,
    pub owner: Uid,
    pub access: DefaultAccess,
    pub public: Option<Value>,
    pub tags: Vec<String>,
    pub last_id: u64,
    pub del_id: u64,
    pub user_agent: String,
    pub per_user: HashMap<Uid, PerUser>,
}

/// The `TopicActor` implementation.
pub struct TopicActor {
    pub(super) name: String,
    pub(super) xoriginal: String,
    pub(super) category: TopicCategory,
    instance: u64,
    receiver: mpsc::Receiver<TopicMessage>,
    cancel_token: CancellationToken,
    suspended: Arc<AtomicBool>,
    pub(super) ctx: ServerContext,
    pub(super) hub: HubHandle,
    mailbox: Arc<MailboxMonitor>,

    pub(super) created: DateTime<Utc>,
    pub(super) updated: DateTime<Utc>,
    pub(super) touched: Option<DateTime<Utc>>,
    /// Highest assigned message sequence id.
    pub(super) last_id: u64,
    /// Highest delete transaction id.
    pub(super) del_id: u64,
    pub(super) owner: Uid,
    pub(super) access: DefaultAccess,
    pub(super) public: Option<Value>,
    pub(super) tags: Vec<String>,

    /// `me` only: last announced user agent.
    pub(super) user_agent: String,
    /// `me` only: user agent waiting for the debounce timer.
    current_ua: String,
    ua_at: Option<Instant>,
    kill_at: Option<Instant>,

    pub(super) per_user: HashMap<Uid, PerUser>,
    /// `me` only: contacts keyed by user id or group name.
    pub(super) per_subs: HashMap<String, PerSubs>,
    /// `fnd` only: search query per session id.
    pub(super) fnd_public: HashMap<String, Value>,
    pub(super) sessions: HashMap<String, Attached>,
    /// Sessions whose queue overflowed during the current item.
    pub(super) stuck: Vec<String>,
}

impl TopicActor {
    /// Spawn a new topic actor.
    ///
    /// Returns a handle and the task join handle.
    pub(super) fn spawn(
        seed: TopicSeed,
        instance: u64,
        ctx: ServerContext,
        hub: HubHandle,
        cancel_token: CancellationToken,
    ) -> (TopicHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ctx.config.mailbox_capacity);
        let suspended = Arc::new(AtomicBool::new(false));
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Topic, &seed.name));

        let handle = TopicHandle {
            sender,
            cancel_token: cancel_token.clone(),
            suspended: Arc::clone(&suspended),
            mailbox: Arc::clone(&mailbox),
            name: seed.name.clone(),
            instance,
        };

        let actor = Self {
            name: seed.name,
            xoriginal: seed.xoriginal,
            category: seed.category,
            instance,
            receiver,
            cancel_token,
            suspended,
            ctx,
            hub,
            mailbox,
            created: seed.created,
            updated: seed.updated,
            touched: seed.touched,
            last_id: seed.last_id,
            del_id: seed.del_id,
            owner: seed.owner,
            access: seed.access,
            public: seed.public,
            tags: seed.tags,
            user_agent: seed.user_agent,
            current_ua: String::new(),
            ua_at: None,
            kill_at: None,
            per_user: seed.per_user,
            per_subs: HashMap::new(),
            fnd_public: HashMap::new(),
            sessions: HashMap::new(),
            stuck: Vec::new(),
        };

        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "topic.actor.topic", fields(topic = %self.name))]
    async fn run(mut self) {
        info!(
            target: "topic.actor.topic",
            topic = %self.name,
            category = self.category.as_str(),
            "TopicActor started"
        );
        self.ctx.metrics.topic_started();

        loop {
            let kill_at = self.kill_at;
            let ua_at = self.ua_at;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "topic.actor.topic",
                        topic = %self.name,
                        "TopicActor received cancellation signal"
                    );
                    self.detach_all();
                    break;
                }

                () = sleep_until(kill_at) => {
                    self.handle_idle_timeout();
                    break;
                }

                () = sleep_until(ua_at) => {
                    self.handle_ua_timer();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let kind = message.kind();
                            let started = Instant::now();
                            let flow = self.handle_message(message).await;
                            self.detach_stuck_sessions().await;
                            metrics::record_message_latency(kind, started.elapsed());
                            self.mailbox.record_processed(self.receiver.len());
                            self.ctx.metrics.record_message_processed();
                            if flow.is_break() {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "topic.actor.topic",
                                topic = %self.name,
                                "TopicActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.ctx.metrics.topic_stopped();
        info!(
            target: "topic.actor.topic",
            topic = %self.name,
            subscribers = self.per_user.len(),
            last_id = self.last_id,
            messages_processed = self.mailbox.messages_processed(),
            "TopicActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: TopicMessage) -> ControlFlow<()> {
        match message {
            TopicMessage::Join(req) => self.handle_join(*req).await,
            TopicMessage::Leave(req) => self.handle_leave(*req).await,
            TopicMessage::Broadcast(msg) => self.handle_broadcast(*msg).await,
            TopicMessage::Meta(req) => self.handle_meta(*req).await,
            TopicMessage::UaChange(ua) => self.handle_ua_change(ua),
            TopicMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
            TopicMessage::Exit { reason, done } => {
                self.handle_exit(reason).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------

    #[instrument(skip_all, fields(topic = %self.name, user = %req.as_user))]
    async fn handle_join(&mut self, mut req: JoinRequest) {
        if self.is_suspended() {
            reply_error(&req.session, req.id.as_deref(), &req.topic, &TopicError::Locked);
            return;
        }

        self.kill_at = None;

        match self.handle_subscription(&mut req).await {
            Ok(()) => {
                if req.created {
                    plugins::log_failure(
                        "topic",
                        &self.name,
                        self.ctx.plugins.topic(&self.name, PluginAction::Created).await,
                    );
                }
            }
            Err(e) => {
                log_failure(&self.name, "join", &e);
                reply_error(&req.session, req.id.as_deref(), &req.topic, &e);
                if self.sessions.is_empty() {
                    self.arm_kill_timer();
                }
            }
        }
    }

    /// Subscribe, attach, reply and announce.
    async fn handle_subscription(&mut self, req: &mut JoinRequest) -> Result<(), TopicError> {
        let as_uid = req.as_user;
        let sid = req.session.sid().to_string();
        let toriginal = self.original(as_uid)?;

        if !req.newsub && matches!(self.category, TopicCategory::Grp | TopicCategory::P2P) {
            req.newsub = !self.per_user.contains_key(&as_uid);
        }

        let mut want = AccessMode::UNSET;
        let mut private = None;
        if let Some(set) = &req.set {
            if let Some(sub) = &set.sub {
                if sub.user.is_some() {
                    return Err(TopicError::Malformed("user id must not be specified".into()));
                }
                want = sub.mode;
            }
            if let Some(desc) = &set.desc {
                private = desc.private.clone();
            }
        }

        self.request_sub(&req.session, as_uid, req.auth_level, want, private)
            .await?;

        // Joining again on an attached session only refreshes the reply.
        let reattach = self
            .sessions
            .get(&sid)
            .is_some_and(|a| a.uids.contains(&as_uid));

        let pud = self.per_user.get_mut(&as_uid).ok_or_else(|| {
            TopicError::Invariant(format!("subscription of {as_uid} vanished after request"))
        })?;
        let acs = MsgAccessMode::new(pud.mode_want, pud.mode_given);
        let joined = pud.mode_want.is_joiner() && pud.mode_given.is_joiner();
        if joined && !reattach {
            pud.online += 1;
        }
        let online = pud.online;
        let mode = pud.mode();

        let mut params = json!({ "acs": acs });
        if req.created && req.topic != toriginal {
            params["tmpname"] = json!(req.topic);
        }
        let mut ctrl = MsgCtrl::ok(req.id.as_deref(), &toriginal, Some(params));
        if req.created {
            ctrl.ts = self.updated;
        }

        if !joined {
            // Self-ban: the user was evicted while processing the request.
            req.session.queue_out(ServerMessage::Ctrl(ctrl));
            return Ok(());
        }

        if reattach {
            req.session.queue_out(ServerMessage::Ctrl(ctrl));
            if let Some(get) = req.get.take() {
                let id = req.id.clone();
                self.reply_get(&req.session, as_uid, id.as_deref(), &get)
                    .await;
            }
            return Ok(());
        }

        req.session.add_sub(&self.name);
        self.add_session(&req.session, as_uid);
        req.session.queue_out(ServerMessage::Ctrl(ctrl));

        match self.category {
            TopicCategory::Me => {
                if req.loaded {
                    if let Err(e) = self.load_contacts(as_uid).await {
                        warn!(
                            target: "topic.actor.topic",
                            topic = %self.name,
                            error = %e,
                            "Failed to load contacts"
                        );
                    }
                    self.pres_users_of_interest("on", &req.session.user_agent());
                }
            }
            TopicCategory::Grp => {
                if req.loaded {
                    let status = if mode.is_presencer() { "on+en" } else { "on" };
                    self.pres_subs_offline(
                        status,
                        &PresParams::default(),
                        &super::messages::PresFilters::default(),
                        None,
                        false,
                    );
                } else if online == 1 {
                    self.pres_subs_online(
                        "on",
                        &as_uid.user_id(),
                        &PresParams::default(),
                        &super::messages::PresFilters::filter_in(AccessMode::READ),
                        Some(&sid),
                    );
                }
            }
            TopicCategory::P2P => {
                let uid2 = self.p2p_other_user(as_uid)?;
                let (want2, given2) = self
                    .per_user
                    .get(&uid2)
                    .map(|p| (p.mode_want, p.mode_given))
                    .ok_or_else(|| TopicError::Invariant("p2p topic missing its peer".into()))?;

                if req.created {
                    self.pres_single_user_offline(
                        uid2,
                        "acs",
                        &PresParams::access(want2.to_string(), given2.to_string(), as_uid),
                        None,
                        false,
                    );
                }

                if req.newsub {
                    self.pres_single_user_offline(
                        as_uid,
                        "?none+en",
                        &PresParams::default(),
                        None,
                        false,
                    );
                    let status = if (want2 & given2).is_presencer() {
                        "?unkn+en"
                    } else {
                        "?unkn"
                    };
                    self.pres_single_user_offline(uid2, status, &PresParams::default(), None, false);
                }
            }
            TopicCategory::Fnd => {}
        }

        if req.newsub {
            self.pres_single_user_offline(
                as_uid,
                "acs",
                &PresParams::access(acs.want.to_string(), acs.given.to_string(), as_uid),
                Some(&sid),
                false,
            );
        }

        if let Some(get) = req.get.take() {
            let id = req.id.clone();
            self.reply_get(&req.session, as_uid, id.as_deref(), &get)
                .await;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Leave
    // ------------------------------------------------------------------

    #[instrument(skip_all, fields(topic = %self.name))]
    async fn handle_leave(&mut self, req: LeaveRequest) {
        if self.is_suspended() {
            if !req.as_user.is_zero() && req.id.is_some() {
                reply_error(&req.session, req.id.as_deref(), &req.topic, &TopicError::Locked);
            }
            return;
        }

        if req.unsub {
            if let Err(e) = self
                .leave_unsub(&req.session, req.as_user, req.id.as_deref())
                .await
            {
                log_failure(&self.name, "leave", &e);
                if req.id.is_some() {
                    reply_error(&req.session, req.id.as_deref(), &req.topic, &e);
                }
            }
        } else {
            self.detach_session(&req.session, req.as_user).await;
            if let Some(id) = req.id.as_deref() {
                req.session
                    .queue_out(ServerMessage::Ctrl(MsgCtrl::ok(Some(id), &req.topic, None)));
            }
        }

        if self.sessions.is_empty() {
            self.arm_kill_timer();
        }
    }

    /// Remove `as_uid` (or every identity when zero) of a session and update
    /// online counters and presence.
    pub(super) async fn detach_session(&mut self, session: &Arc<Session>, as_uid: Uid) {
        let removed = self.rem_session(session.sid(), as_uid);
        if removed.is_empty() {
            return;
        }
        session.del_sub(&self.name);

        for uid in removed {
            let online = match self.per_user.get_mut(&uid) {
                Some(pud) => {
                    pud.online = pud.online.saturating_sub(1);
                    pud.online
                }
                None => continue,
            };

            match self.category {
                TopicCategory::Me => {
                    let ua = match self.most_recent_session() {
                        Some(mrs) => {
                            let ua = mrs.user_agent();
                            self.handle_ua_change(ua.clone());
                            ua
                        }
                        None => session.user_agent(),
                    };
                    if let Err(e) = self
                        .ctx
                        .store
                        .user_update_last_seen(uid, &ua, Utc::now())
                        .await
                    {
                        metrics::record_storage_error("user_update_last_seen");
                        warn!(
                            target: "topic.actor.topic",
                            topic = %self.name,
                            error = %e,
                            "Failed to update last seen"
                        );
                    }
                }
                TopicCategory::Fnd => {
                    self.fnd_public.remove(session.sid());
                }
                TopicCategory::Grp => {
                    if online == 0 {
                        self.pres_subs_online(
                            "off",
                            &uid.user_id(),
                            &PresParams::default(),
                            &super::messages::PresFilters::filter_in(AccessMode::READ),
                            Some(session.sid()),
                        );
                    }
                }
                TopicCategory::P2P => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    async fn handle_broadcast(&mut self, msg: BroadcastMessage) {
        let BroadcastMessage {
            id,
            topic,
            session,
            from,
            skip_sid,
            payload,
        } = msg;

        match payload {
            BroadcastPayload::Data { head, content } => {
                let result = self
                    .handle_data(id.as_deref(), session.as_ref(), from, head, content)
                    .await;
                if let Err(e) = result {
                    log_failure(&self.name, "data", &e);
                    if let Some(session) = &session {
                        reply_error(session, id.as_deref(), &topic, &e);
                    }
                }
            }
            BroadcastPayload::Presence(notice) => {
                self.handle_presence(notice, skip_sid.as_deref());
            }
            BroadcastPayload::Info { what, seq } => {
                self.handle_info(from, &what, seq, skip_sid.as_deref()).await;
            }
        }
    }

    /// Persist a content message and distribute it.
    async fn handle_data(
        &mut self,
        id: Option<&str>,
        session: Option<&Arc<Session>>,
        from: Uid,
        head: Option<Value>,
        content: Value,
    ) -> Result<(), TopicError> {
        if self.is_suspended() {
            return Err(TopicError::Locked);
        }

        let mode = self.effective_mode(from);
        if !mode.is_writer() {
            return Err(TopicError::PermissionDenied("no write access".into()));
        }

        let seq = self.last_id + 1;
        let now = Utc::now();
        let message = Message {
            topic: self.name.clone(),
            seq_id: seq,
            from,
            created: now,
            head,
            content,
        };

        self.ctx
            .store
            .message_save(&message)
            .await
            .map_err(|e| storage_error(&self.name, "message_save", e))?;

        self.last_id = seq;
        self.touched = Some(now);
        if let Some(pud) = self.per_user.get_mut(&from) {
            pud.read_id = seq;
            pud.recv_id = seq;
        }

        if let (Some(session), Some(id)) = (session, id) {
            let toriginal = self.original(from)?;
            session.queue_out(ServerMessage::Ctrl(MsgCtrl::accepted(
                Some(id),
                &toriginal,
                Some(json!({ "seq": seq })),
            )));
        }
        metrics::record_message_published(self.category.as_str());

        let mut receipt = self.make_push_receipt(from, &message);

        self.pres_subs_offline(
            "msg",
            &PresParams {
                seq,
                actor: Some(from),
                ..PresParams::default()
            },
            &super::messages::PresFilters::filter_in(AccessMode::READ),
            None,
            true,
        );

        let data = ServerMessage::Data(MsgData {
            topic: self.xoriginal.clone(),
            from,
            seq,
            head: message.head,
            content: message.content,
            ts: now,
        });
        self.deliver(&data, None, Some(&mut receipt));

        if !receipt.to.is_empty() {
            self.ctx.push.push(receipt);
        }

        plugins::log_failure(
            "message",
            &self.name,
            self.ctx.plugins.message(&self.name, from, seq).await,
        );

        Ok(())
    }

    /// Presence routed from another topic.
    fn handle_presence(&mut self, notice: PresenceNotice, skip_sid: Option<&str>) {
        // Routed between topics: there is no requester to answer `Locked`.
        if self.is_suspended() {
            return;
        }

        let what = self.pres_proc_req(&notice.pres.src, &notice.pres.what, notice.want_reply);
        if self.xoriginal != notice.pres.topic || what.is_empty() {
            return;
        }

        let mut pres = notice.pres;
        pres.what = what;
        self.deliver_pres(
            pres,
            &notice.filters,
            notice.skip_topic.as_deref(),
            skip_sid,
        );
    }

    /// Typing notifications and read/received watermarks.
    async fn handle_info(&mut self, from: Uid, what: &str, seq: u64, skip_sid: Option<&str>) {
        // Notes are fire-and-forget and carry no request id.
        if self.is_suspended() || seq > self.last_id {
            return;
        }
        let Some(pud) = self.per_user.get(&from).filter(|p| !p.deleted) else {
            return;
        };
        let mode = pud.mode();

        match what {
            "kp" => {
                if !mode.is_writer() {
                    return;
                }
            }
            "read" | "recv" => {
                if !mode.is_reader() {
                    return;
                }
                let (mut read, mut recv) = (pud.read_id, pud.recv_id);
                if what == "read" {
                    if seq <= read {
                        return;
                    }
                    read = seq;
                    recv = recv.max(read);
                } else {
                    if seq <= recv {
                        return;
                    }
                    recv = seq;
                }

                let update = SubUpdate {
                    read_id: Some(read),
                    recv_id: Some(recv),
                    ..SubUpdate::default()
                };
                if let Err(e) = self.ctx.store.sub_update(&self.name, from, update).await {
                    let _ = storage_error(&self.name, "sub_update", e);
                    return;
                }
                if let Some(pud) = self.per_user.get_mut(&from) {
                    pud.read_id = read;
                    pud.recv_id = recv;
                }

                let (pub_read, pub_recv) = if what == "read" { (read, 0) } else { (0, recv) };
                self.pres_pub_message_count(from, pub_recv, pub_read, skip_sid);
            }
            _ => return,
        }

        let info = ServerMessage::Info(MsgInfo {
            topic: self.xoriginal.clone(),
            from,
            what: what.to_string(),
            seq,
        });
        self.deliver(&info, skip_sid, None);
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Queue data or info to every attached reader. Sessions that cannot
    /// take the message are marked stuck.
    pub(super) fn deliver(
        &mut self,
        msg: &ServerMessage,
        skip_sid: Option<&str>,
        mut receipt: Option<&mut PushReceipt>,
    ) {
        let kp_from = match msg {
            ServerMessage::Info(info) if info.what == "kp" => Some(info.from),
            _ => None,
        };

        let mut stuck = Vec::new();
        for (sid, attached) in &self.sessions {
            if Some(sid.as_str()) == skip_sid {
                continue;
            }
            for &uid in &attached.uids {
                if !self.effective_mode(uid).is_reader() || kp_from == Some(uid) {
                    continue;
                }
                let out = match self.category {
                    TopicCategory::P2P => match self.original(uid) {
                        Ok(name) => msg.with_topic(&name),
                        Err(e) => {
                            log_failure(&self.name, "deliver", &e);
                            continue;
                        }
                    },
                    _ => msg.clone(),
                };
                if attached.session.queue_out(out) {
                    if let Some(receipt) = receipt.as_deref_mut() {
                        receipt.mark_delivered(uid, &attached.session.device_id());
                    }
                } else {
                    stuck.push(sid.clone());
                    break;
                }
            }
        }
        self.mark_stuck(stuck);
    }

    /// Queue a presence notice to attached sessions that pass the filters.
    pub(super) fn deliver_pres(
        &mut self,
        pres: crate::protocol::MsgPres,
        filters: &super::messages::PresFilters,
        skip_topic: Option<&str>,
        skip_sid: Option<&str>,
    ) {
        let always = matches!(pres.what.as_str(), "gone" | "term");
        let msg = ServerMessage::Pres(pres);

        let mut stuck = Vec::new();
        for (sid, attached) in &self.sessions {
            if Some(sid.as_str()) == skip_sid {
                continue;
            }
            if skip_topic.is_some_and(|t| attached.session.has_sub(t)) {
                continue;
            }
            for &uid in &attached.uids {
                let mode = self.effective_mode(uid);
                if !always && !mode.is_presencer() {
                    continue;
                }
                if !filters.admits(uid, mode) {
                    continue;
                }
                let out = match self.category {
                    TopicCategory::P2P => match self.original(uid) {
                        Ok(name) => msg.with_topic(&name),
                        Err(e) => {
                            log_failure(&self.name, "deliver", &e);
                            continue;
                        }
                    },
                    _ => msg.clone(),
                };
                if !attached.session.queue_out(out) {
                    stuck.push(sid.clone());
                    break;
                }
            }
        }
        self.mark_stuck(stuck);
    }

    fn mark_stuck(&mut self, stuck: Vec<String>) {
        for sid in stuck {
            warn!(
                target: "topic.actor.topic",
                topic = %self.name,
                sid = %sid,
                "Connection stuck, detaching"
            );
            if !self.stuck.contains(&sid) {
                self.stuck.push(sid);
            }
        }
    }

    /// Detach sessions whose outbound queue overflowed.
    async fn detach_stuck_sessions(&mut self) {
        while let Some(sid) = self.stuck.pop() {
            let Some(session) = self.sessions.get(&sid).map(|a| Arc::clone(&a.session)) else {
                continue;
            };
            self.detach_session(&session, Uid::ZERO).await;
            session.detach(&self.name);
            self.ctx.metrics.record_stuck_detach(&self.name);
            if self.sessions.is_empty() {
                self.arm_kill_timer();
            }
        }
    }

    /// Push recipients: every live subscriber with presence, except the
    /// sender.
    fn make_push_receipt(&self, from: Uid, message: &Message) -> PushReceipt {
        let topic = match self.category {
            TopicCategory::P2P => from.user_id(),
            _ => self.xoriginal.clone(),
        };
        let to = self
            .per_user
            .iter()
            .filter(|(uid, pud)| **uid != from && !pud.deleted && pud.mode().is_presencer())
            .map(|(uid, _)| (*uid, crate::push::PushRecipient::default()))
            .collect();

        PushReceipt {
            to,
            payload: PushPayload {
                topic,
                from,
                seq: message.seq_id,
                content: message.content.clone(),
            },
        }
    }

    // ------------------------------------------------------------------
    // Timers and exit
    // ------------------------------------------------------------------

    fn handle_ua_change(&mut self, ua: String) {
        if self.category != TopicCategory::Me {
            return;
        }
        self.current_ua = ua;
        self.ua_at = Some(Instant::now() + self.ctx.config.ua_debounce);
    }

    fn handle_ua_timer(&mut self) {
        self.ua_at = None;
        if self.current_ua.is_empty() || self.current_ua == self.user_agent {
            return;
        }
        self.user_agent = self.current_ua.clone();
        let ua = self.user_agent.clone();
        self.pres_users_of_interest("ua", &ua);
    }

    pub(super) fn arm_kill_timer(&mut self) {
        self.kill_at = Some(Instant::now() + self.ctx.config.idle_timeout);
    }

    /// No sessions for the idle period: deregister and stop. Requests that
    /// arrived in the meantime go back to the hub.
    fn handle_idle_timeout(&mut self) {
        info!(
            target: "topic.actor.topic",
            topic = %self.name,
            "Topic idle, shutting down"
        );

        self.hub.topic_stopped(&self.name, self.instance);

        match self.category {
            TopicCategory::Me => {
                let ua = self.current_ua.clone();
                self.pres_users_of_interest("off", &ua);
            }
            TopicCategory::Grp => {
                self.pres_subs_offline(
                    "off",
                    &PresParams::default(),
                    &super::messages::PresFilters::default(),
                    None,
                    false,
                );
            }
            TopicCategory::P2P | TopicCategory::Fnd => {}
        }

        self.receiver.close();
        while let Ok(msg) = self.receiver.try_recv() {
            match msg {
                TopicMessage::Join(req) => self.hub.rejoin(req),
                TopicMessage::Exit {
                    done: Some(done), ..
                } => {
                    let _ = done.send(());
                }
                other => {
                    debug!(
                        target: "topic.actor.topic",
                        topic = %self.name,
                        kind = other.kind(),
                        "Dropping request to stopped topic"
                    );
                }
            }
        }
    }

    #[instrument(skip_all, fields(topic = %self.name, reason = reason.as_str()))]
    async fn handle_exit(&mut self, reason: ExitReason) {
        info!(
            target: "topic.actor.topic",
            topic = %self.name,
            reason = reason.as_str(),
            sessions = self.sessions.len(),
            "Topic exiting"
        );

        match reason {
            ExitReason::Deleted => {
                if matches!(self.category, TopicCategory::Grp | TopicCategory::P2P) {
                    self.pres_subs_offline(
                        "gone",
                        &PresParams::default(),
                        &super::messages::PresFilters::default(),
                        None,
                        false,
                    );
                }
                plugins::log_failure(
                    "topic",
                    &self.name,
                    self.ctx.plugins.topic(&self.name, PluginAction::Deleted).await,
                );
            }
            ExitReason::Rehashing => {
                self.pres_subs_online_direct("term");
            }
            ExitReason::Timeout | ExitReason::Shutdown => {}
        }

        self.detach_all();
    }

    /// Tell every attached session to forget this topic.
    fn detach_all(&mut self) {
        for (_, attached) in self.sessions.drain() {
            attached.session.detach(&self.name);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    pub(super) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(super) fn suspend(&self) {
        if !self.suspended.swap(true, Ordering::AcqRel) {
            self.ctx.metrics.record_suspended(&self.name);
        }
    }

    pub(super) fn resume(&self) {
        if self.suspended.swap(false, Ordering::AcqRel) {
            self.ctx.metrics.record_resumed(&self.name);
        }
    }

    /// Effective mode of a live subscriber, `N` otherwise.
    pub(super) fn effective_mode(&self, uid: Uid) -> AccessMode {
        self.per_user
            .get(&uid)
            .filter(|p| !p.deleted)
            .map_or(AccessMode::NONE, PerUser::mode)
    }

    /// Topic name as `uid` sees it.
    pub(super) fn original(&self, uid: Uid) -> Result<String, TopicError> {
        if self.category == TopicCategory::P2P {
            Ok(self.p2p_other_user(uid)?.user_id())
        } else {
            Ok(self.xoriginal.clone())
        }
    }

    /// The other party of a two-party topic.
    pub(super) fn p2p_other_user(&self, uid: Uid) -> Result<Uid, TopicError> {
        let (a, b) = Uid::from_p2p_name(&self.name)
            .ok_or_else(|| TopicError::Invariant(format!("{} is not a p2p topic", self.name)))?;
        if uid == a {
            Ok(b)
        } else if uid == b {
            Ok(a)
        } else {
            Err(TopicError::Invariant(format!(
                "{uid} is not a party of {}",
                self.name
            )))
        }
    }

    /// Default mode for a new subscriber at `level`.
    pub(super) fn access_for(&self, level: AuthLevel) -> AccessMode {
        self.access.for_level(level)
    }

    /// Live subscribers.
    pub(super) fn subs_count(&self) -> usize {
        self.per_user.values().filter(|p| !p.deleted).count()
    }

    fn add_session(&mut self, session: &Arc<Session>, uid: Uid) {
        let attached = self
            .sessions
            .entry(session.sid().to_string())
            .or_insert_with(|| Attached {
                session: Arc::clone(session),
                uids: Vec::new(),
            });
        if !attached.uids.contains(&uid) {
            attached.uids.push(uid);
        }
    }

    /// Remove one identity, or all when `uid` is zero. Returns the removed
    /// identities.
    pub(super) fn rem_session(&mut self, sid: &str, uid: Uid) -> Vec<Uid> {
        let Some(attached) = self.sessions.get_mut(sid) else {
            return Vec::new();
        };
        let removed = if uid.is_zero() {
            std::mem::take(&mut attached.uids)
        } else if let Some(pos) = attached.uids.iter().position(|u| *u == uid) {
            vec![attached.uids.remove(pos)]
        } else {
            Vec::new()
        };
        if attached.uids.is_empty() {
            self.sessions.remove(sid);
        }
        removed
    }

    fn most_recent_session(&self) -> Option<Arc<Session>> {
        self.sessions
            .values()
            .max_by_key(|a| a.session.last_touched())
            .map(|a| Arc::clone(&a.session))
    }

    fn state(&self) -> TopicState {
        let mut subscribers: Vec<SubscriberState> = self
            .per_user
            .iter()
            .map(|(uid, pud)| SubscriberState {
                user: *uid,
                want: pud.mode_want,
                given: pud.mode_given,
                online: pud.online,
                read_id: pud.read_id,
                recv_id: pud.recv_id,
                del_id: pud.del_id,
                deleted: pud.deleted,
            })
            .collect();
        subscribers.sort_by_key(|s| s.user);

        TopicState {
            name: self.name.clone(),
            category: self.category,
            owner: self.owner,
            last_id: self.last_id,
            del_id: self.del_id,
            sessions: self.sessions.len(),
            suspended: self.is_suspended(),
            subscribers,
        }
    }
}

/// Sleep until `at`, or forever when there is no deadline.
async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Send an error reply to the requesting session.
pub(super) fn reply_error(session: &Session, id: Option<&str>, topic: &str, err: &TopicError) {
    session.queue_out(ServerMessage::Ctrl(MsgCtrl::from_error(id, topic, err)));
}

/// Log a failed request at a level matching its cause.
pub(super) fn log_failure(topic: &str, op: &'static str, err: &TopicError) {
    match err {
        TopicError::Invariant(_) | TopicError::Internal(_) => {
            error!(target: "topic.actor.topic", topic = %topic, op, error = %err, "Request failed");
        }
        TopicError::Storage(_) => {
            warn!(target: "topic.actor.topic", topic = %topic, op, error = %err, "Request failed");
        }
        _ => {
            debug!(target: "topic.actor.topic", topic = %topic, op, error = %err, "Request rejected");
        }
    }
}

/// Count and convert a storage failure.
pub(super) fn storage_error(topic: &str, operation: &'static str, err: StoreError) -> TopicError {
    metrics::record_storage_error(operation);
    warn!(
        target: "topic.actor.topic",
        topic = %topic,
        operation,
        error = %err,
        "Storage call failed"
    );
    TopicError::from(err)
}
