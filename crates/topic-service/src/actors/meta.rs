//! Metadata requests: get, set and del.
//!
//! Replies go only to the requesting session. Set and del also announce
//! the change through presence.

use super::messages::{MetaKind, MetaRequest, PresFilters, Requester};
use super::presence::PresParams;
use super::topic::{log_failure, reply_error, storage_error, TopicActor};
use crate::delrange;
use crate::errors::TopicError;
use crate::plugins::{self, PluginAction};
use crate::protocol::{
    DelQuery, DelRangeWire, GetOpts, GetQuery, MsgAccessMode, MsgCtrl, MsgData, MsgDelValues,
    MsgMeta, MsgTopicDesc, MsgTopicSub, ServerMessage, SetDesc, SetQuery, SetSub,
};
use crate::session::Session;
use crate::store::{QueryOpt, SubUpdate, Subscription, TopicUpdate, UserUpdate};

use common::{AccessMode, AuthLevel, DefaultAccess, TopicCategory, Uid};
use serde_json::{json, Value};
use std::sync::Arc;

impl From<&GetOpts> for QueryOpt {
    fn from(opts: &GetOpts) -> Self {
        Self {
            since: opts.since_id,
            before: opts.before_id,
            limit: opts.limit,
        }
    }
}

/// New value of an optional field, `Some(None)` to clear it, `None` when
/// unchanged. A JSON null in the update clears.
fn merged(current: Option<&Value>, update: Option<&Value>) -> Option<Option<Value>> {
    match update {
        None => None,
        Some(Value::Null) => current.is_some().then_some(None),
        Some(v) => (current != Some(v)).then(|| Some(v.clone())),
    }
}

/// Trim, lowercase, drop empties, sort and dedupe.
fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Tags of a search query: comma or whitespace separated.
fn parse_search_query(query: &str) -> Vec<String> {
    let terms: Vec<String> = query
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(ToString::to_string)
        .collect();
    normalize_tags(&terms)
}

/// Entries of `a` missing from `b`.
fn missing_from(a: &[String], b: &[String]) -> usize {
    a.iter().filter(|t| !b.contains(t)).count()
}

impl TopicActor {
    pub(super) async fn handle_meta(&mut self, req: MetaRequest) {
        let MetaRequest {
            id,
            topic,
            session,
            as_user,
            auth_level,
            kind,
        } = req;

        let result = match kind {
            MetaKind::Get(query) => {
                self.reply_get(&session, as_user, id.as_deref(), &query)
                    .await;
                Ok(())
            }
            MetaKind::Set(_) | MetaKind::Del(_) if self.is_suspended() => Err(TopicError::Locked),
            MetaKind::Set(query) => {
                self.reply_set(&session, as_user, auth_level, id.as_deref(), &topic, query)
                    .await
            }
            MetaKind::Del(query) => {
                self.reply_del(&session, as_user, id.as_deref(), &topic, query)
                    .await
            }
        };

        if let Err(e) = result {
            log_failure(&self.name, "meta", &e);
            reply_error(&session, id.as_deref(), &topic, &e);
        }
    }

    /// Answer each requested part. A failing part does not stop the rest.
    pub(super) async fn reply_get(
        &self,
        session: &Session,
        as_uid: Uid,
        id: Option<&str>,
        query: &GetQuery,
    ) {
        let toriginal = self
            .original(as_uid)
            .unwrap_or_else(|_| self.xoriginal.clone());

        let mut results = Vec::new();
        if let Some(opts) = &query.desc {
            results.push(self.reply_get_desc(session, as_uid, id, &toriginal, opts));
        }
        if let Some(opts) = &query.sub {
            results.push(
                self.reply_get_sub(session, as_uid, id, &toriginal, opts)
                    .await,
            );
        }
        if let Some(opts) = &query.data {
            results.push(
                self.reply_get_data(session, as_uid, id, &toriginal, opts)
                    .await,
            );
        }
        if let Some(opts) = &query.del {
            results.push(self.reply_get_del(session, as_uid, id, &toriginal, opts).await);
        }
        if query.tags {
            results.push(self.reply_get_tags(session, as_uid, id, &toriginal));
        }

        for e in results.into_iter().filter_map(Result::err) {
            log_failure(&self.name, "get", &e);
            reply_error(session, id, &toriginal, &e);
        }
    }

    fn reply_get_desc(
        &self,
        session: &Session,
        as_uid: Uid,
        id: Option<&str>,
        toriginal: &str,
        opts: &GetOpts,
    ) -> Result<(), TopicError> {
        if opts.has_user_or_limit() {
            return Err(TopicError::Malformed("invalid desc query".into()));
        }

        let if_updated = opts.if_modified_since.map_or(true, |since| since < self.updated);

        let mut desc = MsgTopicDesc {
            created: Some(self.created),
            updated: Some(self.updated),
            ..MsgTopicDesc::default()
        };

        let pud = self.per_user.get(&as_uid);
        let full = pud.is_some() || self.category == TopicCategory::Me;

        if if_updated {
            desc.public = match (&self.public, pud) {
                (Some(public), _) => Some(public.clone()),
                (None, Some(pud)) if self.category == TopicCategory::P2P => pud.public.clone(),
                _ => None,
            };
        }

        if let (true, Some(pud)) = (full, pud) {
            let mode = pud.mode();
            if self.category == TopicCategory::Me
                || (self.category != TopicCategory::P2P && mode.is_sharer())
            {
                desc.defacs = Some(self.access);
            }
            if self.category != TopicCategory::Me {
                desc.acs = Some(MsgAccessMode::new(pud.mode_want, pud.mode_given));
            }
            if self.category == TopicCategory::Grp && mode.is_presencer() {
                desc.online = Some(!self.sessions.is_empty());
            }
            if if_updated {
                desc.private = pud.private.clone();
            }
            if mode.is_reader() {
                desc.seq = self.last_id;
                desc.touched = self.touched;
                desc.clear = pud.del_id.max(self.del_id);
                desc.read = pud.read_id;
                desc.recv = pud.recv_id.max(pud.read_id);
            } else {
                desc.touched = Some(self.updated);
            }
        }

        let mut meta = MsgMeta::new(id, toriginal);
        meta.desc = Some(desc);
        session.queue_out(ServerMessage::Meta(meta));
        Ok(())
    }

    async fn reply_get_sub(
        &self,
        session: &Session,
        as_uid: Uid,
        id: Option<&str>,
        toriginal: &str,
        opts: &GetOpts,
    ) -> Result<(), TopicError> {
        if opts.since_id != 0 || opts.before_id != 0 {
            return Err(TopicError::Malformed("invalid sub query".into()));
        }

        let requester_mode = self.effective_mode(as_uid);
        if !matches!(self.category, TopicCategory::Me | TopicCategory::Fnd)
            && !requester_mode.is_sharer()
        {
            return Err(TopicError::PermissionDenied("no sharing rights".into()));
        }

        let keep_deleted = opts.if_modified_since.is_some();
        let mut subs = match self.category {
            TopicCategory::Me => {
                let wanted = opts.topic.as_deref().map(|t| match Uid::parse_user_id(t) {
                    Ok(peer) => peer.p2p_name(as_uid),
                    Err(_) => t.to_string(),
                });
                self.ctx
                    .store
                    .subs_for_user(as_uid, keep_deleted)
                    .await
                    .map_err(|e| storage_error(&self.name, "subs_for_user", e))?
                    .into_iter()
                    .filter(|s| s.topic != self.name)
                    .filter(|s| wanted.as_ref().map_or(true, |w| *w == s.topic))
                    .collect::<Vec<_>>()
            }
            TopicCategory::Fnd => self.find(session, as_uid).await?,
            TopicCategory::P2P | TopicCategory::Grp => self
                .ctx
                .store
                .subs_for_topic(&self.name, keep_deleted)
                .await
                .map_err(|e| storage_error(&self.name, "subs_for_topic", e))?
                .into_iter()
                .filter(|s| opts.user.map_or(true, |u| u == s.user))
                .collect(),
        };
        if opts.limit > 0 {
            subs.truncate(opts.limit);
        }

        let presencer = requester_mode.is_presencer();
        let mut entries = Vec::with_capacity(subs.len());
        for sub in &subs {
            if let Some(entry) = self.describe_sub(sub, as_uid, opts, presencer) {
                entries.push(entry);
            }
        }

        if entries.is_empty() {
            session.queue_out(ServerMessage::Ctrl(MsgCtrl::ok(
                id,
                toriginal,
                Some(json!({ "what": "sub" })),
            )));
        } else {
            let mut meta = MsgMeta::new(id, toriginal);
            meta.sub = Some(entries);
            session.queue_out(ServerMessage::Meta(meta));
        }
        Ok(())
    }

    /// One entry of a subscription list, `None` for entries deleted before
    /// the client's cut-off.
    fn describe_sub(
        &self,
        sub: &Subscription,
        as_uid: Uid,
        opts: &GetOpts,
        presencer: bool,
    ) -> Option<MsgTopicSub> {
        let mut mts = MsgTopicSub::default();
        let deleted = sub.deleted_at.is_some();

        let send_pub_priv = match opts.if_modified_since {
            None => true,
            Some(since) => {
                if let Some(deleted_at) = sub.deleted_at {
                    if deleted_at <= since {
                        return None;
                    }
                    mts.deleted = Some(deleted_at);
                }
                !deleted && sub.updated > since
            }
        };

        let mode = sub.mode_want & sub.mode_given;
        let is_reader = mode.is_reader();
        let mut banned = false;

        match self.category {
            TopicCategory::Me => {
                banned = !mode.is_joiner();
                let with = match Uid::from_p2p_name(&sub.topic) {
                    Some((a, b)) if a == as_uid => b.user_id(),
                    Some((a, _)) => a.user_id(),
                    None => sub.topic.clone(),
                };
                mts.online = self.per_subs.get(&with).is_some_and(|p| p.online) && !deleted && presencer;
                mts.topic = Some(with);
                if !deleted && !banned && is_reader {
                    mts.seq = sub.seq_id;
                    mts.clear = sub.del_id;
                }
            }
            TopicCategory::Fnd => {
                if !sub.user.is_zero() {
                    mts.user = Some(sub.user);
                }
                mts.topic = Some(sub.topic.clone());
            }
            TopicCategory::P2P | TopicCategory::Grp => {
                banned = self.category == TopicCategory::Grp && !mode.is_joiner();
                mts.user = Some(sub.user);
                if !deleted {
                    if sub.user == as_uid && is_reader && !banned {
                        mts.clear = sub.del_id;
                    }
                    if self.category == TopicCategory::Grp {
                        mts.online = self
                            .per_user
                            .get(&sub.user)
                            .is_some_and(|p| p.online > 0)
                            && presencer;
                    }
                }
            }
        }

        if !deleted {
            mts.updated = Some(sub.updated);
            if is_reader && !banned {
                mts.read = sub.read_id;
                mts.recv = sub.recv_id;
            }
            if self.category == TopicCategory::Fnd {
                mts.public = sub.public.clone();
                mts.private = sub.private.clone();
            } else {
                mts.acs = Some(MsgAccessMode::new(sub.mode_want, sub.mode_given));
                if send_pub_priv {
                    mts.public = sub.public.clone();
                    if sub.user == as_uid {
                        mts.private = sub.private.clone();
                    }
                }
            }
        }

        Some(mts)
    }

    /// `fnd`: run the session's query, or the stored one.
    async fn find(&self, session: &Session, as_uid: Uid) -> Result<Vec<Subscription>, TopicError> {
        let raw = self
            .fnd_public
            .get(session.sid())
            .or_else(|| self.per_user.get(&as_uid).and_then(|p| p.private.as_ref()));

        let Some(Value::String(query)) = raw else {
            return Ok(Vec::new());
        };
        let tags = parse_search_query(query);
        if tags.is_empty() {
            return Err(TopicError::Malformed("empty search query".into()));
        }

        self.ctx
            .store
            .find_subs(as_uid, &tags)
            .await
            .map_err(|e| storage_error(&self.name, "find_subs", e))
    }

    async fn reply_get_data(
        &self,
        session: &Session,
        as_uid: Uid,
        id: Option<&str>,
        toriginal: &str,
        opts: &GetOpts,
    ) -> Result<(), TopicError> {
        if opts.if_modified_since.is_some() || opts.user.is_some() || opts.topic.is_some() {
            return Err(TopicError::Malformed("invalid data query".into()));
        }

        let mut count = 0;
        if self.effective_mode(as_uid).is_reader() {
            let messages = self
                .ctx
                .store
                .messages_get_all(&self.name, as_uid, &QueryOpt::from(opts))
                .await
                .map_err(|e| storage_error(&self.name, "messages_get_all", e))?;

            count = messages.len();
            for msg in messages.into_iter().rev() {
                session.queue_out(ServerMessage::Data(MsgData {
                    topic: toriginal.to_string(),
                    from: msg.from,
                    seq: msg.seq_id,
                    head: msg.head,
                    content: msg.content,
                    ts: msg.created,
                }));
            }
        }

        session.queue_out(ServerMessage::Ctrl(MsgCtrl::ok(
            id,
            toriginal,
            Some(json!({ "what": "data", "count": count })),
        )));
        Ok(())
    }

    async fn reply_get_del(
        &self,
        session: &Session,
        as_uid: Uid,
        id: Option<&str>,
        toriginal: &str,
        opts: &GetOpts,
    ) -> Result<(), TopicError> {
        if opts.if_modified_since.is_some() || opts.user.is_some() || opts.topic.is_some() {
            return Err(TopicError::Malformed("invalid del query".into()));
        }

        if self.effective_mode(as_uid).is_reader() {
            let (ranges, del_id) = self
                .ctx
                .store
                .messages_get_deleted(&self.name, as_uid, &QueryOpt::from(opts))
                .await
                .map_err(|e| storage_error(&self.name, "messages_get_deleted", e))?;

            if !ranges.is_empty() {
                let mut meta = MsgMeta::new(id, toriginal);
                meta.del = Some(MsgDelValues {
                    clear: del_id,
                    delseq: ranges.into_iter().map(delrange::DelRange::to_wire).collect(),
                });
                session.queue_out(ServerMessage::Meta(meta));
                return Ok(());
            }
        }

        session.queue_out(ServerMessage::Ctrl(MsgCtrl::ok(
            id,
            toriginal,
            Some(json!({ "what": "del" })),
        )));
        Ok(())
    }

    fn check_tags_access(&self, as_uid: Uid) -> Result<(), TopicError> {
        match self.category {
            TopicCategory::Fnd => Ok(()),
            TopicCategory::Grp if self.owner == as_uid => Ok(()),
            TopicCategory::Grp => Err(TopicError::PermissionDenied("tags are owner only".into())),
            TopicCategory::Me | TopicCategory::P2P => Err(TopicError::OperationNotAllowed(
                "topic has no tags".into(),
            )),
        }
    }

    fn reply_get_tags(
        &self,
        session: &Session,
        as_uid: Uid,
        id: Option<&str>,
        toriginal: &str,
    ) -> Result<(), TopicError> {
        self.check_tags_access(as_uid)?;

        if self.tags.is_empty() {
            session.queue_out(ServerMessage::Ctrl(MsgCtrl::ok(
                id,
                toriginal,
                Some(json!({ "what": "tags" })),
            )));
        } else {
            let mut meta = MsgMeta::new(id, toriginal);
            meta.tags = Some(self.tags.clone());
            session.queue_out(ServerMessage::Meta(meta));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Set
    // ------------------------------------------------------------------

    async fn reply_set(
        &mut self,
        session: &Arc<Session>,
        as_uid: Uid,
        level: AuthLevel,
        id: Option<&str>,
        topic: &str,
        query: SetQuery,
    ) -> Result<(), TopicError> {
        let SetQuery { desc, sub, tags } = query;
        if desc.is_none() && sub.is_none() && tags.is_none() {
            return Err(TopicError::Malformed("empty set request".into()));
        }

        if let Some(desc) = desc {
            self.reply_set_desc(session, as_uid, id, topic, desc).await?;
        }
        if let Some(sub) = sub {
            self.reply_set_sub(session, as_uid, level, id, topic, sub)
                .await?;
        }
        if let Some(tags) = tags {
            self.reply_set_tags(session, as_uid, id, topic, &tags)
                .await?;
        }
        Ok(())
    }

    /// Validate a default access update. Returns the new value if it
    /// differs from the current one.
    fn assign_access(&self, mode: Option<DefaultAccess>) -> Result<Option<DefaultAccess>, TopicError> {
        let Some(mode) = mode else {
            return Ok(None);
        };
        if mode.auth.is_owner() || mode.anon.is_owner() {
            return Err(TopicError::Malformed(
                "default owner access is not permitted".into(),
            ));
        }

        let restrict = |m: AccessMode| {
            if self.category == TopicCategory::Me {
                // Default access of two-party topics: `N` or must include `A`.
                let m = m & AccessMode::CP2P;
                if m == AccessMode::NONE {
                    m
                } else {
                    m | AccessMode::APPROVE
                }
            } else {
                m
            }
        };

        let mut access = self.access;
        if mode.auth.is_defined() {
            access.auth = restrict(mode.auth);
        }
        if mode.anon.is_defined() {
            access.anon = restrict(mode.anon);
        }
        Ok((access != self.access).then_some(access))
    }

    async fn reply_set_desc(
        &mut self,
        session: &Arc<Session>,
        as_uid: Uid,
        id: Option<&str>,
        topic: &str,
        desc: SetDesc,
    ) -> Result<(), TopicError> {
        let mut access = None;
        let mut public = None;

        match self.category {
            TopicCategory::Me => {
                access = self.assign_access(desc.default_acs)?;
                public = merged(self.public.as_ref(), desc.public.as_ref());
            }
            TopicCategory::Grp if self.owner == as_uid => {
                access = self.assign_access(desc.default_acs)?;
                public = merged(self.public.as_ref(), desc.public.as_ref());
            }
            TopicCategory::Grp | TopicCategory::P2P => {
                if desc.public.is_some() || desc.default_acs.is_some() {
                    return Err(TopicError::PermissionDenied(
                        "only the owner can change the description".into(),
                    ));
                }
            }
            TopicCategory::Fnd => {}
        }

        let fnd_public = if self.category == TopicCategory::Fnd {
            merged(self.fnd_public.get(session.sid()), desc.public.as_ref())
        } else {
            None
        };

        let current_private = self.per_user.get(&as_uid).and_then(|p| p.private.as_ref());
        let private = merged(current_private, desc.private.as_ref());

        if access.is_some() || public.is_some() {
            let as_value = |v: &Option<Value>| Some(v.clone().unwrap_or(Value::Null));
            match self.category {
                TopicCategory::Me => {
                    let update = UserUpdate {
                        access,
                        public: public.as_ref().and_then(as_value),
                        tags: None,
                    };
                    self.ctx
                        .store
                        .user_update(as_uid, update)
                        .await
                        .map_err(|e| storage_error(&self.name, "user_update", e))?;
                }
                _ => {
                    let update = TopicUpdate {
                        access,
                        public: public.as_ref().and_then(as_value),
                        tags: None,
                    };
                    self.ctx
                        .store
                        .topic_update(&self.name, update)
                        .await
                        .map_err(|e| storage_error(&self.name, "topic_update", e))?;
                }
            }
        }
        if let Some(private) = &private {
            let update = SubUpdate {
                private: Some(private.clone().unwrap_or(Value::Null)),
                ..SubUpdate::default()
            };
            self.ctx
                .store
                .sub_update(&self.name, as_uid, update)
                .await
                .map_err(|e| storage_error(&self.name, "sub_update", e))?;
        }

        let send_common = access.is_some() || public.is_some();
        if !send_common && private.is_none() && fnd_public.is_none() {
            return Err(TopicError::NotModified);
        }

        if let Some(access) = access {
            self.access = access;
        }
        if let Some(public) = public {
            self.public = public;
        }
        if let Some(query) = fnd_public {
            match query {
                Some(q) => {
                    self.fnd_public.insert(session.sid().to_string(), q);
                }
                None => {
                    self.fnd_public.remove(session.sid());
                }
            }
        }
        if let Some(private) = &private {
            if let Some(pud) = self.per_user.get_mut(&as_uid) {
                pud.private.clone_from(private);
            }
        }

        if send_common {
            if self.category == TopicCategory::Me {
                self.pres_users_of_interest("upd", "");
            } else {
                self.pres_subs_offline(
                    "upd",
                    &PresParams::default(),
                    &PresFilters::default().excluding(as_uid),
                    Some(session.sid()),
                    false,
                );
                plugins::log_failure(
                    "topic",
                    &self.name,
                    self.ctx.plugins.topic(&self.name, PluginAction::Updated).await,
                );
            }
        }
        if send_common || private.is_some() {
            self.pres_single_user_offline(
                as_uid,
                "upd",
                &PresParams::default(),
                Some(session.sid()),
                false,
            );
        }

        session.queue_out(ServerMessage::Ctrl(MsgCtrl::ok(id, topic, None)));
        Ok(())
    }

    async fn reply_set_sub(
        &mut self,
        session: &Arc<Session>,
        as_uid: Uid,
        level: AuthLevel,
        id: Option<&str>,
        topic: &str,
        sub: SetSub,
    ) -> Result<(), TopicError> {
        let target = sub.user.filter(|u| !u.is_zero()).unwrap_or(as_uid);

        let changed = if target == as_uid {
            self.request_sub(session, as_uid, level, sub.mode, None)
                .await?
        } else {
            self.approve_sub(session, as_uid, target, sub.mode).await?
        };

        if !changed {
            return Err(TopicError::NotModified);
        }

        let mut params = match self.per_user.get(&target) {
            Some(pud) => json!({ "acs": MsgAccessMode::new(pud.mode_want, pud.mode_given) }),
            None => json!({}),
        };
        if target != as_uid {
            params["user"] = json!(target.user_id());
        }
        session.queue_out(ServerMessage::Ctrl(MsgCtrl::ok(id, topic, Some(params))));
        Ok(())
    }

    async fn reply_set_tags(
        &mut self,
        session: &Session,
        as_uid: Uid,
        id: Option<&str>,
        topic: &str,
        tags: &[String],
    ) -> Result<(), TopicError> {
        self.check_tags_access(as_uid)?;

        let tags = normalize_tags(tags);
        if tags.is_empty() {
            return Err(TopicError::NotModified);
        }
        let added = missing_from(&tags, &self.tags);
        let removed = missing_from(&self.tags, &tags);
        if added == 0 && removed == 0 {
            return Err(TopicError::NotModified);
        }

        if self.category == TopicCategory::Fnd {
            let update = UserUpdate {
                tags: Some(tags.clone()),
                ..UserUpdate::default()
            };
            self.ctx
                .store
                .user_update(as_uid, update)
                .await
                .map_err(|e| storage_error(&self.name, "user_update", e))?;
        } else {
            let update = TopicUpdate {
                tags: Some(tags.clone()),
                ..TopicUpdate::default()
            };
            self.ctx
                .store
                .topic_update(&self.name, update)
                .await
                .map_err(|e| storage_error(&self.name, "topic_update", e))?;
        }
        self.tags = tags;

        let mut params = json!({});
        if added > 0 {
            params["added"] = json!(added);
        }
        if removed > 0 {
            params["removed"] = json!(removed);
        }
        session.queue_out(ServerMessage::Ctrl(MsgCtrl::ok(id, topic, Some(params))));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Del
    // ------------------------------------------------------------------

    async fn reply_del(
        &mut self,
        session: &Arc<Session>,
        as_uid: Uid,
        id: Option<&str>,
        topic: &str,
        query: DelQuery,
    ) -> Result<(), TopicError> {
        match query {
            DelQuery::Msg { ranges, hard } => {
                self.reply_del_msg(session, as_uid, id, topic, &ranges, hard)
                    .await
            }
            DelQuery::Sub { user } => self.reply_del_sub(session, as_uid, id, topic, user).await,
            DelQuery::Topic { .. } => self.reply_del_topic(session, as_uid, id, topic).await,
        }
    }

    async fn reply_del_msg(
        &mut self,
        session: &Session,
        as_uid: Uid,
        id: Option<&str>,
        topic: &str,
        ranges: &[DelRangeWire],
        hard: bool,
    ) -> Result<(), TopicError> {
        let mode = self.effective_mode(as_uid);
        let hard = if mode.is_deleter() {
            hard
        } else if mode.is_reader() {
            false
        } else {
            return Err(TopicError::PermissionDenied("no read access".into()));
        };

        let set = delrange::prepare(ranges, self.last_id, self.ctx.config.max_delete_count)?;

        let for_user = (!hard).then_some(as_uid);
        self.ctx
            .store
            .messages_delete_list(&self.name, self.del_id + 1, for_user, &set.ranges)
            .await
            .map_err(|e| storage_error(&self.name, "messages_delete_list", e))?;

        self.del_id += 1;
        let del_id = self.del_id;
        let params = PresParams {
            del_id,
            del_seq: set.ranges.iter().map(|r| r.to_wire()).collect(),
            actor: Some(as_uid),
            ..PresParams::default()
        };

        if hard {
            for pud in self.per_user.values_mut() {
                pud.del_id = del_id;
            }
            let readers = PresFilters::filter_in(AccessMode::READ);
            self.pres_subs_online("del", &as_uid.user_id(), &params, &readers, Some(session.sid()));
            self.pres_subs_offline("del", &params, &readers, Some(session.sid()), true);
        } else {
            if let Some(pud) = self.per_user.get_mut(&as_uid) {
                pud.del_id = del_id;
            }
            self.pres_single_user_offline(as_uid, "del", &params, Some(session.sid()), true);
        }

        session.queue_out(ServerMessage::Ctrl(MsgCtrl::ok(
            id,
            topic,
            Some(json!({ "del": del_id })),
        )));
        Ok(())
    }

    async fn reply_del_sub(
        &mut self,
        session: &Session,
        as_uid: Uid,
        id: Option<&str>,
        topic: &str,
        target: Uid,
    ) -> Result<(), TopicError> {
        if !self.effective_mode(as_uid).is_admin() {
            return Err(TopicError::PermissionDenied("no admin rights".into()));
        }
        if target.is_zero() || target == as_uid {
            return Err(TopicError::PermissionDenied(
                "cannot delete own subscription".into(),
            ));
        }
        if self.category == TopicCategory::P2P {
            return Err(TopicError::PermissionDenied(
                "cannot delete a two-party subscription".into(),
            ));
        }

        let Some(pud) = self.per_user.get(&target) else {
            return Err(TopicError::NoAction);
        };
        if pud.mode().is_owner() {
            return Err(TopicError::PermissionDenied("cannot evict the owner".into()));
        }
        if !pud.mode_want.is_joiner() {
            return Err(TopicError::PermissionDenied(
                "cannot delete a banned subscription".into(),
            ));
        }
        let (want, given) = (pud.mode_want, pud.mode_given);

        self.ctx
            .store
            .sub_delete(&self.name, target)
            .await
            .map_err(|e| storage_error(&self.name, "sub_delete", e))?;

        session.queue_out(ServerMessage::Ctrl(MsgCtrl::ok(id, topic, None)));

        self.notify_sub_change(
            target,
            as_uid,
            (want, given),
            (AccessMode::UNSET, AccessMode::UNSET),
            Some(session.sid()),
        );
        self.evict_user(target, true, None);
        Ok(())
    }

    /// The owner deletes the topic. Anyone else leaves and unsubscribes,
    /// except the last party of a two-party topic, who deletes it.
    async fn reply_del_topic(
        &mut self,
        session: &Arc<Session>,
        as_uid: Uid,
        id: Option<&str>,
        topic: &str,
    ) -> Result<(), TopicError> {
        let deletes = self.owner == as_uid
            || (self.category == TopicCategory::P2P && self.subs_count() < 2);
        if !deletes {
            return self.leave_unsub(session, as_uid, id).await;
        }

        self.suspend();
        let requester = Requester {
            session: Arc::clone(session),
            id: id.map(ToString::to_string),
            topic: topic.to_string(),
        };
        if !self.hub.request_delete(&self.name, requester) {
            self.resume();
            return Err(TopicError::Busy);
        }
        Ok(())
    }
}
