//! Subscription protocol.
//!
//! - `request_sub`: a user subscribes or changes their own subscription
//! - `approve_sub`: a sharer invites another user or changes their grant
//!
//! Both return whether the stored subscription changed. Every change of
//! either mode is announced through `notify_sub_change`.

use super::presence::PresParams;
use super::messages::PresFilters;
use super::topic::{log_failure, storage_error, PerUser, TopicActor};
use crate::errors::TopicError;
use crate::observability::metrics;
use crate::plugins;
use crate::protocol::{MsgCtrl, ServerMessage};
use crate::session::Session;
use crate::store::{SubUpdate, Subscription};

use common::{AccessMode, AuthLevel, TopicCategory, Uid};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

/// Want for a re-join that names no mode. `None` keeps a self-ban in place:
/// only an explicit want lifts it. Ownership is never implied.
fn implied_want(
    current: &PerUser,
    default: AccessMode,
    category: TopicCategory,
) -> Option<AccessMode> {
    if !current.mode_want.is_joiner() {
        return None;
    }
    let mut implied = current.mode_given | default;
    if !current.mode_want.is_owner() {
        implied &= !AccessMode::OWNER;
    }
    if category == TopicCategory::P2P {
        implied = (implied & AccessMode::CP2P) | AccessMode::APPROVE;
    }
    Some(implied)
}

/// An admin asking for admin rights may raise their own grant, short of `D`.
fn admin_self_grant(given: AccessMode, want: AccessMode) -> AccessMode {
    if given.is_admin() && want.is_admin() {
        given | (want & !AccessMode::DELETE)
    } else {
        given
    }
}

/// Check what `host` may grant to someone else. An unset `given` re-sends
/// the current invite.
fn approvable(
    host: AccessMode,
    given: AccessMode,
    category: TopicCategory,
    host_is_owner: bool,
) -> Result<AccessMode, TopicError> {
    if !host.is_sharer() {
        return Err(TopicError::PermissionDenied("approver has no sharing rights".into()));
    }
    if !given.is_defined() {
        return Ok(given);
    }
    if !host.is_admin() {
        return Err(TopicError::PermissionDenied(
            "sharer cannot set explicit access".into(),
        ));
    }
    if given.is_owner() && !host_is_owner {
        return Err(TopicError::PermissionDenied(
            "only the owner can transfer ownership".into(),
        ));
    }
    if category == TopicCategory::P2P {
        return Ok((given & AccessMode::CP2P) | AccessMode::APPROVE);
    }
    Ok(given)
}

impl TopicActor {
    /// Subscribe `as_uid` or update their subscription. `want` may be unset.
    #[allow(clippy::too_many_lines)]
    pub(super) async fn request_sub(
        &mut self,
        session: &Arc<Session>,
        as_uid: Uid,
        level: AuthLevel,
        want: AccessMode,
        private: Option<Value>,
    ) -> Result<bool, TopicError> {
        let existing = self.per_user.get(&as_uid).cloned();
        let mut old_want = AccessMode::NONE;
        let mut old_given = AccessMode::NONE;
        let mut changed = false;

        let pud = match existing {
            Some(current) if !current.deleted => {
                old_want = current.mode_want;
                old_given = current.mode_given;
                let mut pud = current;
                let mut want = want;
                let mut owner_change = false;

                if want.is_defined() {
                    if pud.mode_given.is_owner() {
                        if self.owner == as_uid && (!want.is_owner() || !want.is_joiner()) {
                            return Err(TopicError::PermissionDenied(
                                "owner cannot drop ownership or self-ban".into(),
                            ));
                        }
                        owner_change = want.is_owner() && !pud.mode_want.is_owner();
                        if want.is_owner() && !pud.mode_given.better_equal(want) {
                            pud.mode_given |= want;
                        }
                    } else if want.is_owner() {
                        return Err(TopicError::PermissionDenied(
                            "ownership can only be granted by the owner".into(),
                        ));
                    } else if self.category == TopicCategory::P2P {
                        want = (want & AccessMode::CP2P) | AccessMode::APPROVE;
                    } else {
                        pud.mode_given = admin_self_grant(pud.mode_given, want);
                    }
                }

                if want.is_defined() {
                    pud.mode_want = want;
                } else if let Some(implied) =
                    implied_want(&pud, self.access_for(level), self.category)
                {
                    pud.mode_want = implied;
                }

                let mut update = SubUpdate::default();
                if let Some(private) = private {
                    pud.private = (!private.is_null()).then(|| private.clone());
                    update.private = Some(private);
                }
                if pud.mode_want != old_want {
                    update.mode_want = Some(pud.mode_want);
                }
                if pud.mode_given != old_given {
                    update.mode_given = Some(pud.mode_given);
                }
                if update.private.is_some()
                    || update.mode_want.is_some()
                    || update.mode_given.is_some()
                {
                    self.ctx
                        .store
                        .sub_update(&self.name, as_uid, update)
                        .await
                        .map_err(|e| storage_error(&self.name, "sub_update", e))?;
                    changed = true;
                }

                if owner_change {
                    self.mute_if_needed(as_uid, old_want, old_given, &pud);
                    self.per_user.insert(as_uid, pud.clone());
                    self.transfer_ownership(as_uid).await?;
                }
                pud
            }
            existing => {
                if matches!(self.category, TopicCategory::Grp | TopicCategory::Fnd)
                    && self.subs_count() >= self.ctx.config.max_subscribers
                {
                    return Err(TopicError::Policy("max subscription count exceeded".into()));
                }

                let mut pud =
                    existing.unwrap_or_else(|| PerUser::new(AccessMode::NONE, AccessMode::NONE));
                if self.category == TopicCategory::P2P {
                    pud.deleted = false;
                    if want.is_defined() {
                        pud.mode_want = want;
                    }
                    pud.mode_want = (pud.mode_want & AccessMode::CP2P) | AccessMode::APPROVE;
                } else {
                    let default = self.access_for(level);
                    pud.mode_given = default;
                    pud.mode_want = if want.is_defined() { want } else { default };
                }
                pud.private = private.filter(|p| !p.is_null());

                let mut sub = Subscription::new(&self.name, as_uid, pud.mode_want, pud.mode_given);
                sub.private = pud.private.clone();
                self.ctx
                    .store
                    .sub_create(sub)
                    .await
                    .map_err(|e| storage_error(&self.name, "sub_create", e))?;
                changed = true;

                plugins::log_failure(
                    "subscription",
                    &self.name,
                    self.ctx.plugins.subscription(&self.name, as_uid).await,
                );
                pud
            }
        };

        self.mute_if_needed(as_uid, old_want, old_given, &pud);
        self.per_user.insert(as_uid, pud.clone());

        if old_want != pud.mode_want || old_given != pud.mode_given {
            self.notify_sub_change(
                as_uid,
                as_uid,
                (old_want, old_given),
                (pud.mode_want, pud.mode_given),
                Some(session.sid()),
            );
        }

        if !pud.mode_want.is_joiner() {
            self.evict_user(as_uid, false, None);
        } else if !pud.mode_given.is_joiner() {
            return Err(TopicError::PermissionDenied("user is banned".into()));
        }

        Ok(changed)
    }

    /// Announce a mute before the new modes take effect.
    fn mute_if_needed(&mut self, uid: Uid, old_want: AccessMode, old_given: AccessMode, new: &PerUser) {
        let was_presencer = (old_want & old_given).is_presencer();
        let is_presencer = self.per_user.get(&uid).is_some_and(|p| p.mode().is_presencer());
        if was_presencer && is_presencer && !new.mode().is_presencer() {
            self.pres_single_user_offline(uid, "off+dis", &PresParams::default(), None, false);
        }
    }

    /// Move ownership to `new_owner`, whose subscription already carries `O`.
    ///
    /// Two sequential writes: strip `O` from the previous owner, then repoint
    /// the topic. A failure of the second leaves the topic without an owner
    /// subscription; it is logged and returned, never rolled back.
    async fn transfer_ownership(&mut self, new_owner: Uid) -> Result<(), TopicError> {
        let old_owner = self.owner;
        let (want, given) = self
            .per_user
            .get(&old_owner)
            .map(|p| (p.mode_want & !AccessMode::OWNER, p.mode_given & !AccessMode::OWNER))
            .ok_or_else(|| TopicError::Invariant("topic owner has no subscription".into()))?;

        let update = SubUpdate {
            mode_want: Some(want),
            mode_given: Some(given),
            ..SubUpdate::default()
        };
        self.ctx
            .store
            .sub_update(&self.name, old_owner, update)
            .await
            .map_err(|e| storage_error(&self.name, "sub_update", e))?;
        if let Some(pud) = self.per_user.get_mut(&old_owner) {
            pud.mode_want = want;
            pud.mode_given = given;
        }

        if let Err(e) = self.ctx.store.topic_owner_change(&self.name, new_owner).await {
            error!(
                target: "topic.actor.topic",
                topic = %self.name,
                old_owner = %old_owner,
                new_owner = %new_owner,
                error = %e,
                "Ownership transfer incomplete: previous owner demoted, topic owner unchanged"
            );
            return Err(storage_error(&self.name, "topic_owner_change", e));
        }

        self.owner = new_owner;
        info!(
            target: "topic.actor.topic",
            topic = %self.name,
            old_owner = %old_owner,
            new_owner = %new_owner,
            "Ownership transferred"
        );
        Ok(())
    }

    /// Invite `target` or change the mode granted to them. `given` may be
    /// unset to re-send an invite.
    pub(super) async fn approve_sub(
        &mut self,
        session: &Arc<Session>,
        as_uid: Uid,
        target: Uid,
        given: AccessMode,
    ) -> Result<bool, TopicError> {
        let host = self.effective_mode(as_uid);
        let mut given = approvable(host, given, self.category, self.owner == as_uid)?;

        let (old_want, old_given) = match self.per_user.get(&target).cloned() {
            None => {
                if matches!(self.category, TopicCategory::Grp | TopicCategory::Fnd)
                    && self.subs_count() >= self.ctx.config.max_subscribers
                {
                    return Err(TopicError::Policy("max subscription count exceeded".into()));
                }
                if !given.is_defined() {
                    given = self.access_for(AuthLevel::Auth);
                }

                let user = self
                    .ctx
                    .store
                    .user_get(target)
                    .await
                    .map_err(|e| storage_error(&self.name, "user_get", e))?
                    .ok_or_else(|| TopicError::UserNotFound(target.user_id()))?;
                let want = user.access.auth;

                self.ctx
                    .store
                    .sub_create(Subscription::new(&self.name, target, want, given))
                    .await
                    .map_err(|e| storage_error(&self.name, "sub_create", e))?;
                self.per_user.insert(target, PerUser::new(want, given));

                plugins::log_failure(
                    "subscription",
                    &self.name,
                    self.ctx.plugins.subscription(&self.name, target).await,
                );
                (AccessMode::UNSET, AccessMode::UNSET)
            }
            Some(pud) => {
                if given.is_defined() && given != pud.mode_given {
                    let update = SubUpdate {
                        mode_given: Some(given),
                        ..SubUpdate::default()
                    };
                    self.ctx
                        .store
                        .sub_update(&self.name, target, update)
                        .await
                        .map_err(|e| storage_error(&self.name, "sub_update", e))?;
                    if let Some(entry) = self.per_user.get_mut(&target) {
                        entry.mode_given = given;
                    }
                }
                (pud.mode_want, pud.mode_given)
            }
        };

        let (new_want, new_given) = self
            .per_user
            .get(&target)
            .map(|p| (p.mode_want, p.mode_given))
            .ok_or_else(|| TopicError::Invariant("approved subscription missing".into()))?;

        if old_given == new_given {
            return Ok(false);
        }
        self.notify_sub_change(
            target,
            as_uid,
            (old_want, old_given),
            (new_want, new_given),
            Some(session.sid()),
        );
        Ok(true)
    }

    /// Announce a subscription change. Unset new modes mean the subscription
    /// was deleted.
    pub(super) fn notify_sub_change(
        &mut self,
        uid: Uid,
        actor: Uid,
        (old_want, old_given): (AccessMode, AccessMode),
        (new_want, new_given): (AccessMode, AccessMode),
        skip_sid: Option<&str>,
    ) {
        let unsub = !new_want.is_defined() || !new_given.is_defined();
        let target = uid.user_id();

        let d_want = if new_want.is_defined() {
            old_want.delta(new_want)
        } else {
            AccessMode::NONE.to_string()
        };
        let d_given = if new_given.is_defined() {
            old_given.delta(new_given)
        } else {
            AccessMode::NONE.to_string()
        };
        let params = PresParams {
            target: Some(uid),
            ..PresParams::access(d_want, d_given, actor)
        };
        let sharers = PresFilters::filter_in(AccessMode::CSHARER).excluding(uid);

        self.pres_subs_online("acs", &target, &params, &sharers, skip_sid);

        // New subscription or a request beyond the grant: admins approve it.
        if new_want.better_than(new_given) || old_want == AccessMode::NONE {
            self.pres_subs_offline("acs", &params, &sharers, skip_sid, true);
        }

        let was_presencer = (old_want & old_given).is_presencer();
        let is_presencer = (new_want & new_given).is_presencer();

        if unsub {
            match self.category {
                TopicCategory::P2P => {
                    self.pres_single_user_offline(
                        uid,
                        "gone",
                        &PresParams::default(),
                        skip_sid,
                        false,
                    );
                    match self.p2p_other_user(uid) {
                        Ok(uid2) => self.pres_single_user_offline_as(uid2, &target, "off"),
                        Err(e) => log_failure(&self.name, "notify", &e),
                    }
                }
                TopicCategory::Grp => {
                    self.pres_single_user_offline(
                        uid,
                        "gone",
                        &PresParams::default(),
                        skip_sid,
                        false,
                    );
                    self.pres_subs_online("off", &target, &PresParams::default(), &sharers, skip_sid);
                }
                TopicCategory::Me | TopicCategory::Fnd => {}
            }
        } else if was_presencer && !is_presencer {
            match self.original(uid) {
                Ok(source) => self.pres_single_user_offline_as(uid, &source, "off+dis"),
                Err(e) => log_failure(&self.name, "notify", &e),
            }
        } else if is_presencer && !was_presencer {
            self.pres_single_user_offline(uid, "?unkn+en", &PresParams::default(), None, false);
        }

        if !unsub {
            self.pres_single_user_offline(uid, "acs", &params, skip_sid, false);
        }
    }

    /// Detach every session of `uid`. With `unsub` the cached subscription
    /// is dropped too (kept as deleted for two-party topics).
    pub(super) fn evict_user(&mut self, uid: Uid, unsub: bool, skip_sid: Option<&str>) {
        if unsub && self.category != TopicCategory::P2P {
            self.per_user.remove(&uid);
        } else if let Some(pud) = self.per_user.get_mut(&uid) {
            pud.online = 0;
            pud.deleted |= unsub;
        }

        let toriginal = self.original(uid).unwrap_or_else(|_| self.xoriginal.clone());
        let evicted = ServerMessage::Ctrl(MsgCtrl::evicted(
            None,
            &toriginal,
            Some(json!({ "unsub": unsub })),
        ));
        let reason = if unsub { "unsubscribed" } else { "banned" };

        let attached: Vec<Arc<Session>> = self
            .sessions
            .values()
            .filter(|a| a.uids.contains(&uid))
            .map(|a| Arc::clone(&a.session))
            .collect();
        for session in attached {
            if self.rem_session(session.sid(), uid).is_empty() {
                continue;
            }
            session.detach(&self.name);
            if Some(session.sid()) != skip_sid {
                session.queue_out(evicted.clone());
            }
            metrics::record_session_evicted(reason);
        }

        if self.sessions.is_empty() {
            self.arm_kill_timer();
        }
    }

    /// Leave and delete the subscription.
    pub(super) async fn leave_unsub(
        &mut self,
        session: &Arc<Session>,
        as_uid: Uid,
        id: Option<&str>,
    ) -> Result<(), TopicError> {
        if self.owner == as_uid {
            return Err(TopicError::PermissionDenied("owner cannot unsubscribe".into()));
        }

        self.ctx
            .store
            .sub_delete(&self.name, as_uid)
            .await
            .map_err(|e| storage_error(&self.name, "sub_delete", e))?;

        if let Some(id) = id {
            let toriginal = self.original(as_uid)?;
            session.queue_out(ServerMessage::Ctrl(MsgCtrl::ok(Some(id), &toriginal, None)));
        }

        let (want, given) = self
            .per_user
            .get(&as_uid)
            .map_or((AccessMode::NONE, AccessMode::NONE), |p| {
                (p.mode_want, p.mode_given)
            });
        self.notify_sub_change(
            as_uid,
            as_uid,
            (want, given),
            (AccessMode::UNSET, AccessMode::UNSET),
            Some(session.sid()),
        );
        self.evict_user(as_uid, true, Some(session.sid()));
        Ok(())
    }
}
