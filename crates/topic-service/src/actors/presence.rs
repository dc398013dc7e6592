//! Presence fan-out.
//!
//! Two delivery paths:
//! - online: straight to sessions attached to this topic
//! - offline: routed through the hub to each subscriber's `me` topic, which
//!   reaches users who are not attached here
//!
//! A `me` topic keeps a cache of its contacts (`per_subs`). Incoming status
//! notices update the cache and are shown to the user only when a contact's
//! visible state changes.

use super::messages::{BroadcastMessage, PresFilters, PresenceNotice, TopicMessage};
use super::topic::{log_failure, storage_error, PerSubs, TopicActor};
use crate::errors::TopicError;
use crate::observability::metrics;
use crate::protocol::{DelRangeWire, MsgAccessDelta, MsgPres};
use common::{TopicCategory, Uid};
use tracing::debug;

/// Optional fields of a presence notice.
#[derive(Debug, Clone, Default)]
pub(super) struct PresParams {
    pub seq: u64,
    pub del_id: u64,
    pub del_seq: Vec<DelRangeWire>,
    pub actor: Option<Uid>,
    pub target: Option<Uid>,
    pub d_want: String,
    pub d_given: String,
    pub user_agent: String,
}

impl PresParams {
    /// Access change made by `actor`.
    pub fn access(d_want: String, d_given: String, actor: Uid) -> Self {
        Self {
            d_want,
            d_given,
            actor: Some(actor),
            ..Self::default()
        }
    }

    fn to_pres(&self, topic: &str, src: &str, what: &str) -> MsgPres {
        let dacs = (!self.d_want.is_empty() || !self.d_given.is_empty()).then(|| MsgAccessDelta {
            want: self.d_want.clone(),
            given: self.d_given.clone(),
        });
        MsgPres {
            topic: topic.to_string(),
            src: src.to_string(),
            what: what.to_string(),
            seq: self.seq,
            clear: self.del_id,
            delseq: self.del_seq.clone(),
            ua: self.user_agent.clone(),
            act: self.actor.map(Uid::user_id).unwrap_or_default(),
            tgt: self.target.map(Uid::user_id).unwrap_or_default(),
            dacs,
        }
    }
}

/// Split `status+cmd`.
fn split_what(what: &str) -> (&str, &str) {
    what.split_once('+').unwrap_or((what, ""))
}

/// Verbs delivered offline even to subscribers without the `P` bit.
fn is_always_delivered(what: &str) -> bool {
    let (status, _) = split_what(what);
    matches!(status, "gone" | "acs") || status.starts_with('?')
}

/// Result of applying a status notice to a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContactUpdate {
    /// New cache entry, `None` to drop it.
    entry: Option<PerSubs>,
    /// What the user's sessions should see.
    forward: Option<&'static str>,
    /// The sender asked for our status.
    reply_requested: bool,
}

/// Apply a status verb and command to a cached contact. Returns `None` for
/// verbs that do not describe contact status.
fn update_contact(current: Option<PerSubs>, status: &str, cmd: &str) -> Option<ContactUpdate> {
    let (online, reply_requested) = match status {
        "on" => (Some(true), false),
        "off" => (Some(false), false),
        "?none" => (None, false),
        "?unkn" => (None, true),
        _ => return None,
    };

    let was = current.unwrap_or_default();
    let visible_before = was.online && was.enabled;

    if cmd == "rem" {
        return Some(ContactUpdate {
            entry: None,
            forward: visible_before.then_some("off"),
            reply_requested: false,
        });
    }
    if current.is_none() && cmd != "en" {
        return Some(ContactUpdate {
            entry: None,
            forward: None,
            reply_requested: false,
        });
    }

    let mut psd = was;
    match cmd {
        "en" => psd.enabled = true,
        "dis" => psd.enabled = false,
        _ => {}
    }
    if let Some(online) = online {
        psd.online = online;
    }

    let visible_after = psd.online && psd.enabled;
    let forward = match (visible_before, visible_after) {
        (false, true) => Some("on"),
        (true, false) => Some("off"),
        _ => None,
    };

    Some(ContactUpdate {
        entry: Some(psd),
        forward,
        reply_requested,
    })
}

impl TopicActor {
    /// Notify sessions attached to this topic.
    pub(super) fn pres_subs_online(
        &mut self,
        what: &str,
        src: &str,
        params: &PresParams,
        filters: &PresFilters,
        skip_sid: Option<&str>,
    ) {
        let pres = params.to_pres(&self.xoriginal, src, what);
        self.deliver_pres(pres, filters, None, skip_sid);
        metrics::record_presence_fanout("online");
    }

    /// Notify attached sessions regardless of their access, e.g. `term`.
    pub(super) fn pres_subs_online_direct(&mut self, what: &str) {
        let pres = PresParams::default().to_pres(&self.xoriginal, "", what);
        self.deliver_pres(pres, &PresFilters::default(), None, None);
        metrics::record_presence_fanout("online");
    }

    /// Notify every live subscriber through their `me` topic. With
    /// `offline_only`, sessions attached here are skipped at the `me` topic.
    pub(super) fn pres_subs_offline(
        &mut self,
        what: &str,
        params: &PresParams,
        filters: &PresFilters,
        skip_sid: Option<&str>,
        offline_only: bool,
    ) {
        let always = is_always_delivered(what);
        let targets: Vec<Uid> = self
            .per_user
            .iter()
            .filter(|(_, pud)| !pud.deleted)
            .filter(|(uid, pud)| {
                let mode = pud.mode();
                (always || mode.is_presencer()) && filters.admits(**uid, mode)
            })
            .map(|(uid, _)| *uid)
            .collect();

        for uid in targets {
            match self.original(uid) {
                Ok(src) => self.route_to_me(uid, &src, what, params, skip_sid, offline_only),
                Err(e) => log_failure(&self.name, "presence", &e),
            }
        }
        metrics::record_presence_fanout("offline");
    }

    /// Notify one user through their `me` topic. Filters apply only when the
    /// user is subscribed here.
    pub(super) fn pres_single_user_offline(
        &mut self,
        uid: Uid,
        what: &str,
        params: &PresParams,
        skip_sid: Option<&str>,
        offline_only: bool,
    ) {
        if let Some(pud) = self.per_user.get(&uid) {
            if !is_always_delivered(what) && !pud.mode().is_presencer() {
                return;
            }
        }
        let src = match self.original(uid) {
            Ok(src) => src,
            Err(e) => {
                log_failure(&self.name, "presence", &e);
                return;
            }
        };
        self.route_to_me(uid, &src, what, params, skip_sid, offline_only);
        metrics::record_presence_fanout("offline");
    }

    /// Notify one user through their `me` topic about `src`, unfiltered.
    pub(super) fn pres_single_user_offline_as(&self, uid: Uid, src: &str, what: &str) {
        self.route_to_me(uid, src, what, &PresParams::default(), None, false);
        metrics::record_presence_fanout("offline");
    }

    fn route_to_me(
        &self,
        uid: Uid,
        src: &str,
        what: &str,
        params: &PresParams,
        skip_sid: Option<&str>,
        offline_only: bool,
    ) {
        let notice = PresenceNotice {
            pres: params.to_pres("me", src, what),
            filters: PresFilters::default(),
            skip_topic: offline_only.then(|| self.name.clone()),
            want_reply: false,
        };
        let msg = BroadcastMessage::presence(notice, skip_sid.map(ToString::to_string));
        if !self
            .hub
            .route(&uid.user_id(), TopicMessage::Broadcast(Box::new(msg)))
        {
            debug!(
                target: "topic.actor.presence",
                topic = %self.name,
                user = %uid,
                what,
                "Presence not routed, hub unavailable"
            );
        }
    }

    /// `me` only: tell contacts this user's status changed.
    pub(super) fn pres_users_of_interest(&self, what: &str, ua: &str) {
        if self.category != TopicCategory::Me {
            return;
        }
        let params = PresParams {
            user_agent: ua.to_string(),
            ..PresParams::default()
        };

        for contact in self.per_subs.keys() {
            let Ok(peer) = Uid::parse_user_id(contact) else {
                continue;
            };
            let notice = PresenceNotice {
                pres: params.to_pres("me", &self.name, what),
                filters: PresFilters::default(),
                skip_topic: None,
                want_reply: what == "on",
            };
            let msg = BroadcastMessage::presence(notice, None);
            self.hub
                .route(&peer.user_id(), TopicMessage::Broadcast(Box::new(msg)));
        }
        metrics::record_presence_fanout("offline");
    }

    /// Tell the user's other sessions a watermark moved.
    pub(super) fn pres_pub_message_count(
        &mut self,
        uid: Uid,
        recv: u64,
        read: u64,
        skip_sid: Option<&str>,
    ) {
        let (what, seq) = if read > 0 { ("read", read) } else { ("recv", recv) };
        let params = PresParams {
            seq,
            ..PresParams::default()
        };
        self.pres_single_user_offline(uid, what, &params, skip_sid, true);
    }

    /// Process a presence notice arriving at this topic. Returns the verb to
    /// show to sessions, empty to show nothing.
    pub(super) fn pres_proc_req(&mut self, src: &str, what: &str, want_reply: bool) -> String {
        if self.category != TopicCategory::Me {
            return what.to_string();
        }

        let (status, cmd) = split_what(what);
        let current = self.per_subs.get(src).copied();

        let Some(update) = update_contact(current, status, cmd) else {
            if status == "gone" {
                self.per_subs.remove(src);
            }
            return what.to_string();
        };

        match update.entry {
            Some(psd) => {
                self.per_subs.insert(src.to_string(), psd);
            }
            None => {
                self.per_subs.remove(src);
            }
        }

        let enabled = update.entry.is_some_and(|p| p.enabled);
        if (want_reply || update.reply_requested) && enabled {
            if let Ok(peer) = Uid::parse_user_id(src) {
                let status = if self.sessions.is_empty() { "off" } else { "on" };
                let notice = PresenceNotice {
                    pres: PresParams::default().to_pres("me", &self.name, status),
                    filters: PresFilters::default(),
                    skip_topic: None,
                    want_reply: false,
                };
                self.hub.route(
                    &peer.user_id(),
                    TopicMessage::Broadcast(Box::new(BroadcastMessage::presence(notice, None))),
                );
            }
        }

        update.forward.map(ToString::to_string).unwrap_or_default()
    }

    /// `me` only: fill the contact cache from the user's subscriptions.
    pub(super) async fn load_contacts(&mut self, uid: Uid) -> Result<(), TopicError> {
        let subs = self
            .ctx
            .store
            .subs_for_user(uid, false)
            .await
            .map_err(|e| storage_error(&self.name, "subs_for_user", e))?;

        for sub in subs {
            if sub.topic == self.name {
                continue;
            }
            let key = match Uid::from_p2p_name(&sub.topic) {
                Some((a, b)) if a == uid => b.user_id(),
                Some((a, _)) => a.user_id(),
                None => sub.topic.clone(),
            };
            let enabled = (sub.mode_want & sub.mode_given).is_presencer();
            self.per_subs.entry(key).or_default().enabled = enabled;
        }
        Ok(())
    }
}
