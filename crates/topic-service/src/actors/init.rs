//! Topic initialization.
//!
//! Resolves the name a client addressed to an internal topic name, then
//! loads (or creates) the topic's state from storage.

use super::messages::JoinRequest;
use super::topic::{storage_error, PerUser, TopicSeed};
use crate::context::ServerContext;
use crate::errors::TopicError;
use crate::store::{Subscription, TopicRecord, User};

use chrono::Utc;
use common::{new_group_name, AccessMode, DefaultAccess, TopicCategory, Uid};
use std::collections::HashMap;
use tracing::{debug, info};

/// Internal name and category of an existing topic as `uid` addresses it.
///
/// `new…` names are rejected here; only a join can create a topic.
///
/// # Errors
///
/// `Malformed` for unknown or self-addressed names, `PermissionDenied` for
/// unauthenticated callers.
pub(super) fn resolve_name(topic: &str, uid: Uid) -> Result<(String, TopicCategory), TopicError> {
    if uid.is_zero() {
        return Err(TopicError::PermissionDenied("authentication required".into()));
    }
    let category = TopicCategory::from_name(topic)
        .ok_or_else(|| TopicError::Malformed(format!("unknown topic {topic}")))?;

    let name = match category {
        TopicCategory::Me => uid.user_id(),
        TopicCategory::Fnd => uid.fnd_name(),
        TopicCategory::P2P => {
            if let Ok(peer) = Uid::parse_user_id(topic) {
                if peer == uid {
                    return Err(TopicError::Malformed("cannot talk to self".into()));
                }
                peer.p2p_name(uid)
            } else {
                match Uid::from_p2p_name(topic) {
                    Some((a, b)) if a == uid || b == uid => topic.to_string(),
                    Some(_) => {
                        return Err(TopicError::PermissionDenied(
                            "not a party of this topic".into(),
                        ))
                    }
                    None => return Err(TopicError::Malformed(format!("invalid topic {topic}"))),
                }
            }
        }
        TopicCategory::Grp if TopicCategory::is_new_group_request(topic) => {
            return Err(TopicError::Malformed("topic is not created yet".into()));
        }
        TopicCategory::Grp => topic.to_string(),
    };
    Ok((name, category))
}

/// Name for a new group topic, or the resolved name of an existing one.
///
/// Returns `true` when the join creates the topic.
pub(super) fn resolve_join_name(
    topic: &str,
    uid: Uid,
) -> Result<(String, TopicCategory, bool), TopicError> {
    if TopicCategory::is_new_group_request(topic) {
        if uid.is_zero() {
            return Err(TopicError::PermissionDenied("authentication required".into()));
        }
        return Ok((new_group_name(), TopicCategory::Grp, true));
    }
    let (name, category) = resolve_name(topic, uid)?;
    Ok((name, category, false))
}

fn per_user_from(sub: &Subscription) -> PerUser {
    let mut pud = PerUser::new(sub.mode_want, sub.mode_given);
    pud.created = sub.created;
    pud.updated = sub.updated;
    pud.read_id = sub.read_id;
    pud.recv_id = sub.recv_id;
    pud.del_id = sub.del_id;
    pud.private.clone_from(&sub.private);
    pud.deleted = sub.deleted_at.is_some();
    pud
}

async fn load_user(ctx: &ServerContext, topic: &str, uid: Uid) -> Result<User, TopicError> {
    ctx.store
        .user_get(uid)
        .await
        .map_err(|e| storage_error(topic, "user_get", e))?
        .ok_or_else(|| TopicError::UserNotFound(uid.user_id()))
}

/// Load the state of `name` for the first join, creating the topic when the
/// request asks for it. Marks the request as `loaded`.
pub(super) async fn load_seed(
    ctx: &ServerContext,
    req: &mut JoinRequest,
    name: String,
    category: TopicCategory,
    create: bool,
) -> Result<TopicSeed, TopicError> {
    let seed = match category {
        TopicCategory::Me => load_me(ctx, req.as_user, name).await?,
        TopicCategory::Fnd => load_fnd(ctx, req.as_user, name).await?,
        TopicCategory::Grp if create => create_grp(ctx, req, name).await?,
        TopicCategory::Grp => load_grp(ctx, name).await?,
        TopicCategory::P2P => load_p2p(ctx, req, name).await?,
    };
    req.loaded = true;
    debug!(
        target: "topic.actor.init",
        topic = %seed.name,
        category = seed.category.as_str(),
        subscribers = seed.per_user.len(),
        "Topic state loaded"
    );
    Ok(seed)
}

async fn load_me(ctx: &ServerContext, uid: Uid, name: String) -> Result<TopicSeed, TopicError> {
    let user = load_user(ctx, &name, uid).await?;

    let mut pud = PerUser::new(AccessMode::CSELF, AccessMode::CSELF);
    let own = ctx
        .store
        .subs_for_topic(&name, false)
        .await
        .map_err(|e| storage_error(&name, "subs_for_topic", e))?
        .into_iter()
        .find(|s| s.user == uid);
    if let Some(sub) = own {
        pud.private = sub.private;
        pud.created = sub.created;
        pud.updated = sub.updated;
    }

    Ok(TopicSeed {
        name,
        xoriginal: "me".to_string(),
        category: TopicCategory::Me,
        created: user.created,
        updated: user.updated,
        touched: None,
        owner: uid,
        access: user.access,
        public: user.public,
        tags: user.tags,
        last_id: 0,
        del_id: 0,
        user_agent: user.user_agent,
        per_user: HashMap::from([(uid, pud)]),
    })
}

async fn load_fnd(ctx: &ServerContext, uid: Uid, name: String) -> Result<TopicSeed, TopicError> {
    let user = load_user(ctx, &name, uid).await?;

    Ok(TopicSeed {
        name,
        xoriginal: "fnd".to_string(),
        category: TopicCategory::Fnd,
        created: user.created,
        updated: user.updated,
        touched: None,
        owner: uid,
        access: DefaultAccess::default(),
        public: None,
        tags: user.tags,
        last_id: 0,
        del_id: 0,
        user_agent: String::new(),
        per_user: HashMap::from([(uid, PerUser::new(AccessMode::CSELF, AccessMode::CSELF))]),
    })
}

async fn create_grp(
    ctx: &ServerContext,
    req: &mut JoinRequest,
    name: String,
) -> Result<TopicSeed, TopicError> {
    let uid = req.as_user;
    let set = req.set.as_ref();
    let desc = set.and_then(|s| s.desc.as_ref());

    let mut access = DefaultAccess::default();
    if let Some(requested) = desc.and_then(|d| d.default_acs) {
        if requested.auth.is_owner() || requested.anon.is_owner() {
            return Err(TopicError::Malformed(
                "default owner access is not permitted".into(),
            ));
        }
        if requested.auth.is_defined() {
            access.auth = requested.auth;
        }
        if requested.anon.is_defined() {
            access.anon = requested.anon;
        }
    }

    let want = set
        .and_then(|s| s.sub.as_ref())
        .map(|s| s.mode)
        .filter(|m| m.is_defined())
        .unwrap_or(AccessMode::CFULL);
    let given = AccessMode::CFULL;

    let mut tags: Vec<String> = set
        .and_then(|s| s.tags.clone())
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();

    let mut record = TopicRecord::new(&name, uid);
    record.access = access;
    record.public = desc.and_then(|d| d.public.clone()).filter(|p| !p.is_null());
    record.tags.clone_from(&tags);

    let mut owner_sub = Subscription::new(&name, uid, want, given);
    owner_sub.private = desc.and_then(|d| d.private.clone()).filter(|p| !p.is_null());

    let mut pud = PerUser::new(want, given);
    pud.private.clone_from(&owner_sub.private);

    let (created, updated, public) = (record.created, record.updated, record.public.clone());
    ctx.store
        .topic_create(record, owner_sub)
        .await
        .map_err(|e| storage_error(&name, "topic_create", e))?;

    req.created = true;
    req.newsub = true;
    info!(target: "topic.actor.init", topic = %name, owner = %uid, "Group topic created");

    Ok(TopicSeed {
        xoriginal: name.clone(),
        name,
        category: TopicCategory::Grp,
        created,
        updated,
        touched: None,
        owner: uid,
        access,
        public,
        tags,
        last_id: 0,
        del_id: 0,
        user_agent: String::new(),
        per_user: HashMap::from([(uid, pud)]),
    })
}

async fn load_grp(ctx: &ServerContext, name: String) -> Result<TopicSeed, TopicError> {
    let record = ctx
        .store
        .topic_get(&name)
        .await
        .map_err(|e| storage_error(&name, "topic_get", e))?
        .ok_or_else(|| TopicError::NotFound(name.clone()))?;

    let per_user = ctx
        .store
        .subs_for_topic(&name, false)
        .await
        .map_err(|e| storage_error(&name, "subs_for_topic", e))?
        .iter()
        .map(|s| (s.user, per_user_from(s)))
        .collect();

    Ok(TopicSeed {
        xoriginal: name.clone(),
        name,
        category: TopicCategory::Grp,
        created: record.created,
        updated: record.updated,
        touched: record.touched,
        owner: record.owner,
        access: record.access,
        public: record.public,
        tags: record.tags,
        last_id: record.seq_id,
        del_id: record.del_id,
        user_agent: String::new(),
        per_user,
    })
}

/// Load a two-party topic, creating it (or restoring a side that left) when
/// the requester has no live subscription.
async fn load_p2p(
    ctx: &ServerContext,
    req: &mut JoinRequest,
    name: String,
) -> Result<TopicSeed, TopicError> {
    let uid = req.as_user;
    let (a, b) = Uid::from_p2p_name(&name)
        .ok_or_else(|| TopicError::Malformed(format!("invalid topic {name}")))?;
    let peer = if a == uid {
        b
    } else if b == uid {
        a
    } else {
        return Err(TopicError::PermissionDenied("not a party of this topic".into()));
    };

    let record = ctx
        .store
        .topic_get(&name)
        .await
        .map_err(|e| storage_error(&name, "topic_get", e))?;
    let mut subs = match &record {
        Some(_) => ctx
            .store
            .subs_for_topic(&name, true)
            .await
            .map_err(|e| storage_error(&name, "subs_for_topic", e))?,
        None => Vec::new(),
    };

    let live = |subs: &[Subscription], u: Uid| {
        subs.iter().any(|s| s.user == u && s.deleted_at.is_none())
    };

    let user = load_user(ctx, &name, uid).await?;
    let peer_user = load_user(ctx, &name, peer).await?;

    if record.is_none() || !live(&subs, uid) {
        let want = req
            .set
            .as_ref()
            .and_then(|s| s.sub.as_ref())
            .map(|s| s.mode)
            .filter(|m| m.is_defined())
            .unwrap_or(AccessMode::CP2P);

        let own = Subscription::new(&name, uid, want, peer_user.access.auth);
        // An existing peer subscription is kept as is.
        let other = subs
            .iter()
            .find(|s| s.user == peer)
            .cloned()
            .unwrap_or_else(|| {
                Subscription::new(&name, peer, peer_user.access.auth, AccessMode::CP2P)
            });

        ctx.store
            .topic_create_p2p(own.clone(), other.clone())
            .await
            .map_err(|e| storage_error(&name, "topic_create_p2p", e))?;

        req.created = record.is_none();
        req.newsub = true;
        subs = vec![own, other];
        info!(
            target: "topic.actor.init",
            topic = %name,
            initiator = %uid,
            "Two-party topic created"
        );
    }

    let publics = HashMap::from([(uid, peer_user.public), (peer, user.public)]);
    let per_user = subs
        .iter()
        .map(|s| {
            let mut pud = per_user_from(s);
            pud.public = publics.get(&s.user).cloned().flatten();
            (s.user, pud)
        })
        .collect();

    let now = Utc::now();
    let (created, updated, touched, last_id, del_id) = match record {
        Some(r) => (r.created, r.updated, r.touched, r.seq_id, r.del_id),
        None => (now, now, None, 0, 0),
    };

    Ok(TopicSeed {
        xoriginal: name.clone(),
        name,
        category: TopicCategory::P2P,
        created,
        updated,
        touched,
        owner: Uid::ZERO,
        access: DefaultAccess::new(AccessMode::CP2P, AccessMode::NONE),
        public: None,
        tags: Vec::new(),
        last_id,
        del_id,
        user_agent: String::new(),
        per_user,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_self_topics() {
        let uid = Uid::new(7);
        assert_eq!(
            resolve_name("me", uid).unwrap(),
            (uid.user_id(), TopicCategory::Me)
        );
        assert_eq!(
            resolve_name("fnd", uid).unwrap(),
            (uid.fnd_name(), TopicCategory::Fnd)
        );
    }

    #[test]
    fn test_resolve_user_name_to_p2p() {
        let alice = Uid::new(1);
        let bob = Uid::new(2);
        let (name, category) = resolve_name(&bob.user_id(), alice).unwrap();
        assert_eq!(category, TopicCategory::P2P);
        assert_eq!(name, alice.p2p_name(bob));

        // Either party may address it by its internal name.
        assert_eq!(resolve_name(&name, bob).unwrap().0, name);
        assert!(matches!(
            resolve_name(&name, Uid::new(3)),
            Err(TopicError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_bad_names() {
        let uid = Uid::new(1);
        assert!(matches!(
            resolve_name(&uid.user_id(), uid),
            Err(TopicError::Malformed(_))
        ));
        assert!(matches!(resolve_name("chat", uid), Err(TopicError::Malformed(_))));
        assert!(matches!(resolve_name("newabc", uid), Err(TopicError::Malformed(_))));
        assert!(matches!(
            resolve_name("me", Uid::ZERO),
            Err(TopicError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_resolve_join_creates_group_names() {
        let (name, category, create) = resolve_join_name("newchat", Uid::new(1)).unwrap();
        assert!(create);
        assert_eq!(category, TopicCategory::Grp);
        assert!(name.starts_with("grp"));

        let (_, _, create) = resolve_join_name("grpabc", Uid::new(1)).unwrap();
        assert!(!create);
    }
}
