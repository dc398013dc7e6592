//! In-memory storage for topic service tests.
//!
//! Implements the full [`Store`] contract over hash maps behind one mutex.
//! Clones share state, so a test can keep a handle for inspection while the
//! server owns another.
//!
//! # Example
//!
//! ```rust,ignore
//! use topic_test_utils::MemoryStore;
//!
//! let store = MemoryStore::new()
//!     .with_user(User::new(alice))
//!     .with_user(User::new(bob));
//!
//! // Make the next topic deletion fail
//! store.fail("topic_delete");
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AccessMode, DefaultAccess, Uid};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use topic_service::delrange::{normalize, DelRange};
use topic_service::store::{
    Message, QueryOpt, Store, StoreError, SubUpdate, Subscription, TopicRecord, TopicUpdate, User,
    UserUpdate,
};

/// A recorded deletion transaction.
#[derive(Debug, Clone)]
struct DelLog {
    topic: String,
    del_id: u64,
    for_user: Option<Uid>,
    ranges: Vec<DelRange>,
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<Uid, User>,
    topics: HashMap<String, TopicRecord>,
    subs: HashMap<(String, Uid), Subscription>,
    /// Messages per topic, ascending by sequence id.
    messages: HashMap<String, Vec<Message>>,
    deletions: Vec<DelLog>,
    /// Operations that fail until healed.
    failing: HashSet<String>,
}

impl Inner {
    fn check(&self, op: &str) -> Result<(), StoreError> {
        if self.failing.contains(op) {
            return Err(StoreError::Unavailable(format!("{op} failing on request")));
        }
        Ok(())
    }

    fn hidden(&self, topic: &str, for_user: Uid, seq: u64) -> bool {
        self.deletions.iter().any(|d| {
            d.topic == topic
                && d.for_user.map_or(true, |u| u == for_user)
                && d.ranges.iter().any(|r| r.contains(seq))
        })
    }

    /// Fill the read-only fields of a subscription listed for its topic.
    fn with_user_public(&self, mut sub: Subscription) -> Subscription {
        sub.public = self.users.get(&sub.user).and_then(|u| u.public.clone());
        if let Some(topic) = self.topics.get(&sub.topic) {
            sub.seq_id = topic.seq_id;
            sub.touched = topic.touched;
        }
        sub
    }

    /// Fill the read-only fields of a subscription listed for its user.
    fn with_topic_public(&self, mut sub: Subscription) -> Subscription {
        if let Some((a, b)) = Uid::from_p2p_name(&sub.topic) {
            let peer = if a == sub.user { b } else { a };
            sub.public = self.users.get(&peer).and_then(|u| u.public.clone());
        } else if let Some(topic) = self.topics.get(&sub.topic) {
            sub.public = topic.public.clone();
        }
        if let Some(topic) = self.topics.get(&sub.topic) {
            sub.seq_id = topic.seq_id;
            sub.touched = topic.touched;
        }
        sub
    }
}

/// In-memory [`Store`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Add a user together with the self-subscription of their `me` topic.
    #[must_use]
    pub fn with_user(self, user: User) -> Self {
        {
            let mut inner = self.lock();
            let me = user.id.user_id();
            inner.subs.insert(
                (me.clone(), user.id),
                Subscription::new(me, user.id, AccessMode::CSELF, AccessMode::CSELF),
            );
            inner.users.insert(user.id, user);
        }
        self
    }

    /// Add a topic and its subscriptions.
    #[must_use]
    pub fn with_topic(self, topic: TopicRecord, subs: Vec<Subscription>) -> Self {
        {
            let mut inner = self.lock();
            for sub in subs {
                inner.subs.insert((sub.topic.clone(), sub.user), sub);
            }
            inner.topics.insert(topic.name.clone(), topic);
        }
        self
    }

    /// Make every call of `op` (a [`Store`] method name) fail.
    pub fn fail(&self, op: &str) {
        self.lock().failing.insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        self.lock().failing.remove(op);
    }

    #[must_use]
    pub fn user(&self, uid: Uid) -> Option<User> {
        self.lock().users.get(&uid).cloned()
    }

    #[must_use]
    pub fn topic(&self, name: &str) -> Option<TopicRecord> {
        self.lock().topics.get(name).cloned()
    }

    #[must_use]
    pub fn sub(&self, topic: &str, uid: Uid) -> Option<Subscription> {
        self.lock().subs.get(&(topic.to_string(), uid)).cloned()
    }

    /// Stored messages of a topic, ascending.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.lock().messages.get(topic).cloned().unwrap_or_default()
    }

    /// Names of stored topics.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().topics.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user_get(&self, uid: Uid) -> Result<Option<User>, StoreError> {
        let inner = self.lock();
        inner.check("user_get")?;
        Ok(inner.users.get(&uid).cloned())
    }

    async fn user_update(&self, uid: Uid, update: UserUpdate) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("user_update")?;
        let user = inner
            .users
            .get_mut(&uid)
            .ok_or_else(|| StoreError::NotFound(uid.user_id()))?;
        if let Some(access) = update.access {
            user.access = access;
        }
        if let Some(public) = update.public {
            user.public = (!public.is_null()).then_some(public);
        }
        if let Some(tags) = update.tags {
            user.tags = tags;
        }
        user.updated = Utc::now();
        Ok(())
    }

    async fn user_update_last_seen(
        &self,
        uid: Uid,
        user_agent: &str,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("user_update_last_seen")?;
        let user = inner
            .users
            .get_mut(&uid)
            .ok_or_else(|| StoreError::NotFound(uid.user_id()))?;
        user.last_seen = Some(when);
        user.user_agent = user_agent.to_string();
        Ok(())
    }

    async fn user_get_by_cred(&self, method: &str, value: &str) -> Result<Option<Uid>, StoreError> {
        let inner = self.lock();
        inner.check("user_get_by_cred")?;
        let tag = format!("{method}:{value}");
        Ok(inner
            .users
            .values()
            .find(|u| u.tags.contains(&tag))
            .map(|u| u.id))
    }

    async fn topic_get(&self, name: &str) -> Result<Option<TopicRecord>, StoreError> {
        let inner = self.lock();
        inner.check("topic_get")?;
        Ok(inner.topics.get(name).cloned())
    }

    async fn topic_create(
        &self,
        topic: TopicRecord,
        owner_sub: Subscription,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("topic_create")?;
        if inner.topics.contains_key(&topic.name) {
            return Err(StoreError::Duplicate(topic.name));
        }
        inner
            .subs
            .insert((owner_sub.topic.clone(), owner_sub.user), owner_sub);
        inner.topics.insert(topic.name.clone(), topic);
        Ok(())
    }

    async fn topic_create_p2p(
        &self,
        initiator: Subscription,
        peer: Subscription,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("topic_create_p2p")?;
        let name = initiator.topic.clone();
        inner.topics.entry(name.clone()).or_insert_with(|| {
            let mut record = TopicRecord::new(&name, Uid::ZERO);
            record.access = DefaultAccess::new(AccessMode::CP2P, AccessMode::NONE);
            record
        });
        inner
            .subs
            .insert((initiator.topic.clone(), initiator.user), initiator);
        inner.subs.insert((peer.topic.clone(), peer.user), peer);
        Ok(())
    }

    async fn topic_update(&self, name: &str, update: TopicUpdate) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("topic_update")?;
        let topic = inner
            .topics
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if let Some(access) = update.access {
            topic.access = access;
        }
        if let Some(public) = update.public {
            topic.public = (!public.is_null()).then_some(public);
        }
        if let Some(tags) = update.tags {
            topic.tags = tags;
        }
        topic.updated = Utc::now();
        Ok(())
    }

    async fn topic_owner_change(&self, name: &str, new_owner: Uid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("topic_owner_change")?;
        let topic = inner
            .topics
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        topic.owner = new_owner;
        Ok(())
    }

    async fn topic_delete(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("topic_delete")?;
        if inner.topics.remove(name).is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        inner.subs.retain(|(topic, _), _| topic != name);
        inner.messages.remove(name);
        inner.deletions.retain(|d| d.topic != name);
        Ok(())
    }

    async fn subs_for_topic(
        &self,
        name: &str,
        keep_deleted: bool,
    ) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.lock();
        inner.check("subs_for_topic")?;
        let mut subs: Vec<Subscription> = inner
            .subs
            .values()
            .filter(|s| s.topic == name && (keep_deleted || s.deleted_at.is_none()))
            .cloned()
            .map(|s| inner.with_user_public(s))
            .collect();
        subs.sort_by_key(|s| s.user);
        Ok(subs)
    }

    async fn subs_for_user(
        &self,
        uid: Uid,
        keep_deleted: bool,
    ) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.lock();
        inner.check("subs_for_user")?;
        let mut subs: Vec<Subscription> = inner
            .subs
            .values()
            .filter(|s| s.user == uid && (keep_deleted || s.deleted_at.is_none()))
            .cloned()
            .map(|s| inner.with_topic_public(s))
            .collect();
        subs.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(subs)
    }

    async fn sub_create(&self, sub: Subscription) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("sub_create")?;
        let key = (sub.topic.clone(), sub.user);
        if inner.subs.get(&key).is_some_and(|s| s.deleted_at.is_none()) {
            return Err(StoreError::Duplicate(format!("{}/{}", sub.topic, sub.user)));
        }
        inner.subs.insert(key, sub);
        Ok(())
    }

    async fn sub_update(&self, topic: &str, uid: Uid, update: SubUpdate) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("sub_update")?;
        let sub = inner
            .subs
            .get_mut(&(topic.to_string(), uid))
            .ok_or_else(|| StoreError::NotFound(format!("{topic}/{uid}")))?;
        if let Some(want) = update.mode_want {
            sub.mode_want = want;
        }
        if let Some(given) = update.mode_given {
            sub.mode_given = given;
        }
        if let Some(private) = update.private {
            sub.private = (!private.is_null()).then_some(private);
        }
        if let Some(read) = update.read_id {
            sub.read_id = read;
        }
        if let Some(recv) = update.recv_id {
            sub.recv_id = recv;
        }
        sub.updated = Utc::now();
        Ok(())
    }

    async fn sub_delete(&self, topic: &str, uid: Uid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("sub_delete")?;
        let sub = inner
            .subs
            .get_mut(&(topic.to_string(), uid))
            .ok_or_else(|| StoreError::NotFound(format!("{topic}/{uid}")))?;
        let now = Utc::now();
        sub.deleted_at = Some(now);
        sub.updated = now;
        Ok(())
    }

    async fn find_subs(&self, uid: Uid, tags: &[String]) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.lock();
        inner.check("find_subs")?;
        let matches = |own: &[String]| own.iter().any(|t| tags.contains(t));

        let mut found: Vec<Subscription> = inner
            .users
            .values()
            .filter(|u| u.id != uid && matches(&u.tags))
            .map(|u| {
                let mode = u.access.auth;
                let mut sub = Subscription::new(u.id.user_id(), u.id, mode, mode);
                sub.public = u.public.clone();
                sub
            })
            .collect();
        found.extend(
            inner
                .topics
                .values()
                .filter(|t| Uid::from_p2p_name(&t.name).is_none() && matches(&t.tags))
                .map(|t| {
                    let mode = t.access.auth;
                    let mut sub = Subscription::new(&t.name, Uid::ZERO, mode, mode);
                    sub.public = t.public.clone();
                    sub
                }),
        );
        found.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(found)
    }

    async fn message_save(&self, msg: &Message) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("message_save")?;
        let topic = inner
            .topics
            .get_mut(&msg.topic)
            .ok_or_else(|| StoreError::NotFound(msg.topic.clone()))?;
        topic.seq_id = msg.seq_id;
        topic.touched = Some(msg.created);
        if let Some(sub) = inner.subs.get_mut(&(msg.topic.clone(), msg.from)) {
            sub.read_id = msg.seq_id;
            sub.recv_id = msg.seq_id;
        }
        inner
            .messages
            .entry(msg.topic.clone())
            .or_default()
            .push(msg.clone());
        Ok(())
    }

    async fn messages_get_all(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpt,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.lock();
        inner.check("messages_get_all")?;
        let mut msgs: Vec<Message> = inner
            .messages
            .get(topic)
            .map(|all| {
                all.iter()
                    .rev()
                    .filter(|m| m.seq_id >= opts.since)
                    .filter(|m| opts.before == 0 || m.seq_id < opts.before)
                    .filter(|m| !inner.hidden(topic, for_user, m.seq_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if opts.limit > 0 {
            msgs.truncate(opts.limit);
        }
        Ok(msgs)
    }

    async fn messages_delete_list(
        &self,
        topic: &str,
        del_id: u64,
        for_user: Option<Uid>,
        ranges: &[DelRange],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check("messages_delete_list")?;
        match for_user {
            None => {
                if let Some(all) = inner.messages.get_mut(topic) {
                    all.retain(|m| !ranges.iter().any(|r| r.contains(m.seq_id)));
                }
                if let Some(record) = inner.topics.get_mut(topic) {
                    record.del_id = del_id;
                }
                for ((t, _), sub) in &mut inner.subs {
                    if t == topic {
                        sub.del_id = del_id;
                    }
                }
            }
            Some(uid) => {
                if let Some(sub) = inner.subs.get_mut(&(topic.to_string(), uid)) {
                    sub.del_id = del_id;
                }
            }
        }
        inner.deletions.push(DelLog {
            topic: topic.to_string(),
            del_id,
            for_user,
            ranges: ranges.to_vec(),
        });
        Ok(())
    }

    async fn messages_get_deleted(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpt,
    ) -> Result<(Vec<DelRange>, u64), StoreError> {
        let inner = self.lock();
        inner.check("messages_get_deleted")?;
        let logs: Vec<&DelLog> = inner
            .deletions
            .iter()
            .filter(|d| d.topic == topic && d.for_user.map_or(true, |u| u == for_user))
            .filter(|d| d.del_id >= opts.since)
            .filter(|d| opts.before == 0 || d.del_id < opts.before)
            .collect();
        let max_id = logs.iter().map(|d| d.del_id).max().unwrap_or(0);
        let ranges = logs.iter().flat_map(|d| d.ranges.iter().copied()).collect();
        Ok((normalize(ranges), max_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(topic: &str, seq: u64, from: Uid) -> Message {
        Message {
            topic: topic.to_string(),
            seq_id: seq,
            from,
            created: Utc::now(),
            head: None,
            content: json!(format!("m{seq}")),
        }
    }

    #[tokio::test]
    async fn test_with_user_creates_self_subscription() {
        let alice = Uid::new(1);
        let store = MemoryStore::new().with_user(User::new(alice));
        let sub = store.sub(&alice.user_id(), alice).unwrap();
        assert_eq!(sub.mode_want, AccessMode::CSELF);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_only_for_user() {
        let alice = Uid::new(1);
        let bob = Uid::new(2);
        let store = MemoryStore::new().with_topic(TopicRecord::new("grpx", alice), vec![]);
        for seq in 1..=3 {
            store.message_save(&message("grpx", seq, alice)).await.unwrap();
        }

        store
            .messages_delete_list("grpx", 1, Some(alice), &[DelRange::new(2, 3)])
            .await
            .unwrap();

        let for_alice = store
            .messages_get_all("grpx", alice, &QueryOpt::default())
            .await
            .unwrap();
        let for_bob = store
            .messages_get_all("grpx", bob, &QueryOpt::default())
            .await
            .unwrap();
        assert_eq!(for_alice.len(), 2);
        assert_eq!(for_bob.len(), 3);
        assert_eq!(for_bob.first().unwrap().seq_id, 3);

        let (ranges, del_id) = store
            .messages_get_deleted("grpx", bob, &QueryOpt::default())
            .await
            .unwrap();
        assert!(ranges.is_empty());
        assert_eq!(del_id, 0);
    }

    #[tokio::test]
    async fn test_failing_operation() {
        let store = MemoryStore::new();
        store.fail("topic_get");
        assert!(store.topic_get("grpx").await.is_err());
        store.heal("topic_get");
        assert!(store.topic_get("grpx").await.unwrap().is_none());
    }
}
