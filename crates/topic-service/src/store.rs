//! Storage adapter contract.
//!
//! The topic actor persists users, topics, subscriptions and messages through
//! the [`Store`] trait. Calls are awaited inline by the actor, so no other
//! mailbox item of the same topic runs while a call is outstanding. The actor
//! never retries a failed call.

use crate::delrange::DelRange;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AccessMode, DefaultAccess, Uid};
use serde_json::Value;
use thiserror::Error;

/// Storage adapter error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage internal error: {0}")]
    Internal(String),
}

/// User account.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub user_agent: String,
    /// Default access the user grants on two-party topics, and what the user
    /// wants when invited elsewhere.
    pub access: DefaultAccess,
    pub public: Option<Value>,
    pub tags: Vec<String>,
}

impl User {
    #[must_use]
    pub fn new(id: Uid) -> Self {
        let now = Utc::now();
        Self {
            id,
            created: now,
            updated: now,
            last_seen: None,
            user_agent: String::new(),
            access: DefaultAccess::new(AccessMode::CP2P, AccessMode::NONE),
            public: None,
            tags: Vec::new(),
        }
    }
}

/// Durable topic record.
#[derive(Debug, Clone)]
pub struct TopicRecord {
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub touched: Option<DateTime<Utc>>,
    pub owner: Uid,
    pub access: DefaultAccess,
    pub public: Option<Value>,
    pub tags: Vec<String>,
    pub seq_id: u64,
    pub del_id: u64,
}

impl TopicRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, owner: Uid) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            created: now,
            updated: now,
            touched: None,
            owner,
            access: DefaultAccess::default(),
            public: None,
            tags: Vec::new(),
            seq_id: 0,
            del_id: 0,
        }
    }
}

/// Durable (topic, user) subscription.
///
/// `public`, `seq_id` and `touched` are filled by reads. Listing a topic's
/// subscribers returns each user's public data; listing a user's
/// subscriptions returns each topic's (or the peer's, for two-party topics).
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    pub user: Uid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    pub private: Option<Value>,
    pub del_id: u64,
    pub read_id: u64,
    pub recv_id: u64,
    pub public: Option<Value>,
    pub seq_id: u64,
    pub touched: Option<DateTime<Utc>>,
}

impl Subscription {
    #[must_use]
    pub fn new(topic: impl Into<String>, user: Uid, want: AccessMode, given: AccessMode) -> Self {
        let now = Utc::now();
        Self {
            topic: topic.into(),
            user,
            created: now,
            updated: now,
            deleted_at: None,
            mode_want: want,
            mode_given: given,
            private: None,
            del_id: 0,
            read_id: 0,
            recv_id: 0,
            public: None,
            seq_id: 0,
            touched: None,
        }
    }
}

/// Stored message.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub seq_id: u64,
    pub from: Uid,
    pub created: DateTime<Utc>,
    pub head: Option<Value>,
    pub content: Value,
}

/// Paging options for reads.
#[derive(Debug, Clone, Default)]
pub struct QueryOpt {
    /// Lowest id to return, inclusive.
    pub since: u64,
    /// Id to stop before, exclusive. Zero means no upper bound.
    pub before: u64,
    /// Maximum entries. Zero means the adapter default.
    pub limit: usize,
}

/// Partial subscription update. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct SubUpdate {
    pub mode_want: Option<AccessMode>,
    pub mode_given: Option<AccessMode>,
    pub private: Option<Value>,
    pub read_id: Option<u64>,
    pub recv_id: Option<u64>,
}

/// Partial topic update.
#[derive(Debug, Clone, Default)]
pub struct TopicUpdate {
    pub access: Option<DefaultAccess>,
    pub public: Option<Value>,
    pub tags: Option<Vec<String>>,
}

/// Partial user update.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub access: Option<DefaultAccess>,
    pub public: Option<Value>,
    pub tags: Option<Vec<String>>,
}

/// Durable storage used by topic actors.
#[async_trait]
pub trait Store: Send + Sync {
    async fn user_get(&self, uid: Uid) -> Result<Option<User>, StoreError>;

    async fn user_update(&self, uid: Uid, update: UserUpdate) -> Result<(), StoreError>;

    async fn user_update_last_seen(
        &self,
        uid: Uid,
        user_agent: &str,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Look up a user by a confirmed credential such as `email:alice@example.com`.
    async fn user_get_by_cred(&self, method: &str, value: &str)
        -> Result<Option<Uid>, StoreError>;

    async fn topic_get(&self, name: &str) -> Result<Option<TopicRecord>, StoreError>;

    /// Create a topic together with its owner's subscription.
    async fn topic_create(
        &self,
        topic: TopicRecord,
        owner_sub: Subscription,
    ) -> Result<(), StoreError>;

    /// Create a two-party topic and both subscriptions. Existing subscriptions
    /// are replaced, which undeletes a previously left conversation.
    async fn topic_create_p2p(
        &self,
        initiator: Subscription,
        peer: Subscription,
    ) -> Result<(), StoreError>;

    async fn topic_update(&self, name: &str, update: TopicUpdate) -> Result<(), StoreError>;

    async fn topic_owner_change(&self, name: &str, new_owner: Uid) -> Result<(), StoreError>;

    /// Delete a topic with its subscriptions and messages.
    async fn topic_delete(&self, name: &str) -> Result<(), StoreError>;

    async fn subs_for_topic(
        &self,
        name: &str,
        keep_deleted: bool,
    ) -> Result<Vec<Subscription>, StoreError>;

    async fn subs_for_user(
        &self,
        uid: Uid,
        keep_deleted: bool,
    ) -> Result<Vec<Subscription>, StoreError>;

    async fn sub_create(&self, sub: Subscription) -> Result<(), StoreError>;

    async fn sub_update(&self, topic: &str, uid: Uid, update: SubUpdate)
        -> Result<(), StoreError>;

    /// Mark a subscription deleted.
    async fn sub_delete(&self, topic: &str, uid: Uid) -> Result<(), StoreError>;

    /// Users and group topics tagged with any of `tags`, as subscriptions of
    /// the searching user. Results the searcher is already subscribed to are
    /// included.
    async fn find_subs(&self, uid: Uid, tags: &[String]) -> Result<Vec<Subscription>, StoreError>;

    /// Append a message. Updates the topic's sequence id and touch time and
    /// advances the sender's read and received ids.
    async fn message_save(&self, msg: &Message) -> Result<(), StoreError>;

    /// Messages visible to `for_user`, newest first.
    async fn messages_get_all(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpt,
    ) -> Result<Vec<Message>, StoreError>;

    /// Delete messages in `ranges` under transaction `del_id`. `for_user: None`
    /// deletes for everyone, otherwise only hides them from that user.
    async fn messages_delete_list(
        &self,
        topic: &str,
        del_id: u64,
        for_user: Option<Uid>,
        ranges: &[DelRange],
    ) -> Result<(), StoreError>;

    /// Ranges deleted for everyone or for `for_user`, and the highest
    /// transaction id among them.
    async fn messages_get_deleted(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpt,
    ) -> Result<(Vec<DelRange>, u64), StoreError>;
}
