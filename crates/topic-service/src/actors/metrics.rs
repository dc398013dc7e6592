//! Actor health counters and mailbox backlog tracking.
//!
//! Each actor samples its own mailbox length after every item. A backlog
//! above the actor type's limit is logged once when it starts and once when
//! it has drained to half the limit.

use crate::observability::metrics;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Hub backlog above which the hub is considered behind.
pub const HUB_BACKLOG_LIMIT: usize = 800;

/// Topic backlog above which a topic is considered behind.
pub const TOPIC_BACKLOG_LIMIT: usize = 192;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Hub,
    Topic,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Hub => "hub",
            ActorType::Topic => "topic",
        }
    }

    #[must_use]
    pub const fn backlog_limit(&self) -> usize {
        match self {
            ActorType::Hub => HUB_BACKLOG_LIMIT,
            ActorType::Topic => TOPIC_BACKLOG_LIMIT,
        }
    }
}

/// Per-actor mailbox bookkeeping, shared by the actor and its handles.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Topic name or server id.
    actor_id: String,
    processed: AtomicU64,
    refused: AtomicU64,
    backlogged: AtomicBool,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            processed: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            backlogged: AtomicBool::new(false),
        }
    }

    /// One item handled; `depth` is what is still queued.
    pub fn record_processed(&self, depth: usize) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(self.actor_type.as_str(), depth);

        let limit = self.actor_type.backlog_limit();
        if depth > limit {
            if !self.backlogged.swap(true, Ordering::Relaxed) {
                warn!(
                    target: "topic.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    limit,
                    "Mailbox backlog above limit"
                );
            }
        } else if depth <= limit / 2 && self.backlogged.swap(false, Ordering::Relaxed) {
            debug!(
                target: "topic.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox backlog cleared"
            );
        }
    }

    /// A sender found the mailbox full.
    pub fn record_refused(&self) {
        let refused = self.refused.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            target: "topic.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            refused,
            "Mailbox full, message refused"
        );
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_backlogged(&self) -> bool {
        self.backlogged.load(Ordering::Relaxed)
    }
}

/// Server-wide actor counters, reached through `ServerContext`.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    active_topics: AtomicUsize,
    panics: AtomicU64,
    messages_processed: AtomicU64,
    stuck_detaches: AtomicU64,
    suspensions: AtomicU64,
    resumptions: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn topic_started(&self) {
        let count = self.active_topics.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_topics_active(count as u64);
    }

    pub fn topic_stopped(&self) {
        let previous = self
            .active_topics
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(1))
            })
            .unwrap_or(0);
        metrics::set_topics_active(previous.saturating_sub(1) as u64);
    }

    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.panics.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_actor_panic(actor_type.as_str());
        error!(
            target: "topic.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected"
        );
    }

    pub fn record_message_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// A topic detached a session whose outbound queue was full.
    pub fn record_stuck_detach(&self, topic: &str) {
        self.stuck_detaches.fetch_add(1, Ordering::Relaxed);
        metrics::record_session_evicted("stuck");
        debug!(target: "topic.actor.topic", topic = %topic, "Stuck session detached");
    }

    /// A topic started tearing down and now answers `Locked`.
    pub fn record_suspended(&self, topic: &str) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
        debug!(target: "topic.actor.topic", topic = %topic, "Topic suspended");
    }

    /// A teardown was abandoned and the topic serves requests again.
    pub fn record_resumed(&self, topic: &str) {
        self.resumptions.fetch_add(1, Ordering::Relaxed);
        debug!(target: "topic.actor.topic", topic = %topic, "Topic resumed");
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.active_topics.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stuck_detaches(&self) -> u64 {
        self.stuck_detaches.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn suspensions(&self) -> u64 {
        self.suspensions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn resumptions(&self) -> u64 {
        self.resumptions.load(Ordering::Relaxed)
    }
}
