//! Actor model implementation for the topic service.
//!
//! ```text
//! HubActor (singleton per server)
//! ├── resolves topic names, starts topics on first join
//! └── supervises N TopicActors
//!     └── TopicActor (one per active topic)
//!         ├── owns subscribers, sequence ids and delete ids
//!         └── fans out data and presence to attached sessions
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per topic**: every mutation of a topic runs on its actor
//! - **Presence through `me`**: topics reach offline subscribers by routing a
//!   notice to each user's `me` topic via the hub
//! - **Non-blocking fan-out**: sessions that cannot keep up are detached
//! - **CancellationToken propagation**: the hub hands topics child tokens
//! - **Mailbox monitoring**: backlog limits per actor type (Hub: 800, Topic: 192)
//!
//! # Modules
//!
//! - [`hub`] - `HubActor` singleton that supervises topics
//! - [`topic`] - `TopicActor` per active topic
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox backlog and actor health counters

pub mod hub;
mod init;
mod meta;
pub mod messages;
pub mod metrics;
mod presence;
mod subscription;
pub mod topic;

// Re-export primary types
pub use hub::{HubActor, HubHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use topic::{TopicActor, TopicHandle};
