//! # Topic Test Utilities
//!
//! Shared test utilities for the topic service.
//!
//! ## Modules
//!
//! - `memory_store` - In-memory implementation of the storage contract
//! - `recording` - Push and plugin sinks that record every call
//! - `fixtures` - A running hub and authenticated test clients
//!
//! ## Usage
//!
//! ```rust,ignore
//! use topic_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let alice = Uid::new(1);
//!     let store = MemoryStore::new().with_user(User::new(alice));
//!     let server = TestServer::start(store).await;
//!
//!     let mut client = server.connect(alice);
//!     client.join("me", "1").await;
//!     assert_eq!(client.ctrl_for("1").await.code, 200);
//!
//!     server.stop().await;
//! }
//! ```

pub mod fixtures;
pub mod memory_store;
pub mod recording;

pub use fixtures::{test_config, test_config_with, TestClient, TestServer, RECV_TIMEOUT};
pub use memory_store::MemoryStore;
pub use recording::{PluginEvent, RecordingPlugins, RecordingPush};
