//! Topic Service Library
//!
//! The server core of a multi-user messaging system:
//!
//! - Per-topic actors that serialize subscription changes, message
//!   publication and deletion
//! - An 8-permission access model (see [`common::AccessMode`])
//! - Presence fan-out through each user's `me` topic
//! - A registry of live client sessions
//!
//! Storage, push delivery and plugin hooks are abstract; the transport layer
//! that reads client envelopes lives outside this crate and drives the
//! [`actors::HubHandle`].
//!
//! # Modules
//!
//! - [`actors`] - Hub and topic actors
//! - [`config`] - Service configuration from environment
//! - [`context`] - Shared dependencies handed to every actor
//! - [`delrange`] - Message deletion ranges
//! - [`errors`] - Error types with protocol response codes
//! - [`observability`] - Tracing and metrics
//! - [`protocol`] - Server envelopes and client request payloads
//! - [`session`] - Client sessions and their registry
//! - [`store`] - Storage adapter contract
//! - [`push`] / [`plugins`] - Outbound notification hooks

pub mod actors;
pub mod config;
pub mod context;
pub mod delrange;
pub mod errors;
pub mod observability;
pub mod plugins;
pub mod protocol;
pub mod push;
pub mod session;
pub mod store;
