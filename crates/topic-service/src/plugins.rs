//! Plugin hook contract.
//!
//! Plugins observe topic, message and subscription lifecycle events. Hooks are
//! best effort: a failing hook is logged and never changes topic state.

use async_trait::async_trait;
use common::Uid;
use thiserror::Error;
use tracing::warn;

/// Topic lifecycle action reported to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginAction {
    Created,
    Updated,
    Deleted,
}

impl PluginAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PluginAction::Created => "created",
            PluginAction::Updated => "updated",
            PluginAction::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Error)]
#[error("Plugin failed: {0}")]
pub struct PluginError(pub String);

/// Lifecycle observers.
#[async_trait]
pub trait PluginHooks: Send + Sync {
    async fn topic(&self, name: &str, action: PluginAction) -> Result<(), PluginError>;

    async fn message(&self, topic: &str, from: Uid, seq: u64) -> Result<(), PluginError>;

    async fn subscription(&self, topic: &str, user: Uid) -> Result<(), PluginError>;
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPlugins;

#[async_trait]
impl PluginHooks for NoopPlugins {
    async fn topic(&self, _name: &str, _action: PluginAction) -> Result<(), PluginError> {
        Ok(())
    }

    async fn message(&self, _topic: &str, _from: Uid, _seq: u64) -> Result<(), PluginError> {
        Ok(())
    }

    async fn subscription(&self, _topic: &str, _user: Uid) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Log a hook failure and carry on.
pub(crate) fn log_failure(hook: &'static str, topic: &str, result: Result<(), PluginError>) {
    if let Err(e) = result {
        warn!(
            target: "topic.plugins",
            hook,
            topic = %topic,
            error = %e,
            "Plugin hook failed"
        );
    }
}
