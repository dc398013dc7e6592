//! Push and plugin sinks that record what they receive.

use async_trait::async_trait;
use common::Uid;
use std::sync::{Arc, Mutex};
use topic_service::plugins::{PluginAction, PluginError, PluginHooks};
use topic_service::push::{PushDispatcher, PushReceipt};

/// Push dispatcher that keeps every receipt.
#[derive(Debug, Clone, Default)]
pub struct RecordingPush {
    receipts: Arc<Mutex<Vec<PushReceipt>>>,
}

impl RecordingPush {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn receipts(&self) -> Vec<PushReceipt> {
        self.receipts.lock().unwrap().clone()
    }
}

impl PushDispatcher for RecordingPush {
    fn push(&self, receipt: PushReceipt) {
        self.receipts.lock().unwrap().push(receipt);
    }
}

/// Event seen by [`RecordingPlugins`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    Topic(String, PluginAction),
    Message(String, Uid, u64),
    Subscription(String, Uid),
}

/// Plugin hooks that record each call. Optionally fail every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingPlugins {
    events: Arc<Mutex<Vec<PluginEvent>>>,
    failing: bool,
}

impl RecordingPlugins {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks that record, then report failure.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<PluginEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: PluginEvent) -> Result<(), PluginError> {
        self.events.lock().unwrap().push(event);
        if self.failing {
            return Err(PluginError("recording plugin set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PluginHooks for RecordingPlugins {
    async fn topic(&self, name: &str, action: PluginAction) -> Result<(), PluginError> {
        self.record(PluginEvent::Topic(name.to_string(), action))
    }

    async fn message(&self, topic: &str, from: Uid, seq: u64) -> Result<(), PluginError> {
        self.record(PluginEvent::Message(topic.to_string(), from, seq))
    }

    async fn subscription(&self, topic: &str, user: Uid) -> Result<(), PluginError> {
        self.record(PluginEvent::Subscription(topic.to_string(), user))
    }
}
