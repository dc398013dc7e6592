//! Push notification dispatch contract.
//!
//! After a data message is accepted the topic builds a [`PushReceipt`] listing
//! every subscriber that should hear about it and hands it to the
//! [`PushDispatcher`]. Dispatch is fire-and-forget.

use common::Uid;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Delivery state of one recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushRecipient {
    /// Sessions that already received the message live.
    pub delivered: usize,
    /// Devices of those sessions. Push skips them.
    pub devices: Vec<String>,
}

/// Payload of a push notification.
#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub topic: String,
    pub from: Uid,
    pub seq: u64,
    pub content: Value,
}

/// Push receipt for one message.
#[derive(Debug, Clone, Serialize)]
pub struct PushReceipt {
    pub to: HashMap<Uid, PushRecipient>,
    pub payload: PushPayload,
}

impl PushReceipt {
    /// Record a live delivery to one of `uid`'s sessions.
    pub fn mark_delivered(&mut self, uid: Uid, device_id: &str) {
        if let Some(rcpt) = self.to.get_mut(&uid) {
            rcpt.delivered += 1;
            if !device_id.is_empty() {
                rcpt.devices.push(device_id.to_string());
            }
        }
    }
}

/// Push notification sink.
pub trait PushDispatcher: Send + Sync {
    fn push(&self, receipt: PushReceipt);
}

/// Dispatcher that discards every receipt.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPush;

impl PushDispatcher for NoopPush {
    fn push(&self, _receipt: PushReceipt) {}
}
