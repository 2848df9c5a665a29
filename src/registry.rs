//! Channel-keyed publish/subscribe directory.
//!
//! One registry exists per engine instance. It maps channel names to the
//! ordered list of subscriber callbacks and tracks plugin identities so the
//! same plugin cannot be installed twice. Subscription lists are read as
//! snapshots, so dispatch is never affected by concurrent subscribes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tracing::{error, warn};

use crate::error::panic_message;
use crate::message::{InternalMessage, Message};

/// Callback invoked for every inbound message on a subscribed channel.
pub type SubscriberCallback = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plugin registered twice: {plugin_id}")]
    DuplicatePlugin { plugin_id: String },
}

#[derive(Default)]
pub struct Registry {
    plugins: DashSet<String>,
    subscriptions: DashMap<String, Vec<SubscriberCallback>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a plugin identity, rejecting duplicates.
    pub fn register(&self, plugin_id: &str) -> Result<(), RegistryError> {
        if !self.plugins.insert(plugin_id.to_string()) {
            return Err(RegistryError::DuplicatePlugin {
                plugin_id: plugin_id.to_string(),
            });
        }
        Ok(())
    }

    /// Appends a callback to the channel's subscriber list. Always succeeds;
    /// insertion order is dispatch order.
    pub fn subscribe(&self, channel: &str, on_message: SubscriberCallback) {
        self.subscriptions
            .entry(channel.to_string())
            .or_default()
            .push(on_message);
    }

    /// Returns a snapshot of the channel's subscribers, empty if unknown.
    pub fn subscribers_of(&self, channel: &str) -> Vec<SubscriberCallback> {
        self.subscriptions
            .get(channel)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

/// Fans an inbound decoded message out to the channel's subscribers.
///
/// A panicking subscriber is logged and skipped; it never halts delivery to
/// the remaining subscribers. A channel with no subscribers drops the
/// message silently.
pub fn dispatch(registry: &Registry, message: &InternalMessage) {
    let Some(message_id) = message.message_id() else {
        warn!(key = %message.key(), "cannot dispatch message without a message id");
        return;
    };
    let Some(body) = message.body() else {
        warn!(message_id, "cannot dispatch message without a body");
        return;
    };
    let delivered = Message::new(message_id, body.clone());
    for on_message in registry.subscribers_of(message.channel()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| on_message(&delivered))) {
            error!(
                channel = message.channel(),
                "subscriber failed for message {}: {}",
                message_id,
                panic_message(&panic)
            );
        }
    }
}
