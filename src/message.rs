//! Runtime-internal message representation.
//!
//! An [`InternalMessage`] is the envelope the runtime moves between the
//! event loop, the async message queue and the wire codec. Subscribers
//! never see it directly; dispatch hands them a [`Message`] view instead.

use std::fmt;

use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Message bodies are ordered string-keyed JSON maps.
pub type Body = serde_json::Map<String, Value>;

/// Which side of the runtime a message belongs to.
///
/// The context decides the broker queue an outbound message is published
/// to. It is carried on the wire as `"in"` / `"out"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum MessageContext {
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "out")]
    Out,
}

/// Envelope for a message travelling through the runtime.
///
/// `key` is a process-local identity assigned when the message is built or
/// decoded; it is never derived from wire content. `message_id` is only
/// present for messages that originated from the broker and is required
/// for acknowledgment bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalMessage {
    key: Uuid,
    context: MessageContext,
    channel: String,
    plugin_id: String,
    message_id: Option<String>,
    body: Option<Body>,
}

impl InternalMessage {
    /// Builds a locally-originated message, as produced by a plugin's
    /// `in`/`out` call. No broker message id yet.
    pub fn outbound(
        context: MessageContext,
        channel: impl Into<String>,
        plugin_id: impl Into<String>,
        body: Option<Body>,
    ) -> Self {
        Self {
            key: Uuid::new_v4(),
            context,
            channel: channel.into(),
            plugin_id: plugin_id.into(),
            message_id: None,
            body,
        }
    }

    /// Builds a broker-originated message with a fresh internal key.
    pub fn received(
        context: MessageContext,
        channel: impl Into<String>,
        plugin_id: impl Into<String>,
        message_id: Option<String>,
        body: Option<Body>,
    ) -> Self {
        Self {
            key: Uuid::new_v4(),
            context,
            channel: channel.into(),
            plugin_id: plugin_id.into(),
            message_id,
            body,
        }
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn context(&self) -> MessageContext {
        self.context
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Backfills the broker message id when the broker did not supply one.
    pub fn assign_message_id(&mut self, message_id: impl Into<String>) {
        self.message_id = Some(message_id.into());
    }
}

impl fmt::Display for InternalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InternalMessage{{key={}, context={}, channel={}, plugin_id={}, message_id={}, has_body={}}}",
            self.key,
            self.context,
            self.channel,
            self.plugin_id,
            self.message_id.as_deref().unwrap_or("none"),
            self.body.is_some(),
        )
    }
}

/// The read-only view of an inbound message handed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: String,
    body: Body,
}

impl Message {
    pub fn new(id: impl Into<String>, body: Body) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// The broker-assigned (or runtime-assigned) message id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}
