//! Plugin contract and the handles injected at install time.
//!
//! A plugin gets exactly five things from the engine: its identity, a
//! logging span, the registry (to subscribe), an HTTP client handle, and
//! the `in`/`out` senders. They arrive in a [`PluginContext`] passed to
//! `on_enable`; there is no hidden injection and nothing global.

use std::sync::Arc;

use crate::event::{EventedHttpClient, EventedMessageQueue};
use crate::message::{Body, InternalMessage, MessageContext};
use crate::registry::{Registry, SubscriberCallback};

pub trait Plugin: Send + Sync {
    /// Stable, human-readable name; the engine derives the unique plugin id
    /// from it.
    fn name(&self) -> &str;

    /// Called once at install time with the plugin's handles. Plugins that
    /// want to keep the context clone it out.
    fn on_enable(&self, _ctx: PluginContext) {}

    /// Called once at engine shutdown.
    fn on_disable(&self) {}
}

/// The five handles a plugin is given.
#[derive(Clone)]
pub struct PluginContext {
    id: String,
    span: tracing::Span,
    registry: Arc<Registry>,
    http: EventedHttpClient,
    outbox: EventedMessageQueue,
}

impl PluginContext {
    pub(crate) fn new(
        id: String,
        span: tracing::Span,
        registry: Arc<Registry>,
        http: EventedHttpClient,
        outbox: EventedMessageQueue,
    ) -> Self {
        Self {
            id,
            span,
            registry,
            http,
            outbox,
        }
    }

    /// The engine-assigned unique identity of this plugin instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Logging span scoped to this plugin; enter it around plugin work.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Subscribes a callback to a channel's inbound messages.
    pub fn subscribe(&self, channel: &str, on_message: SubscriberCallback) {
        self.registry.subscribe(channel, on_message);
    }

    /// Non-blocking HTTP client; responses come back on the event loop.
    pub fn http(&self) -> &EventedHttpClient {
        &self.http
    }

    /// Publishes a message to the inbound side of the runtime.
    pub fn send_in(&self, channel: &str, body: Body) {
        self.route(MessageContext::In, channel, body);
    }

    /// Publishes a message to the outbound side of the runtime.
    pub fn send_out(&self, channel: &str, body: Body) {
        self.route(MessageContext::Out, channel, body);
    }

    fn route(&self, context: MessageContext, channel: &str, body: Body) {
        let message = InternalMessage::outbound(context, channel, self.id.as_str(), Some(body));
        self.outbox.send(message);
    }
}
