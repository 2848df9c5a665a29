//! # Forager: a plugin-hosting runtime for scraping agents
//!
//! Forager hosts automation/scraping plugins that talk to the world over
//! two asynchronous channels: a message broker (publish/subscribe between
//! plugin instances, possibly across processes) and outbound HTTP. Plugins
//! never block the runtime: they hand off sends and subscribe to inbound
//! channels, and the runtime guarantees ordered, bounded-concurrency,
//! backpressured delivery.
//!
//! ## Architecture
//!
//! Everything side-effecting funnels through a single-worker event loop:
//!
//! ```text
//! plugin ── http.send / send_out ──▶ Event ──▶ [event loop worker]
//!                                                   │
//!                      ┌────────────────────────────┼──────────────┐
//!                      ▼                            ▼              ▼
//!             DrainableHttpClient          AsyncMessageQueue    Registry
//!                      │                            │           dispatch
//!               HttpTransport                MessageClient
//!                 (reqwest)                  (MQTT broker)
//! ```
//!
//! - [`event`]: the [`event::EventLoop`] worker, the plugin-facing evented
//!   handles and the batching [`event::AsyncMessageQueue`].
//! - [`http`]: bounded, drainable HTTP client over an injected transport.
//! - [`mq`]: broker client contract, flow-control window, MQTT and mock
//!   implementations.
//! - [`codec`]: the colon-delimited wire framing for broker messages.
//! - [`registry`]: channel-keyed subscriber directory and plugin identity
//!   set.
//! - [`engine`]: wiring and lifecycle around all of the above.
//!
//! ## Guarantees
//!
//! Events are dispatched in strict submission order by one worker, so two
//! callbacks registered through the loop never race each other. At most
//! `concurrency` HTTP requests are in flight, with a bounded send backlog.
//! Inbound broker traffic is flow-controlled to a fixed in-flight window
//! that only reopens once a message is fully processed. Delivery is
//! at-most-once: nothing is persisted across restarts.

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod http;
pub mod message;
pub mod mq;
pub mod plugin;
pub mod registry;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use message::{Body, InternalMessage, Message, MessageContext};
pub use plugin::{Plugin, PluginContext};
