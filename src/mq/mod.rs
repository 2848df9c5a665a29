//! Broker client contract and implementations.
//!
//! The runtime never talks to the broker directly; it goes through
//! [`MessageClient`]. Each background task role (sender, receiver) obtains
//! its own client from a [`MessageClientFactory`], so a connection is owned
//! by exactly one task for its lifetime.

pub mod mock;
pub mod mqtt;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

use crate::message::InternalMessage;

pub use mock::MockMessageClient;
pub use mqtt::MqttMessageClient;

/// Default broker queue carrying plugin input traffic.
pub const INPUT_QUEUE: &str = "forager.i";
/// Default broker queue carrying plugin output traffic.
pub const OUTPUT_QUEUE: &str = "forager.o";

/// Invoked by a client for every decoded inbound message.
pub type ReceiveCallback = Arc<dyn Fn(InternalMessage) + Send + Sync>;

/// Produces one broker client per task role.
pub type MessageClientFactory = Arc<dyn Fn() -> Arc<dyn MessageClient> + Send + Sync>;

#[derive(Debug, Error)]
pub enum MqError {
    #[error("gave up connecting to the broker after {attempts} attempts")]
    ConnectExhausted { attempts: usize },
    #[error("broker publish failed: {0}")]
    Publish(String),
    #[error("broker receive failed: {0}")]
    Receive(String),
}

#[async_trait]
pub trait MessageClient: Send + Sync {
    /// Publishes an already-encoded message to the named queue.
    async fn send(&self, queue_name: &str, message: &str) -> Result<(), MqError>;

    /// Receives messages until cancelled, honoring the window before each
    /// fetch. Implementations must be cancel-safe: dropping the returned
    /// future is the supported way to stop receiving.
    async fn receive_blocking(
        &self,
        queue_name: &str,
        window: Arc<ReceiveWindow>,
        on_receive: ReceiveCallback,
    ) -> Result<(), MqError>;
}

/// Flow-control window over inbound messages.
///
/// `can_receive_more` is the predicate clients must consult before every
/// fetch; it is a view and never mutates the count. `ready` parks the
/// caller until the window reopens, so an idle receiver does not spin.
pub struct ReceiveWindow {
    limit: usize,
    in_flight: AtomicUsize,
    reopened: Notify,
}

impl ReceiveWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: AtomicUsize::new(0),
            reopened: Notify::new(),
        }
    }

    pub fn can_receive_more(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) < self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until `can_receive_more` holds.
    pub async fn ready(&self) {
        loop {
            if self.can_receive_more() {
                return;
            }
            let reopened = self.reopened.notified();
            if self.can_receive_more() {
                return;
            }
            reopened.await;
        }
    }

    /// Counts a message as in flight. Called on receipt, before the message
    /// enters the runtime.
    pub fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases one in-flight slot once a message is fully processed.
    pub fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.reopened.notify_one();
    }
}
