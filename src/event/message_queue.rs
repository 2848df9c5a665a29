//! Asynchronous, batching bridge between the event loop and the broker.
//!
//! Outbound messages are encoded and batched in memory, then flushed by a
//! background task on a fixed interval (or immediately once the batch is
//! large enough). Inbound messages are pulled by a second task whose fetch
//! rate is flow-controlled by a [`ReceiveWindow`], so no more than
//! [`AsyncMessageQueue::RECEIVE_LIMIT`] messages are in flight at once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::handles::EventedMessageQueue;
use crate::codec;
use crate::message::{InternalMessage, MessageContext};
use crate::mq::{
    INPUT_QUEUE, MessageClient, MessageClientFactory, OUTPUT_QUEUE, ReceiveCallback, ReceiveWindow,
};

/// An encoded message waiting for the next flush.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub queue: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum MessageQueueError {
    #[error("message queue was already started")]
    AlreadyStarted,
    #[error("message queue has not been started")]
    NotStarted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum QueueState {
    New,
    Running,
    Stopped,
}

pub struct AsyncMessageQueue {
    /// Forwards received messages into the event loop.
    receiver: EventedMessageQueue,
    receive_queue: String,
    client_factory: MessageClientFactory,
    batch: Mutex<Vec<BatchEntry>>,
    flush_now: Notify,
    window: Arc<ReceiveWindow>,
    shutdown: broadcast::Sender<()>,
    state: Mutex<QueueState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncMessageQueue {
    /// In-flight inbound messages allowed before the receive window closes.
    /// This bounds the engine's concurrency.
    pub const RECEIVE_LIMIT: usize = 10;
    /// How long the sender task waits before flushing an unfinished batch.
    pub const FLUSH_INTERVAL: Duration = Duration::from_millis(1500);
    /// Batch size that triggers an immediate flush.
    pub const SEND_LIMIT: usize = 1000;
    /// Hard cap on queued outbound messages, to absorb traffic spikes.
    pub const SEND_CAPACITY: usize = Self::SEND_LIMIT * 4;

    pub fn new(
        receiver: EventedMessageQueue,
        receive_queue: impl Into<String>,
        client_factory: MessageClientFactory,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            receiver,
            receive_queue: receive_queue.into(),
            client_factory,
            batch: Mutex::new(Vec::new()),
            flush_now: Notify::new(),
            window: Arc::new(ReceiveWindow::new(Self::RECEIVE_LIMIT)),
            shutdown,
            state: Mutex::new(QueueState::New),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn window(&self) -> &Arc<ReceiveWindow> {
        &self.window
    }

    pub fn in_flight(&self) -> usize {
        self.window.in_flight()
    }

    /// Encodes and enqueues an outbound message for the next flush.
    ///
    /// An unencodable message or a full batch is logged and dropped rather
    /// than crashing the loop; plugins should never send unserializable
    /// bodies in the first place.
    pub fn send_async(&self, message: &InternalMessage) {
        let payload = match codec::encode(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key = %message.key(), "dropping unencodable message: {err}");
                return;
            }
        };
        let queue = match message.context() {
            MessageContext::In => INPUT_QUEUE,
            MessageContext::Out => OUTPUT_QUEUE,
        };
        let mut batch = self.batch.lock().expect("outbound batch poisoned");
        if batch.len() >= Self::SEND_CAPACITY {
            error!(
                key = %message.key(),
                "outbound batch is at capacity ({}), dropping message",
                Self::SEND_CAPACITY
            );
            return;
        }
        batch.push(BatchEntry {
            queue: queue.to_string(),
            payload,
        });
        let full = batch.len() >= Self::SEND_LIMIT;
        drop(batch);
        if full {
            self.flush_now.notify_one();
        }
    }

    /// Releases one in-flight slot. Called once the runtime has fully
    /// processed the message, not merely received it into the event queue;
    /// this is the feedback that reopens the receive window.
    pub fn mark_received(&self, _message_id: &str) {
        self.window.release();
    }

    /// Launches the sender and receiver tasks.
    pub fn start(self: &Arc<Self>) -> Result<(), MessageQueueError> {
        {
            let mut state = self.state.lock().expect("queue state poisoned");
            if *state != QueueState::New {
                return Err(MessageQueueError::AlreadyStarted);
            }
            *state = QueueState::Running;
        }
        let sender = self.spawn_sender_task();
        let receiver = self.spawn_receiver_task();
        self.workers
            .lock()
            .expect("queue workers poisoned")
            .extend([sender, receiver]);
        Ok(())
    }

    /// Signals both tasks to wind down: the receiver is cancelled, the
    /// sender flushes its current batch and exits.
    pub fn stop(&self) -> Result<(), MessageQueueError> {
        {
            let mut state = self.state.lock().expect("queue state poisoned");
            match *state {
                QueueState::New => return Err(MessageQueueError::NotStarted),
                QueueState::Stopped => return Err(MessageQueueError::NotStarted),
                QueueState::Running => *state = QueueState::Stopped,
            }
        }
        let _ = self.shutdown.send(());
        Ok(())
    }

    fn spawn_sender_task(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let client = (queue.client_factory)();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Self::FLUSH_INTERVAL) => {}
                    _ = queue.flush_now.notified() => {}
                    _ = shutdown.recv() => {
                        queue.flush_batch(client.as_ref()).await;
                        debug!("outbound sender task finished");
                        return;
                    }
                }
                queue.flush_batch(client.as_ref()).await;
            }
        })
    }

    fn spawn_receiver_task(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let client = (queue.client_factory)();
            let window = Arc::clone(&queue.window);
            let receiver = queue.receiver.clone();
            let on_receive: ReceiveCallback = Arc::new(move |mut message: InternalMessage| {
                if message.message_id().is_none() {
                    message.assign_message_id(Uuid::new_v4().to_string());
                }
                window.acquire();
                receiver.receive(message);
            });
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("inbound receive task cancelled");
                }
                result = client.receive_blocking(
                    &queue.receive_queue,
                    Arc::clone(&queue.window),
                    on_receive,
                ) => {
                    if let Err(err) = result {
                        error!("inbound receive task failed: {err}");
                    }
                }
            }
        })
    }

    async fn flush_batch(&self, client: &dyn MessageClient) {
        let batch = std::mem::take(&mut *self.batch.lock().expect("outbound batch poisoned"));
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        for entry in batch {
            if let Err(err) = client.send(&entry.queue, &entry.payload).await {
                warn!(queue = %entry.queue, "failed to publish batch entry: {err}");
            }
        }
        debug!(count, "message batch was sent to the broker");
    }
}
