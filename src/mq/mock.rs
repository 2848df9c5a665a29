//! In-memory broker client for tests and local development.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{MessageClient, MessageClientFactory, MqError, ReceiveCallback, ReceiveWindow};
use crate::message::InternalMessage;

/// Broker stand-in backed by in-process queues.
///
/// `send` records outgoing payloads; `receive_blocking` feeds messages
/// scripted through [`add_receivable_message`](Self::add_receivable_message),
/// honoring the receive window exactly like a real client.
#[derive(Default)]
pub struct MockMessageClient {
    inbox: Mutex<VecDeque<InternalMessage>>,
    inbox_signal: Notify,
    sent: Mutex<Vec<(String, String)>>,
}

impl MockMessageClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message for the receive loop to deliver.
    pub fn add_receivable_message(&self, message: InternalMessage) {
        self.inbox
            .lock()
            .expect("mock inbox poisoned")
            .push_back(message);
        self.inbox_signal.notify_one();
    }

    /// Everything published through `send`, as `(queue, payload)` pairs.
    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("mock outbox poisoned").clone()
    }

    /// Factory handing every task role this same shared instance.
    pub fn factory(self: &Arc<Self>) -> MessageClientFactory {
        let client = Arc::clone(self);
        Arc::new(move || Arc::clone(&client) as Arc<dyn MessageClient>)
    }
}

#[async_trait]
impl MessageClient for MockMessageClient {
    async fn send(&self, queue_name: &str, message: &str) -> Result<(), MqError> {
        self.sent
            .lock()
            .expect("mock outbox poisoned")
            .push((queue_name.to_string(), message.to_string()));
        Ok(())
    }

    async fn receive_blocking(
        &self,
        _queue_name: &str,
        window: Arc<ReceiveWindow>,
        on_receive: ReceiveCallback,
    ) -> Result<(), MqError> {
        loop {
            window.ready().await;
            let message = loop {
                let next = self
                    .inbox
                    .lock()
                    .expect("mock inbox poisoned")
                    .pop_front();
                match next {
                    Some(message) => break message,
                    None => self.inbox_signal.notified().await,
                }
            };
            on_receive(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::message::MessageContext;

    #[tokio::test]
    async fn test_receive_delivers_scripted_messages_in_order() {
        let client = Arc::new(MockMessageClient::new());
        let window = Arc::new(ReceiveWindow::new(10));
        let received = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            client.add_receivable_message(InternalMessage::received(
                MessageContext::In,
                format!("channel-{i}"),
                "p",
                Some(format!("m-{i}")),
                None,
            ));
        }

        let sink = received.clone();
        let task = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let _ = client
                    .receive_blocking(
                        "forager.i",
                        window,
                        Arc::new(move |message| {
                            sink.lock().unwrap().push(message.channel().to_string());
                        }),
                    )
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();
        assert_eq!(
            *received.lock().unwrap(),
            vec!["channel-0", "channel-1", "channel-2"]
        );
    }

    #[tokio::test]
    async fn test_receive_respects_the_window() {
        let client = Arc::new(MockMessageClient::new());
        let window = Arc::new(ReceiveWindow::new(2));
        let delivered = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            client.add_receivable_message(InternalMessage::received(
                MessageContext::In,
                "items",
                "p",
                Some(format!("m-{i}")),
                None,
            ));
        }

        let counter = delivered.clone();
        let on_receive: ReceiveCallback = {
            let window = Arc::clone(&window);
            Arc::new(move |_message| {
                window.acquire();
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        let task = {
            let client = Arc::clone(&client);
            let window = Arc::clone(&window);
            tokio::spawn(async move {
                let _ = client
                    .receive_blocking("forager.i", window, on_receive)
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 2);

        window.release();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 3);

        task.abort();
    }
}
