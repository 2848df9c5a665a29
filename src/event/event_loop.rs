//! Single-worker event loop.
//!
//! All HTTP and message-queue activity is serialized through one worker
//! task: producers on other tasks (or threads) only ever `submit` events,
//! and the worker dispatches them strictly in submission order. No two
//! events are ever processed concurrently, which is what lets plugin
//! callbacks share state without locks.
//!
//! HTTP draining is a loop-internal step rather than a self-perpetuating
//! queued event: a step runs right after each `HttpSend` and whenever the
//! transport signals a completion, so only one drain step can ever run at
//! a time.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::handles::{EventLoopHandle, EventedHttpClient, EventedMessageQueue};
use super::message_queue::{AsyncMessageQueue, MessageQueueError};
use super::{Event, EventKind, HttpReceiveData, HttpSendData};
use crate::error::panic_message;
use crate::http::{DrainableHttpClient, ResponseCallback};
use crate::message::InternalMessage;
use crate::mq::MessageClientFactory;

/// Fans a fully-received inbound message out to its subscribers.
pub type Dispatcher = Arc<dyn Fn(&InternalMessage) + Send + Sync>;

#[derive(Debug, Error)]
pub enum EventLoopError {
    #[error("event loop was already started")]
    AlreadyStarted,
    #[error("event loop has not been started")]
    NotStarted,
    #[error("event loop has stopped")]
    Stopped,
    #[error("message queue error: {0}")]
    Queue(#[from] MessageQueueError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LoopState {
    New,
    Running,
    Stopped,
}

pub struct EventLoop {
    handle: EventLoopHandle,
    /// Taken by the worker at start.
    events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    http: Arc<DrainableHttpClient>,
    queue: Arc<AsyncMessageQueue>,
    dispatcher: Dispatcher,
    shutdown: broadcast::Sender<()>,
    state: Mutex<LoopState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn new(
        receive_queue: impl Into<String>,
        client_factory: MessageClientFactory,
        http: Arc<DrainableHttpClient>,
        dispatcher: Dispatcher,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = EventLoopHandle::new(events_tx);
        let queue = Arc::new(AsyncMessageQueue::new(
            EventedMessageQueue::new(handle.clone()),
            receive_queue,
            client_factory,
        ));
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            handle,
            events: Mutex::new(Some(events_rx)),
            http,
            queue,
            dispatcher,
            shutdown,
            state: Mutex::new(LoopState::New),
            worker: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    /// The HTTP client handle plugins are given.
    pub fn http_client(&self) -> EventedHttpClient {
        EventedHttpClient::new(self.handle.clone())
    }

    /// The message-queue handle plugins are given.
    pub fn message_queue(&self) -> EventedMessageQueue {
        EventedMessageQueue::new(self.handle.clone())
    }

    pub fn async_message_queue(&self) -> &Arc<AsyncMessageQueue> {
        &self.queue
    }

    /// Submits an event for processing. Thread-safe; events are dispatched
    /// in submission order.
    pub fn submit(&self, event: Event) -> Result<(), EventLoopError> {
        self.handle.submit(event)
    }

    /// Starts the message queue and the worker task.
    pub fn start(self: &Arc<Self>) -> Result<(), EventLoopError> {
        {
            let mut state = self.state.lock().expect("event loop state poisoned");
            match *state {
                LoopState::Running => return Err(EventLoopError::AlreadyStarted),
                LoopState::Stopped => return Err(EventLoopError::Stopped),
                LoopState::New => *state = LoopState::Running,
            }
        }
        let mut events = self
            .events
            .lock()
            .expect("event loop receiver poisoned")
            .take()
            .ok_or(EventLoopError::AlreadyStarted)?;
        self.queue.start()?;
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    maybe_event = events.recv() => match maybe_event {
                        Some(event) => this.dispatch(event),
                        None => break,
                    },
                    _ = this.http.completions().notified() => this.step_http_drain(),
                }
            }
            if let Err(err) = this.queue.stop() {
                warn!("failed to stop message queue: {err}");
            }
            debug!("event loop worker exited");
        });
        *self.worker.lock().expect("event loop worker poisoned") = Some(worker);
        Ok(())
    }

    /// Flags the loop to exit after the event it is currently processing
    /// and wakes the worker even if the queue is empty.
    pub fn stop(&self) -> Result<(), EventLoopError> {
        {
            let mut state = self.state.lock().expect("event loop state poisoned");
            match *state {
                LoopState::New => return Err(EventLoopError::NotStarted),
                LoopState::Stopped => return Err(EventLoopError::Stopped),
                LoopState::Running => *state = LoopState::Stopped,
            }
        }
        let _ = self.shutdown.send(());
        Ok(())
    }

    /// Waits for the worker task to finish. Only meaningful after `stop`.
    pub async fn join(&self) {
        let worker = self.worker.lock().expect("event loop worker poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    fn dispatch(&self, event: Event) {
        let id = event.id();
        let Some(kind) = event.take_kind() else {
            warn!("discarding event {id} with invalid kind");
            return;
        };
        debug!("dispatching event {id} ({})", kind.name());
        match kind {
            EventKind::HttpSend(data) => self.handle_http_send(data),
            EventKind::HttpReceive(data) => self.handle_http_receive(data),
            EventKind::MqSend(message) => self.queue.send_async(&message),
            EventKind::MqReceive(message) => self.handle_mq_receive(message),
            EventKind::DrainHttp => self.step_http_drain(),
        }
    }

    fn handle_http_send(&self, data: HttpSendData) {
        let HttpSendData {
            request,
            on_response,
        } = data;
        let handle = self.handle.clone();
        let resubmit: ResponseCallback = Arc::new(move |response| {
            let event = EventKind::HttpReceive(HttpReceiveData {
                response,
                on_response: on_response.clone(),
            })
            .wrap();
            if let Err(err) = handle.submit(event) {
                warn!("dropping http response: {err}");
            }
        });
        if let Err(err) = self.http.send(request, resubmit) {
            error!("http send rejected: {err}");
        }
        self.step_http_drain();
    }

    fn handle_http_receive(&self, data: HttpReceiveData) {
        let HttpReceiveData {
            response,
            on_response,
        } = data;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| on_response(response))) {
            error!("http callback failed: {}", panic_message(&panic));
        }
    }

    fn handle_mq_receive(&self, message: InternalMessage) {
        let Some(message_id) = message.message_id() else {
            warn!(key = %message.key(), "discarding inbound message without an id");
            return;
        };
        self.queue.mark_received(message_id);
        (self.dispatcher)(&message);
    }

    /// One non-blocking drain step. Remaining work is picked up by the next
    /// transport completion signal, so the step never re-enqueues itself.
    fn step_http_drain(&self) {
        let _ = self.http.drain();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::http::client::RequestTicket;
    use crate::http::transport::CompletionFn;
    use crate::http::{HttpRequest, HttpResponse, HttpTransport};
    use crate::message::MessageContext;
    use crate::mq::{INPUT_QUEUE, MockMessageClient};

    const MOCK_ID_HEADER: &str = "mock-id";

    struct EchoTransport;

    impl HttpTransport for EchoTransport {
        fn send(&self, ticket: Arc<RequestTicket>, on_done: CompletionFn) {
            let id = ticket
                .request()
                .header_value(MOCK_ID_HEADER)
                .unwrap_or_default()
                .to_string();
            ticket.set_response(HttpResponse::new(200).with_header(MOCK_ID_HEADER, id));
            on_done(ticket);
        }
    }

    struct TestRig {
        event_loop: Arc<EventLoop>,
        client: Arc<MockMessageClient>,
        dispatched: Arc<Mutex<Vec<InternalMessage>>>,
    }

    fn rig() -> TestRig {
        let client = Arc::new(MockMessageClient::new());
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let sink = dispatched.clone();
        let dispatcher: Dispatcher = Arc::new(move |message: &InternalMessage| {
            sink.lock().unwrap().push(message.clone());
        });
        let event_loop = EventLoop::new(
            INPUT_QUEUE,
            client.factory(),
            Arc::new(DrainableHttpClient::new(Arc::new(EchoTransport), 4)),
            dispatcher,
        );
        TestRig {
            event_loop,
            client,
            dispatched,
        }
    }

    #[tokio::test]
    async fn test_stop_before_start_is_rejected() {
        let rig = rig();
        assert!(matches!(
            rig.event_loop.stop(),
            Err(EventLoopError::NotStarted)
        ));
        // the guard must not corrupt state: a normal start still works
        rig.event_loop.start().unwrap();
        rig.event_loop.stop().unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let rig = rig();
        rig.event_loop.start().unwrap();
        assert!(matches!(
            rig.event_loop.start(),
            Err(EventLoopError::AlreadyStarted)
        ));
        rig.event_loop.stop().unwrap();
        assert!(matches!(
            rig.event_loop.start(),
            Err(EventLoopError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_http_send_resolves_through_the_loop() {
        let rig = rig();
        rig.event_loop.start().unwrap();

        let observed = Arc::new(Mutex::new(Vec::new()));
        let http = rig.event_loop.http_client();
        for i in 0..10 {
            let observed = observed.clone();
            http.send(
                HttpRequest::get("fake-url").header(MOCK_ID_HEADER, i.to_string()),
                Arc::new(move |response| {
                    let id = response
                        .expect("echo transport always responds")
                        .header_value(MOCK_ID_HEADER)
                        .expect("echoed id")
                        .to_string();
                    observed.lock().unwrap().push(id);
                }),
            );
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut seen = observed.lock().unwrap().clone();
        seen.sort_by_key(|id| id.parse::<usize>().unwrap());
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected);

        rig.event_loop.stop().unwrap();
        rig.event_loop.join().await;
    }

    #[tokio::test]
    async fn test_inbound_messages_are_dispatched_and_acknowledged() {
        let rig = rig();
        rig.event_loop.start().unwrap();

        let message = InternalMessage::received(
            MessageContext::In,
            "items",
            "scraper_1",
            Some("m-42".to_string()),
            None,
        );
        rig.client.add_receivable_message(message);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let dispatched = rig.dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].message_id(), Some("m-42"));
        drop(dispatched);
        // fully processed: the in-flight slot is free again
        assert_eq!(rig.event_loop.async_message_queue().in_flight(), 0);

        rig.event_loop.stop().unwrap();
    }

    #[tokio::test]
    async fn test_messages_without_broker_ids_get_one_assigned() {
        let rig = rig();
        rig.event_loop.start().unwrap();

        rig.client.add_receivable_message(InternalMessage::received(
            MessageContext::In,
            "items",
            "scraper_1",
            None,
            None,
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let dispatched = rig.dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 1);
        assert!(dispatched[0].message_id().is_some());

        rig.event_loop.stop().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_events_are_discarded_without_stopping_the_loop() {
        let rig = rig();
        rig.event_loop.start().unwrap();

        rig.event_loop.submit(Event::malformed()).unwrap();
        let probe = Arc::new(AtomicUsize::new(0));
        let counter = probe.clone();
        rig.event_loop.http_client().send(
            HttpRequest::get("fake-url").header(MOCK_ID_HEADER, "after"),
            Arc::new(move |_response| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.load(Ordering::SeqCst), 1);

        rig.event_loop.stop().unwrap();
    }

    #[tokio::test]
    async fn test_mq_send_events_reach_the_broker() {
        let rig = rig();
        rig.event_loop.start().unwrap();

        let message = InternalMessage::outbound(
            MessageContext::Out,
            "items",
            "scraper_1",
            Some(serde_json::Map::from_iter([(
                "k".to_string(),
                serde_json::Value::from("v"),
            )])),
        );
        rig.event_loop.message_queue().send(message);
        tokio::time::sleep(Duration::from_millis(100)).await;

        rig.event_loop.stop().unwrap();
        rig.event_loop.join().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent = rig.client.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, crate::mq::OUTPUT_QUEUE);
    }

    #[tokio::test]
    async fn test_submissions_before_start_are_processed_after_start() {
        let rig = rig();
        let probe = Arc::new(AtomicUsize::new(0));
        let counter = probe.clone();
        rig.event_loop.http_client().send(
            HttpRequest::get("fake-url").header(MOCK_ID_HEADER, "early"),
            Arc::new(move |_response| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(probe.load(Ordering::SeqCst), 0);

        rig.event_loop.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.load(Ordering::SeqCst), 1);
        rig.event_loop.stop().unwrap();
    }
}
