//! Bounded-concurrency, drainable HTTP client.
//!
//! `send` never blocks: requests are queued as tickets and only advanced to
//! the transport by an explicit drain step, so the owner decides when
//! response callbacks run and on which task. The transport completion
//! callback may fire on any thread; its only job is to land the ticket on
//! the response queue and signal the owner.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::error;

use super::transport::HttpTransport;
use super::{HttpRequest, HttpResponse};
use crate::error::panic_message;

/// Maximum pending requests not yet handed to the transport.
pub const SEND_QUEUE_BACKLOG: usize = 1 << 15;

static NEXT_TICKET_ID: AtomicU64 = AtomicU64::new(0);

/// Callback invoked with the response once the request resolves, or with
/// `None` when the transport failed or cancelled the request.
pub type ResponseCallback = Arc<dyn Fn(Option<HttpResponse>) + Send + Sync>;

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("send queue reached limit at {limit} pending http requests")]
    CapacityExceeded { limit: usize },
}

/// A queued request, owned by the client from enqueue until its callback
/// runs. The transport completion callback is the only cross-thread write
/// point, and it may only touch `response`.
pub struct RequestTicket {
    id: u64,
    request: HttpRequest,
    on_response: ResponseCallback,
    response: OnceLock<HttpResponse>,
}

impl RequestTicket {
    fn new(request: HttpRequest, on_response: ResponseCallback) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TICKET_ID.fetch_add(1, Ordering::Relaxed),
            request,
            on_response,
            response: OnceLock::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Records the response; later writes are ignored.
    pub fn set_response(&self, response: HttpResponse) {
        let _ = self.response.set(response);
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.get()
    }

    fn on_response(&self) -> &ResponseCallback {
        &self.on_response
    }
}

impl PartialEq for RequestTicket {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RequestTicket {}

impl std::hash::Hash for RequestTicket {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for RequestTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTicket")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("has_response", &self.response.get().is_some())
            .finish()
    }
}

pub struct DrainableHttpClient {
    transport: Arc<dyn HttpTransport>,
    /// Requests allowed in flight at once (transport plus response queue).
    concurrency: usize,
    send_queue: Mutex<VecDeque<Arc<RequestTicket>>>,
    response_queue: Arc<Mutex<VecDeque<Arc<RequestTicket>>>>,
    /// Pending requests not yet fully completed, across both queues and the
    /// transport.
    request_count: AtomicUsize,
    /// Tickets handed to the transport and not yet drained back out of the
    /// response queue. Never exceeds `concurrency`, which is what keeps the
    /// response queue within its bound.
    outstanding: AtomicUsize,
    completions: Arc<Notify>,
}

impl DrainableHttpClient {
    pub fn new(transport: Arc<dyn HttpTransport>, concurrency: usize) -> Self {
        Self {
            transport,
            concurrency,
            send_queue: Mutex::new(VecDeque::new()),
            response_queue: Arc::new(Mutex::new(VecDeque::new())),
            request_count: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            completions: Arc::new(Notify::new()),
        }
    }

    /// Number of requests accepted but not yet resolved through a callback.
    pub fn pending(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Enqueues a request without blocking.
    ///
    /// The callback runs later, during a drain step on the owner's task,
    /// never on the transport's own thread.
    pub fn send(
        &self,
        request: HttpRequest,
        on_response: ResponseCallback,
    ) -> Result<(), HttpClientError> {
        let mut queue = self.send_queue.lock().expect("http send queue poisoned");
        if queue.len() >= SEND_QUEUE_BACKLOG {
            return Err(HttpClientError::CapacityExceeded {
                limit: SEND_QUEUE_BACKLOG,
            });
        }
        queue.push_back(RequestTicket::new(request, on_response));
        drop(queue);
        self.request_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Performs one non-blocking drain step: advances queued requests to the
    /// transport within the concurrency window, then runs every callback
    /// whose response has landed. Returns whether pending work remains.
    pub fn drain(&self) -> bool {
        self.push_sends();
        self.run_ready_callbacks();
        self.request_count.load(Ordering::SeqCst) > 0
    }

    /// Drains until no request is pending. Blocks the calling task between
    /// steps, woken by transport completions. Must be driven from the same
    /// task that serializes `send` callbacks; never run it concurrently
    /// with an event loop that owns this client.
    pub async fn drain_fully(&self) {
        loop {
            let completed = self.completions.notified();
            if !self.drain() {
                break;
            }
            if self.has_ready_work() {
                continue;
            }
            completed.await;
        }
    }

    pub fn close(&self) {
        self.transport.close();
    }

    pub(crate) fn completions(&self) -> &Notify {
        &self.completions
    }

    fn push_sends(&self) {
        let batch: Vec<Arc<RequestTicket>> = {
            let mut queue = self.send_queue.lock().expect("http send queue poisoned");
            let available = self
                .concurrency
                .saturating_sub(self.outstanding.load(Ordering::SeqCst));
            let count = queue.len().min(available);
            queue.drain(..count).collect()
        };
        for ticket in batch {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            let responses = Arc::clone(&self.response_queue);
            let completions = Arc::clone(&self.completions);
            self.transport.send(
                ticket,
                Box::new(move |ticket| {
                    // Runs on an arbitrary thread: queue the ticket and
                    // signal, nothing else.
                    responses
                        .lock()
                        .expect("http response queue poisoned")
                        .push_back(ticket);
                    completions.notify_one();
                }),
            );
        }
    }

    fn run_ready_callbacks(&self) {
        let ready: Vec<Arc<RequestTicket>> = {
            let mut queue = self
                .response_queue
                .lock()
                .expect("http response queue poisoned");
            queue.drain(..).collect()
        };
        for ticket in ready {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            let response = ticket.response().cloned();
            let on_response = ticket.on_response().clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| on_response(response))) {
                error!(
                    ticket = ticket.id(),
                    "skipping: response callback failed for {}: {}",
                    ticket.request(),
                    panic_message(&panic)
                );
            }
            self.request_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn has_ready_work(&self) -> bool {
        let responses_waiting = !self
            .response_queue
            .lock()
            .expect("http response queue poisoned")
            .is_empty();
        if responses_waiting {
            return true;
        }
        let sends_waiting = !self
            .send_queue
            .lock()
            .expect("http send queue poisoned")
            .is_empty();
        sends_waiting && self.outstanding.load(Ordering::SeqCst) < self.concurrency
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::super::transport::CompletionFn;
    use super::*;

    const MOCK_ID_HEADER: &str = "mock-id";

    /// Echoes the request's id header back on the response, inline.
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

    /// Completes tickets without ever producing a response.
    struct FailingTransport;

    impl HttpTransport for FailingTransport {
        fn send(&self, ticket: Arc<RequestTicket>, on_done: CompletionFn) {
            on_done(ticket);
        }
    }

    fn echo_client(concurrency: usize) -> DrainableHttpClient {
        DrainableHttpClient::new(Arc::new(EchoTransport), concurrency)
    }

    #[tokio::test]
    async fn test_drain_fully_resolves_every_request_exactly_once() {
        let client = echo_client(1);
        let pending_ids = Arc::new(Mutex::new(HashSet::new()));
        let request_count = 512;
        for i in 0..request_count {
            let id = i.to_string();
            pending_ids.lock().unwrap().insert(id.clone());
            let seen = pending_ids.clone();
            let request = HttpRequest::get("fake-url").header(MOCK_ID_HEADER, id);
            client
                .send(
                    request,
                    Arc::new(move |response| {
                        let id = response
                            .expect("echo transport always responds")
                            .header_value(MOCK_ID_HEADER)
                            .expect("echoed id header")
                            .to_string();
                        assert!(seen.lock().unwrap().remove(&id), "duplicate callback: {id}");
                    }),
                )
                .unwrap();
        }
        assert_eq!(pending_ids.lock().unwrap().len(), request_count);
        assert_eq!(client.pending(), request_count);
        client.drain_fully().await;
        assert_eq!(client.pending(), 0);
        assert!(pending_ids.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_fails_when_the_backlog_is_full() {
        let client = echo_client(1);
        for _ in 0..SEND_QUEUE_BACKLOG {
            client
                .send(HttpRequest::get("fake-url"), Arc::new(|_response| {}))
                .unwrap();
        }
        let err = client
            .send(HttpRequest::get("fake-url"), Arc::new(|_response| {}))
            .unwrap_err();
        assert!(matches!(
            err,
            HttpClientError::CapacityExceeded {
                limit: SEND_QUEUE_BACKLOG
            }
        ));
        // the backlog drains back to zero and frees capacity again
        client.drain_fully().await;
        assert_eq!(client.pending(), 0);
        client
            .send(HttpRequest::get("fake-url"), Arc::new(|_response| {}))
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_requests_still_resolve_their_callbacks() {
        let client = DrainableHttpClient::new(Arc::new(FailingTransport), 4);
        let observed = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..8 {
            let observed = observed.clone();
            client
                .send(
                    HttpRequest::get("fake-url"),
                    Arc::new(move |response| observed.lock().unwrap().push(response.is_none())),
                )
                .unwrap();
        }
        client.drain_fully().await;
        assert_eq!(client.pending(), 0);
        assert_eq!(observed.lock().unwrap().len(), 8);
        assert!(observed.lock().unwrap().iter().all(|failed| *failed));
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_abort_the_batch() {
        let client = echo_client(8);
        let survived = Arc::new(Mutex::new(0));
        client
            .send(
                HttpRequest::get("fake-url"),
                Arc::new(|_response| panic!("callback bug")),
            )
            .unwrap();
        let counter = survived.clone();
        client
            .send(
                HttpRequest::get("fake-url"),
                Arc::new(move |_response| *counter.lock().unwrap() += 1),
            )
            .unwrap();
        client.drain_fully().await;
        assert_eq!(client.pending(), 0);
        assert_eq!(*survived.lock().unwrap(), 1);
    }

    #[test]
    fn test_drain_reports_remaining_work() {
        let client = echo_client(2);
        assert!(!client.drain());
        client
            .send(HttpRequest::get("fake-url"), Arc::new(|_response| {}))
            .unwrap();
        client
            .send(HttpRequest::get("fake-url"), Arc::new(|_response| {}))
            .unwrap();
        client
            .send(HttpRequest::get("fake-url"), Arc::new(|_response| {}))
            .unwrap();
        // one step moves and resolves at most `concurrency` requests
        assert!(client.drain());
        assert_eq!(client.pending(), 1);
        assert!(!client.drain());
        assert_eq!(client.pending(), 0);
    }
}
