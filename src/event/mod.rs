//! Events and the machinery that serializes them.
//!
//! Everything side-effecting in the runtime is expressed as an [`Event`]
//! and processed one at a time by the [`event_loop::EventLoop`] worker.

pub mod event_loop;
pub mod handles;
pub mod message_queue;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem::discriminant;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::http::{HttpRequest, HttpResponse, ResponseCallback};
use crate::message::InternalMessage;

pub use event_loop::{Dispatcher, EventLoop, EventLoopError};
pub use handles::{EventLoopHandle, EventedHttpClient, EventedMessageQueue};
pub use message_queue::AsyncMessageQueue;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(0);

/// Payload of an [`EventKind::HttpSend`] event.
#[derive(Clone)]
pub struct HttpSendData {
    pub request: HttpRequest,
    pub on_response: ResponseCallback,
}

/// Payload of an [`EventKind::HttpReceive`] event. `response` is `None`
/// when the transport failed or cancelled the request.
#[derive(Clone)]
pub struct HttpReceiveData {
    pub response: Option<HttpResponse>,
    pub on_response: ResponseCallback,
}

#[derive(Clone)]
pub enum EventKind {
    HttpSend(HttpSendData),
    HttpReceive(HttpReceiveData),
    MqSend(InternalMessage),
    MqReceive(InternalMessage),
    DrainHttp,
}

impl EventKind {
    /// Wraps the kind in a freshly numbered event, e.g.
    /// `EventKind::DrainHttp.wrap()`.
    pub fn wrap(self) -> Event {
        Event::new(self)
    }

    fn name(&self) -> &'static str {
        match self {
            EventKind::HttpSend(_) => "HttpSend",
            EventKind::HttpReceive(_) => "HttpReceive",
            EventKind::MqSend(_) => "MqSend",
            EventKind::MqReceive(_) => "MqReceive",
            EventKind::DrainHttp => "DrainHttp",
        }
    }
}

impl PartialEq for EventKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EventKind::HttpSend(a), EventKind::HttpSend(b)) => {
                a.request == b.request && Arc::ptr_eq(&a.on_response, &b.on_response)
            }
            (EventKind::HttpReceive(a), EventKind::HttpReceive(b)) => {
                a.response == b.response && Arc::ptr_eq(&a.on_response, &b.on_response)
            }
            (EventKind::MqSend(a), EventKind::MqSend(b)) => a == b,
            (EventKind::MqReceive(a), EventKind::MqReceive(b)) => a == b,
            (EventKind::DrainHttp, EventKind::DrainHttp) => true,
            _ => false,
        }
    }
}

impl Eq for EventKind {}

impl Hash for EventKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        discriminant(self).hash(state);
        match self {
            EventKind::HttpSend(data) => {
                data.request.url().hash(state);
                callback_addr(&data.on_response).hash(state);
            }
            EventKind::HttpReceive(data) => {
                callback_addr(&data.on_response).hash(state);
            }
            EventKind::MqSend(message) | EventKind::MqReceive(message) => {
                message.key().hash(state);
            }
            EventKind::DrainHttp => {}
        }
    }
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::HttpSend(data) => write!(f, "HttpSend({})", data.request),
            EventKind::HttpReceive(data) => match &data.response {
                Some(response) => write!(f, "HttpReceive({response})"),
                None => write!(f, "HttpReceive(no response)"),
            },
            EventKind::MqSend(message) => write!(f, "MqSend({message})"),
            EventKind::MqReceive(message) => write!(f, "MqReceive({message})"),
            EventKind::DrainHttp => write!(f, "DrainHttp"),
        }
    }
}

fn callback_addr(callback: &ResponseCallback) -> usize {
    Arc::as_ptr(callback) as *const u8 as usize
}

/// A unit of work queued for the event loop.
///
/// `id` is a process-unique sequence number for diagnostics only; equality
/// and hashing depend solely on the kind and its payload. An event with no
/// kind is representable but invalid: the loop discards it with a warning.
pub struct Event {
    id: u64,
    kind: Option<EventKind>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed) + 1,
            kind: Some(kind),
        }
    }

    /// The representable-but-invalid event with no kind.
    pub fn malformed() -> Self {
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed) + 1,
            kind: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> Option<&EventKind> {
        self.kind.as_ref()
    }

    pub(crate) fn take_kind(self) -> Option<EventKind> {
        self.kind
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        // id is diagnostic only
        self.kind == other.kind
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::message::MessageContext;

    fn noop_callback() -> ResponseCallback {
        Arc::new(|_response| {})
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = EventKind::DrainHttp.wrap();
        let b = EventKind::DrainHttp.wrap();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_equality_ignores_the_id() {
        let a = EventKind::DrainHttp.wrap();
        let b = EventKind::DrainHttp.wrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_equality_tracks_kind_and_payload() {
        let message = InternalMessage::outbound(MessageContext::Out, "items", "p", None);
        let send_a = EventKind::MqSend(message.clone()).wrap();
        let send_b = EventKind::MqSend(message.clone()).wrap();
        let receive = EventKind::MqReceive(message.clone()).wrap();
        assert_eq!(send_a, send_b);
        assert_ne!(send_a, receive);

        let other = InternalMessage::outbound(MessageContext::Out, "items", "p", None);
        assert_ne!(send_a, EventKind::MqSend(other).wrap());
    }

    #[test]
    fn test_http_events_compare_callbacks_by_identity() {
        let callback = noop_callback();
        let request = HttpRequest::get("https://example.com/");
        let a = EventKind::HttpSend(HttpSendData {
            request: request.clone(),
            on_response: callback.clone(),
        })
        .wrap();
        let b = EventKind::HttpSend(HttpSendData {
            request: request.clone(),
            on_response: callback.clone(),
        })
        .wrap();
        assert_eq!(a, b);

        let c = EventKind::HttpSend(HttpSendData {
            request,
            on_response: noop_callback(),
        })
        .wrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_malformed_events_have_no_kind() {
        let event = Event::malformed();
        assert!(event.kind().is_none());
        assert_eq!(event, Event::malformed());
    }
}
