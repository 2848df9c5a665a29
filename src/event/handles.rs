//! Plugin-facing handles that submit work to an event loop.
//!
//! These are the only surfaces plugins touch: every call becomes a queued
//! event, so plugin code never blocks on I/O and never races the loop.

use tracing::warn;

use super::event_loop::EventLoopError;
use super::{Event, EventKind, HttpSendData};
use crate::http::{HttpRequest, ResponseCallback};
use crate::message::InternalMessage;

/// Thread-safe submission handle into an event loop.
#[derive(Clone)]
pub struct EventLoopHandle {
    events: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl EventLoopHandle {
    pub(crate) fn new(events: tokio::sync::mpsc::UnboundedSender<Event>) -> Self {
        Self { events }
    }

    /// Appends an event to the loop's queue and wakes the worker. Never
    /// blocks; fails only once the loop has stopped.
    pub fn submit(&self, event: Event) -> Result<(), EventLoopError> {
        self.events
            .send(event)
            .map_err(|_| EventLoopError::Stopped)
    }
}

/// HTTP client handle that routes all requests through the event loop.
#[derive(Clone)]
pub struct EventedHttpClient {
    event_loop: EventLoopHandle,
}

impl EventedHttpClient {
    pub(crate) fn new(event_loop: EventLoopHandle) -> Self {
        Self { event_loop }
    }

    /// Queues the request; `on_response` runs on the loop worker once the
    /// response (or failure) comes back.
    pub fn send(&self, request: HttpRequest, on_response: ResponseCallback) {
        let event = EventKind::HttpSend(HttpSendData {
            request,
            on_response,
        })
        .wrap();
        if let Err(err) = self.event_loop.submit(event) {
            warn!("dropping http request: {err}");
        }
    }
}

/// Message-queue handle that routes sends and receipts through the loop.
#[derive(Clone)]
pub struct EventedMessageQueue {
    event_loop: EventLoopHandle,
}

impl EventedMessageQueue {
    pub(crate) fn new(event_loop: EventLoopHandle) -> Self {
        Self { event_loop }
    }

    /// Queues an outbound message for the async message queue.
    pub fn send(&self, message: InternalMessage) {
        if let Err(err) = self.event_loop.submit(EventKind::MqSend(message).wrap()) {
            warn!("dropping outbound message: {err}");
        }
    }

    /// Hands an inbound broker message to the loop. Called by the receive
    /// task, from outside the loop.
    pub fn receive(&self, message: InternalMessage) {
        if let Err(err) = self.event_loop.submit(EventKind::MqReceive(message).wrap()) {
            warn!("dropping inbound message: {err}");
        }
    }
}
