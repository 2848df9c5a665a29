use std::any::Any;

use thiserror::Error;

use crate::codec::CodecError;
use crate::engine::EngineError;
use crate::event::event_loop::EventLoopError;
use crate::event::message_queue::MessageQueueError;
use crate::http::client::HttpClientError;
use crate::mq::MqError;
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("http client error: {0}")]
    Http(#[from] HttpClientError),
    #[error("broker error: {0}")]
    Broker(#[from] MqError),
    #[error("message queue error: {0}")]
    Queue(#[from] MessageQueueError),
    #[error("event loop error: {0}")]
    EventLoop(#[from] EventLoopError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}

/// Renders a payload captured by `catch_unwind` for logging.
pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
