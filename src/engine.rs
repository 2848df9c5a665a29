//! Engine wiring and lifecycle.
//!
//! The engine owns one registry, one drainable HTTP client and one event
//! loop per instance, installs plugins with their five handles, and drives
//! startup and shutdown. All configuration problems are fatal here, before
//! any traffic flows.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::event::{Dispatcher, EventLoop, EventLoopError, EventedHttpClient, EventedMessageQueue};
use crate::http::{DrainableHttpClient, HttpTransport, ReqwestTransport};
use crate::message::InternalMessage;
use crate::mq::{INPUT_QUEUE, MessageClientFactory, MqttMessageClient};
use crate::plugin::{Plugin, PluginContext};
use crate::registry::{self, Registry, RegistryError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine.start() should only be called once")]
    AlreadyStarted,
    #[error("engine has not been started")]
    NotStarted,
    #[error("failed to initialize http transport: {0}")]
    Transport(String),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("event loop error: {0}")]
    EventLoop(#[from] EventLoopError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EngineState {
    New,
    Started,
    Stopped,
}

pub struct Engine {
    registry: Arc<Registry>,
    http: Arc<DrainableHttpClient>,
    event_loop: Arc<EventLoop>,
    plugins: Vec<Arc<dyn Plugin>>,
    state: Mutex<EngineState>,
}

impl Engine {
    /// Builds an engine against the real transports described by `config`.
    pub fn new(config: EngineConfig, plugins: Vec<Arc<dyn Plugin>>) -> Result<Self, EngineError> {
        let transport = ReqwestTransport::new(&config.http.user_agent)
            .map_err(|err| EngineError::Transport(err.to_string()))?;
        let client_factory = MqttMessageClient::factory(&config.broker);
        Ok(Self::with_parts(
            config,
            plugins,
            Arc::new(transport),
            client_factory,
        ))
    }

    /// Builds an engine with injected transport and broker-client factory.
    /// This is the seam tests (and embedders with custom I/O) use.
    pub fn with_parts(
        config: EngineConfig,
        plugins: Vec<Arc<dyn Plugin>>,
        transport: Arc<dyn HttpTransport>,
        client_factory: MessageClientFactory,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let http = Arc::new(DrainableHttpClient::new(
            transport,
            config.http.concurrency,
        ));
        let dispatcher: Dispatcher = {
            let registry = Arc::clone(&registry);
            Arc::new(move |message: &InternalMessage| registry::dispatch(&registry, message))
        };
        let event_loop = EventLoop::new(
            INPUT_QUEUE,
            client_factory,
            Arc::clone(&http),
            dispatcher,
        );
        Self {
            registry,
            http,
            event_loop,
            plugins,
            state: Mutex::new(EngineState::New),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// HTTP handle routed through the event loop.
    pub fn http_client(&self) -> EventedHttpClient {
        self.event_loop.http_client()
    }

    /// Message-queue handle routed through the event loop.
    pub fn message_queue(&self) -> EventedMessageQueue {
        self.event_loop.message_queue()
    }

    /// Installs and enables every plugin, then starts the event loop.
    pub fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().expect("engine state poisoned");
            match *state {
                EngineState::Started => return Err(EngineError::AlreadyStarted),
                EngineState::Stopped => return Err(EngineError::AlreadyStarted),
                EngineState::New => *state = EngineState::Started,
            }
        }
        if self.plugins.is_empty() {
            warn!("no plugins installed");
        }
        info!("installing plugins");
        let mut installed = Vec::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            let id = generate_plugin_id(plugin.as_ref());
            self.registry.register(&id)?;
            let ctx = PluginContext::new(
                id.clone(),
                tracing::info_span!("plugin", id = %id),
                Arc::clone(&self.registry),
                self.event_loop.http_client(),
                self.event_loop.message_queue(),
            );
            installed.push((Arc::clone(plugin), ctx));
        }
        info!("enabling plugins");
        for (plugin, ctx) in installed {
            plugin.on_enable(ctx);
        }
        info!("starting event loop");
        self.event_loop.start()?;
        Ok(())
    }

    /// Stops the loop (which winds down the message queue), disables
    /// plugins and releases the transport. In-flight HTTP requests and
    /// unflushed batches are abandoned.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().expect("engine state poisoned");
            match *state {
                EngineState::New => return Err(EngineError::NotStarted),
                EngineState::Stopped => return Err(EngineError::NotStarted),
                EngineState::Started => *state = EngineState::Stopped,
            }
        }
        info!("shutting down");
        self.event_loop.stop()?;
        for plugin in &self.plugins {
            plugin.on_disable();
        }
        self.http.close();
        Ok(())
    }
}

/// 128-bit suffix so two instances of the same plugin stay distinct.
fn generate_plugin_id(plugin: &dyn Plugin) -> String {
    format!("{}_{}", plugin.name(), Uuid::new_v4().simple())
}
