//! Runtime that runs the complete bot.
//!
//! The runtime owns:
//! - one bot adapter per enabled connection
//! - the shared command queue
//! - the dispatcher and its tick loop

use crate::adapter::{AdapterStatus, BotAdapter};
use crate::config::{BotConfig, ConfigurationProvider, DispatcherConfig};
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::error::Result;
use crate::plugin::PluginManifest;
use crate::queue::CommandQueue;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

/// Runtime that runs every configured connection.
pub struct Runtime {
    dispatcher_config: DispatcherConfig,
    queue: Arc<CommandQueue>,
    dispatcher: Arc<Dispatcher>,
    adapters: Vec<Arc<BotAdapter>>,
    handle: RwLock<Option<DispatcherHandle>>,
    running: Arc<RwLock<bool>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("dispatcher", &self.dispatcher_config)
            .field("adapters", &self.adapters.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Build adapters for every enabled connection and a dispatcher with
    /// the plugins in `manifest`.
    pub fn new(provider: &dyn ConfigurationProvider, manifest: PluginManifest) -> Result<Self> {
        let dispatcher_config = provider.dispatcher();
        let queue = Arc::new(CommandQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(
            dispatcher_config,
            Arc::clone(&queue),
            manifest.into_registry(),
        ));

        let mut adapters = Vec::new();
        for conn in provider.connections().iter().filter(|c| c.enabled) {
            conn.validate()?;
            let adapter = BotAdapter::from_config(conn.clone(), Arc::clone(&queue))?;
            info!(network = %conn.name, protocol = %conn.protocol, "adapter registered");
            adapters.push(adapter);
        }

        Ok(Self {
            dispatcher_config,
            queue,
            dispatcher,
            adapters,
            handle: RwLock::new(None),
            running: Arc::new(RwLock::new(false)),
        })
    }

    /// Shared command queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// The dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Registered adapters.
    #[must_use]
    pub fn adapters(&self) -> &[Arc<BotAdapter>] {
        &self.adapters
    }

    /// Start the dispatcher and every adapter.
    ///
    /// A connection that fails its first connect keeps retrying in the
    /// background and does not fail the start.
    pub async fn start(&self) {
        if std::mem::replace(&mut *self.running.write().await, true) {
            return;
        }
        info!(adapters = self.adapters.len(), "runtime starting");
        let handle = Arc::clone(&self.dispatcher).start();
        *self.handle.write().await = Some(handle);

        for adapter in &self.adapters {
            if let Err(e) = adapter.start().await {
                error!(network = %adapter.config().name, error = %e, "initial connect failed");
            }
        }
    }

    /// Quit every network and stop the dispatcher.
    pub async fn stop(&self) {
        if !std::mem::replace(&mut *self.running.write().await, false) {
            return;
        }
        info!("runtime stopping");
        for adapter in &self.adapters {
            if let Err(e) = adapter.stop().await {
                error!(network = %adapter.config().name, error = %e, "quit failed");
            }
        }
        if let Some(handle) = self.handle.write().await.take() {
            handle.stop().await;
        }
        info!("runtime stopped");
    }

    /// Run until Ctrl+C.
    pub async fn run(&self) -> Result<()> {
        self.start().await;
        info!("runtime started, press Ctrl+C to stop");
        let signal = tokio::signal::ctrl_c().await;
        self.stop().await;
        signal.map_err(Into::into)
    }

    /// Check if the runtime is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Aggregate status.
    pub async fn status(&self) -> RuntimeStatus {
        let mut adapters = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            adapters.push(adapter.status().await);
        }
        RuntimeStatus {
            running: *self.running.read().await,
            queued: self.queue.len(),
            adapters,
        }
    }
}

/// Runtime status information.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuntimeStatus {
    /// Whether the runtime is running.
    pub running: bool,
    /// Commands waiting for the next tick.
    pub queued: usize,
    /// Per-connection status.
    pub adapters: Vec<AdapterStatus>,
}

/// Builder for creating a [`Runtime`].
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config: BotConfig,
    manifest: PluginManifest,
}

impl RuntimeBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bot configuration.
    #[must_use]
    pub fn config(mut self, config: BotConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the plugin manifest.
    #[must_use]
    pub fn plugins(mut self, manifest: PluginManifest) -> Self {
        self.manifest = manifest;
        self
    }

    /// Validate the configuration and build the runtime.
    pub fn build(self) -> Result<Runtime> {
        self.config.validate()?;
        Runtime::new(&self.config, self.manifest)
    }
}
