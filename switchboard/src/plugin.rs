//! Plugin contract, registry and the facade plugins see of the dispatcher.
//!
//! Plugins are listed in a [`PluginManifest`] assembled by the host binary
//! and turned into a [`PluginRegistry`] at startup. There is no runtime
//! discovery.

use crate::command::Command;
use crate::error::{DispatchError, HandlerResult};
use crate::handler::{AliasTable, Named};
use crate::queue::CommandQueue;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// An externally supplied command.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Canonical command name.
    fn name(&self) -> &str;

    /// Additional names resolving to this plugin.
    fn aliases(&self) -> Vec<String> {
        Vec::new()
    }

    /// Minutes of the hour at which the plugin runs unprompted.
    fn schedule(&self) -> BTreeSet<u32> {
        BTreeSet::new()
    }

    /// Run the plugin and return the command with its response set.
    ///
    /// Timer-triggered commands arrive without an origin; a plugin that
    /// wants to speak on a schedule delivers through origins it kept from
    /// earlier user commands.
    async fn execute(&self, cmd: Command, facade: &DispatcherFacade) -> HandlerResult<Command>;
}

impl Named for dyn Plugin {
    fn canonical(&self) -> &str {
        self.name()
    }

    fn alternates(&self) -> Vec<String> {
        self.aliases()
    }
}

/// Loaded plugins keyed by canonical name.
pub type PluginRegistry = AliasTable<dyn Plugin>;

impl PluginRegistry {
    /// Plugins scheduled to run at `minute`.
    #[must_use]
    pub fn scheduled(&self, minute: u32) -> Vec<Arc<dyn Plugin>> {
        self.values()
            .filter(|p| p.schedule().contains(&minute))
            .cloned()
            .collect()
    }
}

/// Static list of plugins registered by the host binary.
#[derive(Default)]
pub struct PluginManifest {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl std::fmt::Debug for PluginManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

impl PluginManifest {
    /// Create an empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin.
    #[must_use]
    pub fn with(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Build the registry.
    #[must_use]
    pub fn into_registry(self) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        for plugin in self.plugins {
            let name = plugin.name().to_string();
            if registry.register(plugin) {
                info!(plugin = %name, "plugin registered");
            }
        }
        registry
    }
}

/// What handlers and plugins may ask of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherFacade {
    queue: Arc<CommandQueue>,
    names: Arc<Vec<String>>,
    started: Instant,
}

impl DispatcherFacade {
    /// Create a facade over `queue` listing `names`.
    #[must_use]
    pub fn new(queue: Arc<CommandQueue>, names: Vec<String>) -> Self {
        Self {
            queue,
            names: Arc::new(names),
            started: Instant::now(),
        }
    }

    /// Queue a follow-up command for the next tick.
    pub fn enqueue(&self, cmd: Command) -> Result<(), DispatchError> {
        self.queue.enqueue(cmd)
    }

    /// Every built-in and plugin command name, sorted.
    #[must_use]
    pub fn command_names(&self) -> &[String] {
        &self.names
    }

    /// Time since the dispatcher was built.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
