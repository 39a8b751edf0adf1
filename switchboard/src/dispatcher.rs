//! Command dispatcher.
//!
//! A periodic tick drains the shared [`CommandQueue`], resolves each
//! command against the built-in table and then the plugin registry, runs
//! the handler with failures and panics turned into response text, and
//! hands the result back to the adapter that produced the command. The
//! same tick fires scheduled plugins when the wall-clock minute changes.

use crate::builtins::builtin_table;
use crate::command::Command;
use crate::config::DispatcherConfig;
use crate::error::HandlerError;
use crate::handler::HandlerTable;
use crate::plugin::{DispatcherFacade, PluginRegistry};
use crate::queue::CommandQueue;
use chrono::Timelike;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

// Handler panics are caught with `catch_unwind`, which needs unwinding.
#[cfg(panic = "abort")]
compile_error!("switchboard must be built with panic = \"unwind\"");

/// Response for a command nothing is registered under.
pub const INVALID_COMMAND: &str = "invalid command";

/// Handle for stopping a running dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl DispatcherHandle {
    /// Signal the dispatcher loop to stop.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Drains the command queue and runs handlers.
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: Arc<CommandQueue>,
    builtins: HandlerTable,
    plugins: PluginRegistry,
    facade: DispatcherFacade,
    last_minute: Mutex<u32>,
    running: Arc<RwLock<bool>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("builtins", &self.builtins)
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher with the built-in commands and `plugins`.
    #[must_use]
    pub fn new(config: DispatcherConfig, queue: Arc<CommandQueue>, plugins: PluginRegistry) -> Self {
        let builtins = builtin_table();
        let mut names = builtins.names();
        names.extend(plugins.names());
        names.sort();
        names.dedup();
        let facade = DispatcherFacade::new(Arc::clone(&queue), names);

        Self {
            config,
            queue,
            builtins,
            plugins,
            facade,
            last_minute: Mutex::new(chrono::Local::now().minute()),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// The queue adapters feed.
    #[must_use]
    pub const fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Facade handed to handlers.
    #[must_use]
    pub const fn facade(&self) -> &DispatcherFacade {
        &self.facade
    }

    /// Resolve and run one command, returning it with the response set.
    pub async fn process(&self, cmd: Command) -> Command {
        let name = cmd.name();

        if let Some(handler) = self.builtins.get(&name) {
            let outcome = AssertUnwindSafe(handler.handle(&cmd, &self.facade))
                .catch_unwind()
                .await
                .map_err(panic_error)
                .and_then(|r| r);
            return match outcome {
                Ok(text) => cmd.with_response(text),
                Err(e) => failure(cmd, &name, &e),
            };
        }

        if let Some(plugin) = self.plugins.get(&name) {
            let outcome = AssertUnwindSafe(plugin.execute(cmd.clone(), &self.facade))
                .catch_unwind()
                .await
                .map_err(panic_error)
                .and_then(|r| r);
            return match outcome {
                // Delivery always goes through the original origin.
                Ok(done) => match done.response {
                    Some(text) => cmd.with_response(text),
                    None => cmd,
                },
                Err(e) => failure(cmd, &name, &e),
            };
        }

        debug!(id = %cmd.id, %name, "no handler");
        cmd.with_response(INVALID_COMMAND)
    }

    /// Run every queued command and deliver its response. Returns how many
    /// commands were processed.
    pub async fn drain(&self) -> usize {
        let batch = self.queue.drain();
        let count = batch.len();
        for cmd in batch {
            let cmd = self.process(cmd).await;
            match cmd.origin() {
                Some(origin) => origin.queue_response(cmd).await,
                None => debug!(id = %cmd.id, "origin gone, response dropped"),
            }
        }
        count
    }

    /// Record `minute`. Returns whether it differs from the last one seen.
    pub fn observe_minute(&self, minute: u32) -> bool {
        let mut last = self
            .last_minute
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *last == minute {
            return false;
        }
        *last = minute;
        true
    }

    /// Fire every plugin scheduled at `minute`.
    pub async fn run_scheduled(&self, minute: u32) -> usize {
        let due = self.plugins.scheduled(minute);
        for plugin in &due {
            debug!(plugin = plugin.name(), minute, "scheduled run");
            let cmd = Command::timer(plugin.name());
            let result = AssertUnwindSafe(plugin.execute(cmd, &self.facade))
                .catch_unwind()
                .await
                .map_err(panic_error)
                .and_then(|r| r);
            match result {
                Ok(done) if done.has_response() => match done.origin() {
                    Some(origin) => origin.queue_response(done).await,
                    None => debug!(plugin = plugin.name(), "timer response has no target"),
                },
                Ok(_) => {}
                Err(e) => warn!(plugin = plugin.name(), error = %e, "scheduled run failed"),
            }
        }
        due.len()
    }

    /// One dispatcher tick.
    pub async fn tick(&self) {
        self.drain().await;
        let minute = chrono::Local::now().minute();
        if self.observe_minute(minute) {
            self.run_scheduled(minute).await;
        }
    }

    /// Whether the loop is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Spawn the tick loop.
    pub fn start(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let interval = self.config.tick_interval();

        tokio::spawn(async move {
            *self.running.write().await = true;
            info!(?interval, "dispatcher started");
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => self.tick().await,
                    _ = shutdown_rx.recv() => {
                        info!("dispatcher shutting down");
                        break;
                    }
                }
            }
            // Flush whatever arrived before shutdown.
            self.drain().await;
            *self.running.write().await = false;
        });

        DispatcherHandle { shutdown_tx }
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> HandlerError {
    let msg = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    HandlerError::Panicked(msg)
}

fn failure(cmd: Command, name: &str, err: &HandlerError) -> Command {
    error!(id = %cmd.id, %name, error = %err, "handler failed");
    cmd.with_response(format!("{name}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ResponseSink, Source};
    use crate::error::HandlerResult;
    use crate::events::{SourceType, UserIdentity};
    use crate::plugin::{Plugin, PluginManifest};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct Collect {
        got: Mutex<Vec<Command>>,
    }

    #[async_trait]
    impl ResponseSink for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn queue_response(&self, cmd: Command) {
            self.got.lock().unwrap().push(cmd);
        }
    }

    struct Boom;

    #[async_trait]
    impl Plugin for Boom {
        fn name(&self) -> &str {
            "boom"
        }

        fn schedule(&self) -> BTreeSet<u32> {
            BTreeSet::from([7])
        }

        async fn execute(&self, cmd: Command, _facade: &DispatcherFacade) -> HandlerResult<Command> {
            if cmd.args() == "panic" {
                panic!("kaboom");
            }
            Err(HandlerError::failed("nope"))
        }
    }

    fn dispatcher() -> Dispatcher {
        let plugins = PluginManifest::new().with(Boom).into_registry();
        Dispatcher::new(DispatcherConfig::default(), Arc::new(CommandQueue::new()), plugins)
    }

    fn user_cmd(request: &str, sink: &Arc<dyn ResponseSink>) -> Command {
        Command::from_user(
            request,
            Source::new("#c", SourceType::ChannelOrGroup),
            UserIdentity::nick("alice"),
            sink,
        )
    }

    #[tokio::test]
    async fn test_echo_and_invalid() {
        let dispatcher = dispatcher();
        let sink = Arc::new(Collect::default());
        let origin: Arc<dyn ResponseSink> = sink.clone();

        dispatcher.queue().enqueue(user_cmd("ECHO hi there", &origin)).unwrap();
        dispatcher.queue().enqueue(user_cmd("frobnicate", &origin)).unwrap();
        assert_eq!(dispatcher.drain().await, 2);

        let got = sink.got.lock().unwrap();
        assert_eq!(got[0].response.as_deref(), Some("hi there"));
        assert_eq!(got[1].response.as_deref(), Some(INVALID_COMMAND));
        assert!(dispatcher.queue().is_empty());
    }

    #[tokio::test]
    async fn test_failures_become_responses() {
        let dispatcher = dispatcher();
        let sink = Arc::new(Collect::default());
        let origin: Arc<dyn ResponseSink> = sink.clone();

        dispatcher.queue().enqueue(user_cmd("boom", &origin)).unwrap();
        dispatcher.queue().enqueue(user_cmd("boom panic", &origin)).unwrap();
        dispatcher.queue().enqueue(user_cmd("ping", &origin)).unwrap();
        dispatcher.drain().await;

        let got = sink.got.lock().unwrap();
        assert_eq!(got[0].response.as_deref(), Some("boom: nope"));
        assert_eq!(got[1].response.as_deref(), Some("boom: handler panicked: kaboom"));
        assert_eq!(got[2].response.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_dropped_origin_is_skipped() {
        let dispatcher = dispatcher();
        let origin: Arc<dyn ResponseSink> = Arc::new(Collect::default());
        dispatcher.queue().enqueue(user_cmd("ping", &origin)).unwrap();
        drop(origin);
        assert_eq!(dispatcher.drain().await, 1);
    }

    #[tokio::test]
    async fn test_minute_boundary() {
        let dispatcher = dispatcher();
        let now = *dispatcher.last_minute.lock().unwrap();
        assert!(!dispatcher.observe_minute(now));
        assert!(dispatcher.observe_minute((now + 1) % 60));
        assert!(!dispatcher.observe_minute((now + 1) % 60));
        assert_eq!(dispatcher.run_scheduled(7).await, 1);
        assert_eq!(dispatcher.run_scheduled(8).await, 0);
    }

    #[tokio::test]
    async fn test_help_lists_plugins() {
        let dispatcher = dispatcher();
        let out = dispatcher.process(Command::timer("help")).await;
        assert_eq!(
            out.response.as_deref(),
            Some("commands: boom, echo, help, ping, uptime, version")
        );
    }

    #[test]
    fn test_release_profile_unwinds() {
        let manifest = include_str!("../../Cargo.toml");
        let release = manifest
            .split("[profile.release]")
            .nth(1)
            .and_then(|rest| rest.split("\n[").next())
            .expect("release profile missing");
        let panic_lines: Vec<&str> = release
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("panic"))
            .collect();
        assert_eq!(panic_lines, vec![r#"panic = "unwind""#]);
    }
}
