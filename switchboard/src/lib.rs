//! Switchboard - a multi-protocol chat bot with one command dispatcher.
//!
//! Persistent connections to several chat networks are normalized into a
//! single command model and routed to built-in or plugin handlers, with
//! responses delivered back to the network the command came from.
//!
//! # Architecture
//!
//! - **Transport** ([`transport`]) - TCP and websocket byte pumps
//! - **Protocol clients** ([`protocol`]) - line (IRC-style), gateway
//!   (opcode/heartbeat) and RTM (JSON-over-socket) clients
//! - **Bot adapter** ([`adapter`]) - per-connection glue between a client
//!   and the command model
//! - **Dispatcher** ([`dispatcher`]) - drains the [`queue`] and runs
//!   [`builtins`] and [`plugin`]s
//! - **Runtime** ([`runtime`]) - wires everything from a [`config`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use switchboard::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = parse_config(&std::fs::read_to_string("config.json")?)?;
//!     let runtime = RuntimeBuilder::new()
//!         .config(config)
//!         .plugins(switchboard::plugins::manifest())
//!         .build()?;
//!     runtime.run().await
//! }
//! ```

// Core modules
pub mod adapter;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod session;
pub mod transport;
pub mod util;

// Handlers and plugins
pub mod builtins;
pub mod handler;
pub mod plugin;
pub mod plugins;

// Bootstrap storage
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    // Error types (centralized)
    pub use crate::error::{
        BotError, ClientError, ClientResult, ConfigError, ConfigResult, DispatchError,
        HandlerError, HandlerResult, ProtocolError, Result, StorageError, StorageResult,
        TransportError,
    };

    // Command model
    pub use crate::command::{Command, ResponseSink, Source, TriggeredBy};
    pub use crate::events::{ChannelModeValue, ChatMessage, ClientEvent, SourceType, UserIdentity};

    // Config
    pub use crate::config::{
        BotConfig, ConfigurationProvider, ConnectionConfig, Credentials, DispatcherConfig,
        JoinPolicy, ProtocolKind, ServerAddress, init_config, load_config, parse_config,
    };

    // Protocol clients
    pub use crate::protocol::{GatewayClient, LineClient, ProtocolClient, RtmClient};
    pub use crate::session::{NetworkSession, SessionState, SharedSession};

    // Adapter, dispatcher, runtime
    pub use crate::adapter::{AdapterStatus, BotAdapter, LoginSequence};
    pub use crate::dispatcher::{Dispatcher, DispatcherHandle};
    pub use crate::queue::CommandQueue;
    pub use crate::runtime::{Runtime, RuntimeBuilder, RuntimeStatus};

    // Handlers and plugins
    pub use crate::handler::{CommandHandler, HandlerTable};
    pub use crate::plugin::{DispatcherFacade, Plugin, PluginManifest, PluginRegistry};

    // Storage
    pub use crate::storage::{FileStorage, MemoryStorage, StorageHandler};

    // Utilities
    pub use crate::util::{config_dir, config_path, generate_id, split_into_chunks};
}
