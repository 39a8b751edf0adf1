//! Configuration types and loading.
//!
//! The configuration is a JSON document with one entry per network
//! connection plus dispatcher settings. It is read once at startup through a
//! [`StorageHandler`]; any [`ConfigError`] aborts the process.

use crate::error::{ConfigError, ConfigResult};
use crate::storage::StorageHandler;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Default command token.
pub const DEFAULT_COMMAND_TOKEN: &str = "!";

/// Wire protocol spoken by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Line-oriented IRC-style protocol.
    Line,
    /// Opcode/heartbeat framed gateway protocol.
    Gateway,
    /// Handshake then JSON socket frames.
    Rtm,
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Line => "line",
            Self::Gateway => "gateway",
            Self::Rtm => "rtm",
        })
    }
}

/// One server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Optional server password sent before registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ServerAddress {
    /// Create a server address without a password.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
        }
    }
}

/// Account credentials for network authentication.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account name.
    pub account: String,
    /// Password.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// When configured channels are joined after connecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Join as soon as the connection is ready.
    #[default]
    Immediate,
    /// Wait until the network confirms the host is masked.
    AfterHostMasked,
}

/// Settings for one network connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Unique connection name, used in logs and status.
    pub name: String,
    /// Protocol spoken on this connection.
    pub protocol: ProtocolKind,
    /// Whether the connection is started.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Servers tried in round-robin order (line protocol).
    #[serde(default)]
    pub servers: Vec<ServerAddress>,
    /// Nickname (line protocol).
    #[serde(default)]
    pub nickname: Option<String>,
    /// Alternate nickname.
    #[serde(default)]
    pub alternate_nickname: Option<String>,
    /// Username sent at registration.
    #[serde(default)]
    pub username: Option<String>,
    /// Real name sent at registration.
    #[serde(default)]
    pub realname: Option<String>,
    /// Network identity used to pick a login sequence.
    #[serde(default)]
    pub network: Option<String>,
    /// Account credentials.
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// API token (gateway and RTM protocols).
    #[serde(default)]
    pub token: Option<String>,
    /// REST base URL override (gateway and RTM protocols).
    #[serde(default)]
    pub api_base: Option<String>,
    /// Channels joined after connecting.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Prefix marking a chat message as a command.
    #[serde(default = "default_command_token")]
    pub command_token: String,
    /// When to join the configured channels.
    #[serde(default)]
    pub join_policy: JoinPolicy,
    /// User mode change requested after connecting, e.g. `+x`.
    #[serde(default)]
    pub user_mode: Option<String>,
    /// Seconds to wait before reconnecting after an unsolicited disconnect.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("enabled", &self.enabled)
            .field("servers", &self.servers)
            .field("nickname", &self.nickname)
            .field("channels", &self.channels)
            .field("command_token", &self.command_token)
            .field("join_policy", &self.join_policy)
            .finish_non_exhaustive()
    }
}

const fn default_true() -> bool {
    true
}

fn default_command_token() -> String {
    DEFAULT_COMMAND_TOKEN.to_string()
}

const fn default_reconnect_delay() -> u64 {
    5
}

impl ConnectionConfig {
    /// Create a config with defaults for everything but name and protocol.
    pub fn new(name: impl Into<String>, protocol: ProtocolKind) -> Self {
        Self {
            name: name.into(),
            protocol,
            enabled: true,
            servers: Vec::new(),
            nickname: None,
            alternate_nickname: None,
            username: None,
            realname: None,
            network: None,
            credentials: None,
            token: None,
            api_base: None,
            channels: Vec::new(),
            command_token: default_command_token(),
            join_policy: JoinPolicy::default(),
            user_mode: None,
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }

    /// Add a server.
    #[must_use]
    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.servers.push(ServerAddress::new(host, port));
        self
    }

    /// Set the nickname.
    #[must_use]
    pub fn nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    /// Add a channel to join.
    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    /// Set the API token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the REST base URL.
    #[must_use]
    pub fn api_base(mut self, url: impl Into<String>) -> Self {
        self.api_base = Some(url.into());
        self
    }

    /// Set the command token.
    #[must_use]
    pub fn command_token(mut self, token: impl Into<String>) -> Self {
        self.command_token = token.into();
        self
    }

    /// Set the join policy.
    #[must_use]
    pub const fn join_policy(mut self, policy: JoinPolicy) -> Self {
        self.join_policy = policy;
        self
    }

    /// Reconnect delay as a duration.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Check that every field the protocol needs is present.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.command_token.is_empty() {
            return Err(ConfigError::invalid(format!(
                "{}: command_token must not be empty",
                self.name
            )));
        }
        match self.protocol {
            ProtocolKind::Line => {
                if self.nickname.as_deref().is_none_or(str::is_empty) {
                    return Err(ConfigError::missing(format!("{}: nickname", self.name)));
                }
                if self.servers.is_empty() {
                    return Err(ConfigError::missing(format!("{}: servers", self.name)));
                }
            }
            ProtocolKind::Gateway | ProtocolKind::Rtm => {
                if self.token.as_deref().is_none_or(str::is_empty) {
                    return Err(ConfigError::missing(format!("{}: token", self.name)));
                }
            }
        }
        Ok(())
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Milliseconds between queue drains.
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,
}

const fn default_tick_ms() -> u64 {
    250
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_ms(),
        }
    }
}

impl DispatcherConfig {
    /// Tick interval as a duration.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    /// Dispatcher settings.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Network connections.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl BotConfig {
    /// Validate every enabled connection and name uniqueness.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut names = HashSet::new();
        for conn in &self.connections {
            if !names.insert(conn.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate connection name: {}",
                    conn.name
                )));
            }
            if conn.enabled {
                conn.validate()?;
            }
        }
        if self.dispatcher.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("dispatcher.tick_interval_ms must be > 0"));
        }
        Ok(())
    }

    /// Enabled connections only.
    pub fn enabled_connections(&self) -> impl Iterator<Item = &ConnectionConfig> {
        self.connections.iter().filter(|c| c.enabled)
    }

    /// A starter configuration with one disabled entry per protocol.
    #[must_use]
    pub fn template() -> Self {
        let mut line = ConnectionConfig::new("libera", ProtocolKind::Line)
            .server("irc.libera.chat", 6667)
            .nickname("switchboard")
            .channel("#switchboard");
        line.enabled = false;

        let mut gateway = ConnectionConfig::new("guild", ProtocolKind::Gateway).token("BOT_TOKEN");
        gateway.enabled = false;

        let mut rtm = ConnectionConfig::new("workspace", ProtocolKind::Rtm).token("xoxb-TOKEN");
        rtm.enabled = false;

        Self {
            dispatcher: DispatcherConfig::default(),
            connections: vec![line, gateway, rtm],
        }
    }
}

/// Source of per-network settings.
pub trait ConfigurationProvider: Send + Sync {
    /// Every configured connection, enabled or not.
    fn connections(&self) -> &[ConnectionConfig];

    /// Dispatcher settings.
    fn dispatcher(&self) -> DispatcherConfig;
}

impl ConfigurationProvider for BotConfig {
    fn connections(&self) -> &[ConnectionConfig] {
        &self.connections
    }

    fn dispatcher(&self) -> DispatcherConfig {
        self.dispatcher
    }
}

/// Parse and validate a configuration document.
pub fn parse_config(text: &str) -> ConfigResult<BotConfig> {
    let config: BotConfig = serde_json::from_str(text)?;
    config.validate()?;
    Ok(config)
}

/// Load and validate the configuration at `path`.
pub async fn load_config(storage: &dyn StorageHandler, path: &Path) -> ConfigResult<BotConfig> {
    debug!(path = %path.display(), "loading config");
    let text = storage.read(path).await?;
    let config = parse_config(&text)?;
    info!(
        path = %path.display(),
        connections = config.connections.len(),
        "config loaded"
    );
    Ok(config)
}

/// Write the template configuration to `path`.
pub async fn init_config(storage: &dyn StorageHandler, path: &Path) -> ConfigResult<()> {
    let text = serde_json::to_string_pretty(&BotConfig::template())?;
    storage.write(path, &text).await?;
    Ok(())
}
