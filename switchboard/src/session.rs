//! Per-connection network session state.

use crate::events::ChannelModeValue;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No connection and no attempt running.
    #[default]
    Disconnected,
    /// Transport connect in progress.
    Connecting,
    /// Transport up, protocol handshake in progress.
    Handshaking,
    /// Credentials accepted, not yet usable. Only protocols that confirm
    /// the token separately from readiness pass through here.
    Authenticated,
    /// Fully usable.
    Ready,
}

impl SessionState {
    /// Whether a connect attempt is running or finished.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

/// State the bot tracks about itself on one network.
///
/// Channel membership holds only channels this bot joined, never the
/// full occupant list.
#[derive(Debug, Default)]
pub struct NetworkSession {
    state: SessionState,
    nickname: Option<String>,
    channels: BTreeSet<String>,
    channel_modes: HashMap<String, BTreeSet<ChannelModeValue>>,
    authenticated: bool,
}

/// Session shared between a protocol client and its adapter.
pub type SharedSession = Arc<RwLock<NetworkSession>>;

/// Case-fold a channel or nickname for comparison.
#[must_use]
pub fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl NetworkSession {
    /// Create a disconnected session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared session.
    #[must_use]
    pub fn shared() -> SharedSession {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `state`.
    pub fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "session state changed");
            self.state = state;
        }
    }

    /// Start a connect attempt. Returns `false` when one is already running
    /// or the session is connected.
    pub fn begin_connect(&mut self) -> bool {
        if self.state.is_active() {
            return false;
        }
        self.set_state(SessionState::Connecting);
        true
    }

    /// Mark the session usable under `nickname`.
    pub fn mark_ready(&mut self, nickname: impl Into<String>) {
        self.nickname = Some(nickname.into());
        self.set_state(SessionState::Ready);
    }

    /// Forget everything tied to the previous connection.
    pub fn reset(&mut self) {
        self.set_state(SessionState::Disconnected);
        self.channels.clear();
        self.channel_modes.clear();
        self.authenticated = false;
    }

    /// Nickname snapshot taken when the session became ready.
    #[must_use]
    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    /// Set the nickname before the session is ready.
    pub fn set_nickname(&mut self, nickname: impl Into<String>) {
        self.nickname = Some(nickname.into());
    }

    /// Whether `nick` is this bot.
    #[must_use]
    pub fn is_self(&self, nick: &str) -> bool {
        self.nickname
            .as_deref()
            .is_some_and(|own| own.eq_ignore_ascii_case(nick))
    }

    /// Record a self-join.
    pub fn join(&mut self, channel: &str) {
        self.channels.insert(fold(channel));
    }

    /// Record a self-part.
    pub fn part(&mut self, channel: &str) {
        let key = fold(channel);
        self.channels.remove(&key);
        self.channel_modes.remove(&key);
    }

    /// Whether this bot is in `channel`.
    #[must_use]
    pub fn is_member(&self, channel: &str) -> bool {
        self.channels.contains(&fold(channel))
    }

    /// Joined channels.
    #[must_use]
    pub const fn channels(&self) -> &BTreeSet<String> {
        &self.channels
    }

    /// Apply a mode delta to the stored channel modes.
    pub fn apply_channel_modes(
        &mut self,
        channel: &str,
        added: &[ChannelModeValue],
        removed: &[ChannelModeValue],
    ) {
        let modes = self.channel_modes.entry(fold(channel)).or_default();
        for value in removed {
            match value.value {
                Some(_) => {
                    modes.remove(value);
                }
                None => modes.retain(|m| m.mode != value.mode),
            }
        }
        for value in added {
            modes.insert(value.clone());
        }
    }

    /// Modes currently known for `channel`.
    #[must_use]
    pub fn channel_modes(&self, channel: &str) -> Vec<ChannelModeValue> {
        self.channel_modes
            .get(&fold(channel))
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether network authentication completed.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Record network authentication.
    pub fn set_authenticated(&mut self, value: bool) {
        self.authenticated = value;
    }
}
