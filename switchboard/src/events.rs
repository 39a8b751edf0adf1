//! Protocol-level events raised by the protocol clients.
//!
//! Every client turns its own wire format into [`ClientEvent`]s and pushes
//! them down an `mpsc` channel owned by its bot adapter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity of a chat user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Display nickname.
    pub nickname: String,
    /// Host, when the network exposes it.
    pub host: Option<String>,
    /// Account or username.
    pub account: Option<String>,
}

impl UserIdentity {
    /// Create an identity carrying only a nickname.
    pub fn nick(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            host: None,
            account: None,
        }
    }

    /// Parse a `nick!user@host` prefix. Server names parse as a bare nickname.
    #[must_use]
    pub fn parse_prefix(prefix: &str) -> Self {
        let (nick_user, host) = match prefix.split_once('@') {
            Some((left, host)) => (left, Some(host.to_string())),
            None => (prefix, None),
        };
        let (nickname, account) = match nick_user.split_once('!') {
            Some((nick, user)) => (nick.to_string(), Some(user.to_string())),
            None => (nick_user.to_string(), None),
        };
        Self {
            nickname,
            host,
            account,
        }
    }
}

/// Where a message was sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// A channel, group or guild text channel.
    ChannelOrGroup,
    /// A private/direct message.
    Message,
    /// No conversational origin (timer commands).
    #[default]
    None,
}

/// A chat message addressed to a channel or to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Reply target: the channel, or the sender for private messages.
    pub target: String,
    /// Channel vs. private classification.
    pub source_type: SourceType,
    /// Author of the message.
    pub sender: UserIdentity,
    /// Message text.
    pub text: String,
    /// Whether the bot itself authored the message.
    pub is_owned: bool,
    /// Whether the message was a notice rather than a regular message.
    pub is_notice: bool,
}

/// A mode letter with its optional parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelModeValue {
    /// Mode letter.
    pub mode: char,
    /// Parameter consumed by the mode, if any.
    pub value: Option<String>,
}

impl ChannelModeValue {
    /// Create a mode value.
    #[must_use]
    pub const fn new(mode: char, value: Option<String>) -> Self {
        Self { mode, value }
    }
}

/// Events raised by any protocol client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The transport is up and the handshake has started.
    Connected,
    /// The network accepted the session.
    Ready {
        /// Nickname or bot user name the network knows us by.
        nickname: String,
    },
    /// The network confirmed our host is masked/cloaked.
    HostMasked {
        /// Displayed host.
        host: String,
    },
    /// A channel or private message.
    Message(ChatMessage),
    /// A user joined a channel.
    Joined {
        /// Channel name.
        channel: String,
        /// Acting user.
        user: UserIdentity,
        /// Whether the acting user is this bot.
        is_self: bool,
    },
    /// A user left a channel.
    Parted {
        /// Channel name.
        channel: String,
        /// Acting user.
        user: UserIdentity,
        /// Whether the acting user is this bot.
        is_self: bool,
    },
    /// A user quit the network.
    Quit {
        /// Acting user.
        user: UserIdentity,
        /// Quit message.
        reason: Option<String>,
    },
    /// Channel mode delta.
    ChannelModeChanged {
        /// Channel name.
        channel: String,
        /// Modes added.
        added: Vec<ChannelModeValue>,
        /// Modes removed.
        removed: Vec<ChannelModeValue>,
    },
    /// User mode delta.
    UserModeChanged {
        /// Nickname whose modes changed.
        target: String,
        /// Modes added.
        added: BTreeSet<char>,
        /// Modes removed.
        removed: BTreeSet<char>,
    },
    /// A guild/workspace became available.
    GroupAvailable {
        /// Group identifier.
        id: String,
        /// Group display name.
        name: String,
    },
    /// A user's presence changed.
    PresenceChanged {
        /// User identifier.
        user: String,
        /// New presence status.
        status: String,
    },
    /// A user started typing.
    Typing {
        /// Channel identifier.
        channel: String,
        /// User identifier.
        user: String,
    },
    /// The connection went away.
    Disconnected {
        /// Whether a local quit caused it.
        user_initiated: bool,
    },
}
