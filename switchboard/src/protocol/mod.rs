//! Protocol clients.
//!
//! Each client owns one transport, keeps its [`NetworkSession`] current and
//! reports what happens on the wire as [`ClientEvent`]s over an mpsc
//! channel handed to it at construction. Clients never reconnect on their
//! own except where the protocol hides reconnects from the caller (RTM).
//!
//! [`NetworkSession`]: crate::session::NetworkSession
//! [`ClientEvent`]: crate::events::ClientEvent

pub mod gateway;
pub mod line;
pub mod rtm;

use crate::config::ProtocolKind;
use crate::error::{ClientError, ClientResult};
use crate::session::SharedSession;
use async_trait::async_trait;

pub use gateway::GatewayClient;
pub use line::LineClient;
pub use rtm::RtmClient;

/// Common surface of the protocol clients.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Protocol spoken.
    fn kind(&self) -> ProtocolKind;

    /// Session this client maintains.
    fn session(&self) -> &SharedSession;

    /// Start connecting. Fails with `AlreadyConnecting` while a previous
    /// attempt or connection is still active.
    async fn connect(&self) -> ClientResult<()>;

    /// Deliver `text` to `target`, segmenting as the protocol requires.
    async fn send_message(&self, target: &str, text: &str) -> ClientResult<()>;

    /// Disconnect on purpose. The resulting `Disconnected` event carries
    /// `user_initiated = true`.
    async fn quit(&self, reason: Option<&str>) -> ClientResult<()>;

    /// Join a channel.
    async fn join(&self, _channel: &str) -> ClientResult<()> {
        Err(ClientError::Unsupported("join"))
    }

    /// Request a user mode change.
    async fn set_user_mode(&self, _mode: &str) -> ClientResult<()> {
        Err(ClientError::Unsupported("user modes"))
    }

    /// Send one raw protocol line.
    async fn send_raw(&self, _line: &str) -> ClientResult<()> {
        Err(ClientError::Unsupported("raw lines"))
    }
}
