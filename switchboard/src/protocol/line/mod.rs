//! IRC-style line protocol.

pub mod client;
pub mod message;
pub mod modes;

pub use client::{LineClient, LineClientConfig};
pub use message::{LineCodec, MAX_LINE_BYTES, Message, is_channel};
pub use modes::{ModeTable, parse_user_modes};
