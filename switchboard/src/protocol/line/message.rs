//! Line framing and message parsing for the IRC-style protocol.
//!
//! Wire form: `[:prefix ]COMMAND[ param]*[ :trailing]` terminated by CRLF.
//! Leading IRCv3 `@tags` are accepted and skipped.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::BytesMut;
use std::fmt;
use tokio_util::codec::Decoder;

/// Characters that mark a target as a channel.
pub const CHANNEL_SIGILS: [char; 4] = ['#', '&', '+', '!'];

/// Most positional parameters before the rest of the line becomes trailing.
pub const MAX_MIDDLE_PARAMS: usize = 14;

/// Whether `target` names a channel rather than a user.
#[must_use]
pub fn is_channel(target: &str) -> bool {
    target.starts_with(CHANNEL_SIGILS)
}

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Source of the message, without its leading `:`.
    pub prefix: Option<String>,
    /// Command word or three-digit numeric, uppercased.
    pub command: String,
    /// Positional parameters.
    pub params: Vec<String>,
    /// Free-text final parameter, may contain spaces.
    pub trailing: Option<String>,
}

impl Message {
    /// Parse one line. Returns `None` for empty or malformed input.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        if rest.starts_with('@') {
            let end = rest.find(' ')?;
            rest = rest[end + 1..].trim_start_matches(' ');
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let end = stripped.find(' ')?;
            let pfx = &stripped[..end];
            rest = stripped[end + 1..].trim_start_matches(' ');
            if pfx.is_empty() {
                return None;
            }
            Some(pfx.to_string())
        } else {
            None
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((cmd, tail)) => (cmd, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        let mut trailing = None;
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(text) = rest.strip_prefix(':') {
                trailing = Some(text.to_string());
                break;
            }
            if params.len() == MAX_MIDDLE_PARAMS {
                trailing = Some(rest.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_string());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
            trailing,
        })
    }

    /// Build an outbound message.
    pub fn new(command: &str, params: &[&str], trailing: Option<&str>) -> Self {
        Self {
            prefix: None,
            command: command.to_string(),
            params: params.iter().map(ToString::to_string).collect(),
            trailing: trailing.map(ToString::to_string),
        }
    }

    /// A chat message to `target`.
    #[must_use]
    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::new("PRIVMSG", &[target], Some(text))
    }

    /// Positional parameter `idx`, falling back to the trailing text when
    /// the positional list is exhausted exactly at `idx`.
    #[must_use]
    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str).or_else(|| {
            if idx == self.params.len() {
                self.trailing.as_deref()
            } else {
                None
            }
        })
    }

    /// Positional parameters followed by the trailing text.
    pub fn args(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .map(String::as_str)
            .chain(self.trailing.as_deref())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        for param in &self.params {
            write!(f, " {param}")?;
        }
        if let Some(ref trailing) = self.trailing {
            write!(f, " :{trailing}")?;
        }
        Ok(())
    }
}

/// Longest line accepted from the server, terminator excluded.
pub const MAX_LINE_BYTES: usize = 8191;

/// Frames a byte stream into lines.
///
/// Empty lines are skipped. A line longer than the limit is reported once as
/// [`ProtocolError::LineTooLong`] and then discarded up to its terminator,
/// so decoding resumes with the next line.
#[derive(Debug, Clone, Copy)]
pub struct LineCodec {
    next_index: usize,
    max_len: usize,
    discarding: bool,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::with_max_len(MAX_LINE_BYTES)
    }
}

impl LineCodec {
    /// Codec with the default limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec with a custom line limit.
    #[must_use]
    pub const fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len,
            discarding: false,
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<String>> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                if self.discarding {
                    src.clear();
                    self.next_index = 0;
                } else if src.len() > self.max_len {
                    let actual = src.len();
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Err(ProtocolError::LineTooLong {
                        actual,
                        limit: self.max_len,
                    });
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let raw = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let line = raw.strip_suffix(b"\n").unwrap_or(&raw[..]);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.len() > self.max_len {
                return Err(ProtocolError::LineTooLong {
                    actual: line.len(),
                    limit: self.max_len,
                });
            }
            if line.is_empty() {
                continue;
            }
            return Ok(Some(String::from_utf8_lossy(line).into_owned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_line() {
        let msg = Message::parse(":alice!a@host PRIVMSG #chan :hello there").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan"]);
        assert_eq!(msg.trailing.as_deref(), Some("hello there"));
    }

    #[test]
    fn test_parse_without_prefix_or_trailing() {
        let msg = Message::parse("ping server1").unwrap();
        assert!(msg.prefix.is_none());
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["server1"]);
        assert!(msg.trailing.is_none());
    }

    #[test]
    fn test_parse_skips_tags() {
        let msg = Message::parse("@time=2024-01-01T00:00:00Z :n!u@h JOIN #c").unwrap();
        assert_eq!(msg.command, "JOIN");
        assert_eq!(msg.arg(0), Some("#c"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Message::parse("").is_none());
        assert!(Message::parse(":prefixonly").is_none());
        assert!(Message::parse(": PRIVMSG x").is_none());
    }

    #[test]
    fn test_param_limit_folds_into_trailing() {
        let line = format!("CMD {} rest of it", (1..=14).map(|i| i.to_string()).collect::<Vec<_>>().join(" "));
        let msg = Message::parse(&line).unwrap();
        assert_eq!(msg.params.len(), MAX_MIDDLE_PARAMS);
        assert_eq!(msg.trailing.as_deref(), Some("rest of it"));
    }

    #[test]
    fn test_arg_falls_back_to_trailing() {
        let msg = Message::parse(":n!u@h JOIN :#chan").unwrap();
        assert_eq!(msg.arg(0), Some("#chan"));
        assert_eq!(msg.arg(1), None);
    }

    #[test]
    fn test_channel_classification() {
        for target in ["#a", "&b", "+c", "!d"] {
            assert!(is_channel(target), "{target}");
        }
        for target in ["alice", "@x", "", "%e"] {
            assert!(!is_channel(target), "{target}");
        }
    }

    #[test]
    fn test_outbound_channel_message_reparses() {
        let out = Message::privmsg("#rust", "hi :) there").to_string();
        let back = Message::parse(&out).unwrap();
        assert_eq!(back.arg(0), Some("#rust"));
        assert!(is_channel(back.arg(0).unwrap()));
        assert_eq!(back.trailing.as_deref(), Some("hi :) there"));
    }

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<ProtocolResult<String>> {
        let mut out = Vec::new();
        loop {
            match codec.decode(buf) {
                Ok(Some(line)) => out.push(Ok(line)),
                Ok(None) => return out,
                Err(e) => out.push(Err(e)),
            }
        }
    }

    #[test]
    fn test_codec_keeps_fragment() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"PING a\r\n\r\nPING b\r\nPIN"[..]);
        let lines: Vec<String> = decode_all(&mut codec, &mut buf).into_iter().map(Result::unwrap).collect();
        assert_eq!(lines, vec!["PING a", "PING b"]);
        assert_eq!(&buf[..], b"PIN");

        buf.extend_from_slice(b"G c\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING c"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_split_terminator() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"NOTICE x :y\r"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("NOTICE x :y"));
    }

    #[test]
    fn test_codec_drops_unterminated_flood() {
        let mut codec = LineCodec::with_max_len(16);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[b'a'; 20]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong { actual: 20, limit: 16 }));
        assert!(buf.is_empty());

        // The rest of the oversized line is thrown away without piling up.
        for _ in 0..100 {
            buf.extend_from_slice(&[b'a'; 64]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert!(buf.is_empty());
        }

        buf.extend_from_slice(b"tail\r\nPING ok\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING ok"));
    }

    #[test]
    fn test_codec_rejects_long_terminated_line() {
        let mut codec = LineCodec::with_max_len(8);
        let mut buf = BytesMut::from(&b"0123456789\r\nPING x\r\n"[..]);
        let results = decode_all(&mut codec, &mut buf);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(ProtocolError::LineTooLong { actual: 10, .. })));
        assert_eq!(results[1].as_deref().unwrap(), "PING x");
    }
}
