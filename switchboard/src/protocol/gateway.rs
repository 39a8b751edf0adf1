//! Gateway protocol client.
//!
//! Opcode-framed JSON over a websocket. The server opens with `Hello`
//! carrying the heartbeat interval; the client answers with `Identify` and
//! keeps a heartbeat running until the socket goes away. Outbound chat is
//! delivered over REST rather than the socket.

use crate::config::{ConnectionConfig, ProtocolKind};
use crate::error::{ClientError, ClientResult, ProtocolError};
use crate::events::{ChatMessage, ClientEvent, SourceType, UserIdentity};
use crate::protocol::ProtocolClient;
use crate::session::{SessionState, SharedSession};
use crate::transport::{self, EVENT_CHANNEL_CAPACITY, TransportEvent, TransportHandle};
use crate::util::split_into_chunks;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default REST base.
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Longest message body the REST endpoint accepts.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Guilds, presences, guild messages, typing, direct messages, message content.
pub const DEFAULT_INTENTS: u64 = (1 << 0) | (1 << 8) | (1 << 9) | (1 << 11) | (1 << 12) | (1 << 15);

/// Gateway opcodes.
pub mod opcode {
    /// Server event carrying a named payload.
    pub const DISPATCH: u8 = 0;
    /// Keep-alive, sent by either side.
    pub const HEARTBEAT: u8 = 1;
    /// Session start, client to server.
    pub const IDENTIFY: u8 = 2;
    /// The session was invalidated.
    pub const INVALID_SESSION: u8 = 9;
    /// First frame from the server.
    pub const HELLO: u8 = 10;
    /// Heartbeat acknowledged.
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// One gateway frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opcode.
    pub op: u8,
    /// Payload.
    #[serde(default)]
    pub d: Value,
    /// Sequence number, dispatch frames only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Event name, dispatch frames only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl Envelope {
    /// A client-to-server frame.
    #[must_use]
    pub fn new(op: u8, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }

    /// Heartbeat carrying the last seen sequence number.
    #[must_use]
    pub fn heartbeat(last_seq: Option<u64>) -> Self {
        Self::new(opcode::HEARTBEAT, json!(last_seq))
    }
}

#[derive(Debug, Deserialize)]
struct GatewayBot {
    url: String,
    #[serde(default)]
    shards: u32,
}

/// Settings for a gateway client.
#[derive(Clone)]
pub struct GatewayClientConfig {
    /// Connection name for logs.
    pub name: String,
    /// Bot token.
    pub token: String,
    /// REST base URL.
    pub api_base: String,
    /// Socket URL. Looked up over REST when unset.
    pub gateway_url: Option<String>,
    /// Intents bitfield sent in `Identify`.
    pub intents: u64,
    /// Presence status sent in `Identify`.
    pub status: String,
}

impl std::fmt::Debug for GatewayClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClientConfig")
            .field("name", &self.name)
            .field("api_base", &self.api_base)
            .field("gateway_url", &self.gateway_url)
            .finish_non_exhaustive()
    }
}

impl GatewayClientConfig {
    /// Create settings with defaults for everything but the token.
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            gateway_url: None,
            intents: DEFAULT_INTENTS,
            status: "online".to_string(),
        }
    }

    /// Derive client settings from a connection entry.
    pub fn from_connection(config: &ConnectionConfig) -> ClientResult<Self> {
        let token = config
            .token
            .clone()
            .ok_or_else(|| ClientError::Config(format!("{}: token missing", config.name)))?;
        let mut out = Self::new(config.name.clone(), token);
        if let Some(ref base) = config.api_base {
            out.api_base = base.trim_end_matches('/').to_string();
        }
        Ok(out)
    }

    fn identify(&self) -> Envelope {
        Envelope::new(
            opcode::IDENTIFY,
            json!({
                "token": self.token,
                "intents": self.intents,
                "compress": false,
                "large_threshold": 250,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": env!("CARGO_PKG_NAME"),
                    "device": env!("CARGO_PKG_NAME"),
                },
                "presence": {
                    "status": self.status,
                    "since": null,
                    "activities": [],
                    "afk": false,
                },
            }),
        )
    }
}

struct Inner {
    config: GatewayClientConfig,
    session: SharedSession,
    events: mpsc::Sender<ClientEvent>,
    http: reqwest::Client,
    transport: RwLock<Option<TransportHandle>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    last_seq: Mutex<Option<u64>>,
    self_id: Mutex<Option<String>>,
    quitting: AtomicBool,
}

impl Inner {
    fn last_seq(&self) -> Option<u64> {
        self.last_seq.lock().ok().and_then(|s| *s)
    }

    fn self_id(&self) -> Option<String> {
        self.self_id.lock().ok().and_then(|s| s.clone())
    }

    fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().ok().and_then(|mut h| h.take()) {
            task.abort();
        }
    }

    async fn send_frame(&self, frame: &Envelope) -> ClientResult<()> {
        let handle = self
            .transport
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        let text = serde_json::to_string(frame).map_err(ProtocolError::from)?;
        handle.send(text)?;
        Ok(())
    }
}

/// Opcode/heartbeat gateway client.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Create a client that reports to `events`.
    #[must_use]
    pub fn new(
        config: GatewayClientConfig,
        session: SharedSession,
        events: mpsc::Sender<ClientEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                session,
                events,
                http: reqwest::Client::new(),
                transport: RwLock::new(None),
                heartbeat: Mutex::new(None),
                last_seq: Mutex::new(None),
                self_id: Mutex::new(None),
                quitting: AtomicBool::new(false),
            }),
        }
    }

    /// Identifier the gateway assigned to this bot, once ready.
    #[must_use]
    pub fn self_id(&self) -> Option<String> {
        self.inner.self_id()
    }

    async fn resolve_url(&self) -> ClientResult<String> {
        if let Some(ref url) = self.inner.config.gateway_url {
            return Ok(url.clone());
        }
        let config = &self.inner.config;
        let bot: GatewayBot = self
            .inner
            .http
            .get(format!("{}/gateway/bot", config.api_base))
            .header("Authorization", format!("Bot {}", config.token))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(network = %config.name, url = %bot.url, shards = bot.shards, "gateway endpoint resolved");
        Ok(format!("{}/?v=10&encoding=json", bot.url.trim_end_matches('/')))
    }
}

async fn run(inner: Arc<Inner>, mut rx: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Received(bytes) => match serde_json::from_slice::<Envelope>(&bytes) {
                Ok(frame) => handle_frame(&inner, frame).await,
                Err(e) => debug!(
                    network = %inner.config.name,
                    error = %ProtocolError::frame(e.to_string()),
                    "dropping malformed frame"
                ),
            },
            TransportEvent::Disconnected => break,
            other => trace!(network = %inner.config.name, ?other, "transport event"),
        }
    }

    inner.stop_heartbeat();
    inner.transport.write().await.take();
    inner.session.write().await.reset();
    let user_initiated = inner.quitting.swap(false, Ordering::SeqCst);
    info!(network = %inner.config.name, user_initiated, "disconnected");
    let _ = inner
        .events
        .send(ClientEvent::Disconnected { user_initiated })
        .await;
}

async fn handle_frame(inner: &Arc<Inner>, frame: Envelope) {
    if let Some(seq) = frame.s
        && let Ok(mut last) = inner.last_seq.lock()
    {
        *last = Some(seq);
    }

    match frame.op {
        opcode::HELLO => {
            let Some(interval) = frame.d.get("heartbeat_interval").and_then(Value::as_u64) else {
                warn!(network = %inner.config.name, "hello without heartbeat interval");
                return;
            };
            start_heartbeat(inner, Duration::from_millis(interval));
            if let Err(e) = inner.send_frame(&inner.config.identify()).await {
                warn!(network = %inner.config.name, error = %e, "identify failed");
            }
        }
        opcode::HEARTBEAT => {
            if let Err(e) = inner.send_frame(&Envelope::heartbeat(inner.last_seq())).await {
                warn!(network = %inner.config.name, error = %e, "heartbeat failed");
            }
        }
        opcode::HEARTBEAT_ACK => trace!(network = %inner.config.name, "heartbeat acknowledged"),
        opcode::INVALID_SESSION => debug!(network = %inner.config.name, "invalid session ignored"),
        opcode::DISPATCH => {
            let name = frame.t.unwrap_or_default();
            handle_dispatch(inner, &name, &frame.d).await;
        }
        op => debug!(network = %inner.config.name, op, "unhandled opcode"),
    }
}

fn start_heartbeat(inner: &Arc<Inner>, interval: Duration) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    debug!(network = %inner.config.name, ?interval, "heartbeat started");
    let task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            if !inner.session.read().await.state().is_active() {
                break;
            }
            let Some(handle) = inner.transport.read().await.clone() else {
                break;
            };
            let frame = Envelope::heartbeat(inner.last_seq());
            let Ok(text) = serde_json::to_string(&frame) else {
                break;
            };
            if handle.send(text).is_err() {
                break;
            }
            trace!(network = %inner.config.name, seq = ?frame.d, "heartbeat sent");
        }
    });
    if let Ok(mut slot) = inner.heartbeat.lock()
        && let Some(old) = slot.replace(task)
    {
        old.abort();
    }
}

fn str_field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_str)
}

async fn handle_dispatch(inner: &Inner, name: &str, d: &Value) {
    let event = match name {
        "READY" => {
            let nickname = str_field(d, &["user", "username"]).unwrap_or_default().to_string();
            if let Ok(mut id) = inner.self_id.lock() {
                *id = str_field(d, &["user", "id"]).map(ToString::to_string);
            }
            inner.session.write().await.mark_ready(nickname.clone());
            info!(network = %inner.config.name, %nickname, "gateway ready");
            ClientEvent::Ready { nickname }
        }
        "GUILD_CREATE" => ClientEvent::GroupAvailable {
            id: str_field(d, &["id"]).unwrap_or_default().to_string(),
            name: str_field(d, &["name"]).unwrap_or_default().to_string(),
        },
        "MESSAGE_CREATE" => {
            let (Some(channel), Some(text)) = (str_field(d, &["channel_id"]), str_field(d, &["content"]))
            else {
                debug!(network = %inner.config.name, "message without channel or content");
                return;
            };
            let author_id = str_field(d, &["author", "id"]).map(ToString::to_string);
            let is_owned = author_id.is_some() && author_id == inner.self_id();
            let source_type = if d.get("guild_id").is_some_and(|g| !g.is_null()) {
                SourceType::ChannelOrGroup
            } else {
                SourceType::Message
            };
            ClientEvent::Message(ChatMessage {
                target: channel.to_string(),
                source_type,
                sender: UserIdentity {
                    nickname: str_field(d, &["author", "username"]).unwrap_or_default().to_string(),
                    host: None,
                    account: author_id,
                },
                text: text.to_string(),
                is_owned,
                is_notice: false,
            })
        }
        "PRESENCE_UPDATE" => ClientEvent::PresenceChanged {
            user: str_field(d, &["user", "id"]).unwrap_or_default().to_string(),
            status: str_field(d, &["status"]).unwrap_or_default().to_string(),
        },
        "TYPING_START" => ClientEvent::Typing {
            channel: str_field(d, &["channel_id"]).unwrap_or_default().to_string(),
            user: str_field(d, &["user_id"]).unwrap_or_default().to_string(),
        },
        other => {
            debug!(network = %inner.config.name, event = other, "unhandled dispatch");
            return;
        }
    };
    let _ = inner.events.send(event).await;
}

#[async_trait]
impl ProtocolClient for GatewayClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Gateway
    }

    fn session(&self) -> &SharedSession {
        &self.inner.session
    }

    async fn connect(&self) -> ClientResult<()> {
        let inner = &self.inner;
        if !inner.session.write().await.begin_connect() {
            return Err(ClientError::AlreadyConnecting);
        }
        inner.quitting.store(false, Ordering::SeqCst);

        let opened = async {
            let url = self.resolve_url().await?;
            info!(network = %inner.config.name, %url, "connecting");
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let handle = transport::connect_websocket(&url, tx).await?;
            Ok::<_, ClientError>((handle, rx))
        }
        .await;
        let (handle, rx) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                inner.session.write().await.reset();
                return Err(e);
            }
        };

        if inner.quitting.swap(false, Ordering::SeqCst) {
            handle.shutdown();
            inner.session.write().await.reset();
            info!(network = %inner.config.name, "quit during connect");
            let _ = inner
                .events
                .send(ClientEvent::Disconnected {
                    user_initiated: true,
                })
                .await;
            return Ok(());
        }
        if let Ok(mut seq) = inner.last_seq.lock() {
            *seq = None;
        }
        *inner.transport.write().await = Some(handle);
        inner
            .session
            .write()
            .await
            .set_state(SessionState::Handshaking);
        let _ = inner.events.send(ClientEvent::Connected).await;
        tokio::spawn(run(Arc::clone(inner), rx));
        Ok(())
    }

    async fn send_message(&self, target: &str, text: &str) -> ClientResult<()> {
        let config = &self.inner.config;
        let url = format!("{}/channels/{target}/messages", config.api_base);
        for chunk in split_into_chunks(text, MAX_MESSAGE_CHARS) {
            self.inner
                .http
                .post(&url)
                .header("Authorization", format!("Bot {}", config.token))
                .json(&json!({ "content": chunk }))
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }

    async fn quit(&self, _reason: Option<&str>) -> ClientResult<()> {
        let inner = &self.inner;
        inner.quitting.store(true, Ordering::SeqCst);
        inner.stop_heartbeat();
        if let Some(handle) = inner.transport.read().await.clone() {
            handle.shutdown();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NetworkSession;

    fn client() -> (GatewayClient, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let config = GatewayClientConfig::new("guild", "secret");
        (GatewayClient::new(config, NetworkSession::shared(), tx), rx)
    }

    #[test]
    fn test_envelope_parse() {
        let frame: Envelope =
            serde_json::from_str(r#"{"op":0,"d":{"x":1},"s":42,"t":"READY"}"#).unwrap();
        assert_eq!(frame.op, opcode::DISPATCH);
        assert_eq!(frame.s, Some(42));
        assert_eq!(frame.t.as_deref(), Some("READY"));

        let hello: Envelope = serde_json::from_str(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(hello.d["heartbeat_interval"], 41250);
        assert!(hello.s.is_none());
    }

    #[test]
    fn test_heartbeat_payload() {
        let text = serde_json::to_string(&Envelope::heartbeat(None)).unwrap();
        assert_eq!(text, r#"{"op":1,"d":null}"#);
        let text = serde_json::to_string(&Envelope::heartbeat(Some(7))).unwrap();
        assert_eq!(text, r#"{"op":1,"d":7}"#);
    }

    #[test]
    fn test_identify_payload() {
        let frame = GatewayClientConfig::new("guild", "secret").identify();
        assert_eq!(frame.op, opcode::IDENTIFY);
        assert_eq!(frame.d["token"], "secret");
        assert_eq!(frame.d["compress"], false);
        assert_eq!(frame.d["large_threshold"], 250);
        assert_eq!(frame.d["presence"]["status"], "online");
        assert!(frame.d["properties"]["os"].is_string());
    }

    #[tokio::test]
    async fn test_dispatch_routing() {
        let (client, mut rx) = client();
        let inner = &client.inner;

        let ready = Envelope {
            op: opcode::DISPATCH,
            d: json!({"user": {"id": "99", "username": "switchboard"}}),
            s: Some(1),
            t: Some("READY".into()),
        };
        handle_frame(inner, ready).await;
        assert_eq!(
            rx.recv().await,
            Some(ClientEvent::Ready {
                nickname: "switchboard".into()
            })
        );
        assert_eq!(inner.last_seq(), Some(1));
        assert_eq!(client.self_id().as_deref(), Some("99"));

        let own = Envelope {
            op: opcode::DISPATCH,
            d: json!({"channel_id": "5", "content": "!ping", "author": {"id": "99", "username": "switchboard"}}),
            s: Some(2),
            t: Some("MESSAGE_CREATE".into()),
        };
        handle_frame(inner, own).await;
        let Some(ClientEvent::Message(msg)) = rx.recv().await else {
            panic!("expected message");
        };
        assert!(msg.is_owned);
        assert_eq!(msg.source_type, SourceType::Message);

        let guild = Envelope {
            op: opcode::DISPATCH,
            d: json!({"channel_id": "5", "guild_id": "1", "content": "hi", "author": {"id": "3", "username": "alice"}}),
            s: Some(3),
            t: Some("MESSAGE_CREATE".into()),
        };
        handle_frame(inner, guild).await;
        let Some(ClientEvent::Message(msg)) = rx.recv().await else {
            panic!("expected message");
        };
        assert!(!msg.is_owned);
        assert_eq!(msg.source_type, SourceType::ChannelOrGroup);
        assert_eq!(msg.target, "5");
        assert_eq!(msg.sender.nickname, "alice");
    }

    #[tokio::test]
    async fn test_unknown_dispatch_dropped() {
        let (client, mut rx) = client();
        let frame = Envelope {
            op: opcode::DISPATCH,
            d: json!({}),
            s: Some(9),
            t: Some("SOMETHING_NEW".into()),
        };
        handle_frame(&client.inner, frame).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(client.inner.last_seq(), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_spacing_carries_latest_sequence() {
        use tokio::io::AsyncReadExt;

        let (client, _rx) = client();
        let inner = &client.inner;
        let (local, mut remote) = tokio::io::duplex(1024);
        let (tx, _transport_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *inner.transport.write().await = Some(transport::from_stream(local, tx));
        inner.session.write().await.set_state(SessionState::Handshaking);
        *inner.last_seq.lock().unwrap() = Some(5);

        let interval = Duration::from_millis(100);
        let start = tokio::time::Instant::now();
        start_heartbeat(inner, interval);

        let mut buf = [0u8; 64];
        for (beat, seq) in [(1u32, 5u64), (2, 5), (3, 6), (4, 6)] {
            let n = remote.read(&mut buf).await.unwrap();
            let frame: Envelope = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(frame.op, opcode::HEARTBEAT);
            assert_eq!(frame.d, json!(seq));
            assert_eq!(start.elapsed(), interval * beat);
            if beat == 2 {
                *inner.last_seq.lock().unwrap() = Some(6);
            }
        }

        inner.stop_heartbeat();
    }
}
