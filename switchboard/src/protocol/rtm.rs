//! RTM protocol client.
//!
//! One HTTP call trades the API token for the bot's identity, a socket URL
//! and snapshots of channels, users and direct-message conversations. The
//! socket then carries JSON frames tagged by `type`. When the socket drops
//! without a local quit, the client re-runs the handshake and resumes
//! reading before it reports anything upward.

use crate::config::{ConnectionConfig, ProtocolKind};
use crate::error::{ClientError, ClientResult, ProtocolError};
use crate::events::{ChatMessage, ClientEvent, SourceType, UserIdentity};
use crate::protocol::ProtocolClient;
use crate::session::{SessionState, SharedSession};
use crate::transport::{self, EVENT_CHANNEL_CAPACITY, TransportEvent, TransportHandle};
use crate::util::split_into_chunks;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, trace, warn};

/// Default REST base.
pub const DEFAULT_API_BASE: &str = "https://slack.com/api";

/// Longest text carried by one message frame.
pub const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Deserialize)]
struct Handshake {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(rename = "self", default)]
    me: Option<Named>,
    #[serde(default)]
    channels: Vec<Named>,
    #[serde(default)]
    users: Vec<Named>,
    #[serde(default)]
    ims: Vec<Im>,
}

#[derive(Debug, Deserialize)]
struct Named {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct Im {
    id: String,
}

/// Identity and snapshots returned by the handshake.
#[derive(Debug, Clone, Default)]
pub struct RtmSnapshot {
    /// Bot user id.
    pub self_id: String,
    /// Bot user name.
    pub self_name: String,
    /// Channel id to name.
    pub channels: HashMap<String, String>,
    /// User id to name.
    pub users: HashMap<String, String>,
    /// Direct-message conversation ids.
    pub ims: HashSet<String>,
}

impl RtmSnapshot {
    fn user_name(&self, id: &str) -> String {
        self.users
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

/// Settings for an RTM client.
#[derive(Clone)]
pub struct RtmClientConfig {
    /// Connection name for logs.
    pub name: String,
    /// API token.
    pub token: String,
    /// REST base URL.
    pub api_base: String,
}

impl std::fmt::Debug for RtmClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmClientConfig")
            .field("name", &self.name)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl RtmClientConfig {
    /// Create settings with the default API base.
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
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
}

struct Inner {
    config: RtmClientConfig,
    session: SharedSession,
    events: mpsc::Sender<ClientEvent>,
    http: reqwest::Client,
    transport: RwLock<Option<TransportHandle>>,
    snapshot: RwLock<RtmSnapshot>,
    next_id: AtomicU64,
    quitting: AtomicBool,
}

/// JSON-over-socket real-time messaging client.
#[derive(Clone)]
pub struct RtmClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RtmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmClient")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl RtmClient {
    /// Create a client that reports to `events`.
    #[must_use]
    pub fn new(
        config: RtmClientConfig,
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
                snapshot: RwLock::new(RtmSnapshot::default()),
                next_id: AtomicU64::new(1),
                quitting: AtomicBool::new(false),
            }),
        }
    }

    /// Snapshot from the most recent handshake.
    pub async fn snapshot(&self) -> RtmSnapshot {
        self.inner.snapshot.read().await.clone()
    }
}

/// Run the HTTP handshake and return the socket URL.
async fn handshake(inner: &Inner) -> ClientResult<String> {
    let config = &inner.config;
    let reply: Handshake = inner
        .http
        .get(format!("{}/rtm.start", config.api_base))
        .bearer_auth(&config.token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if !reply.ok {
        let reason = reply.error.unwrap_or_else(|| "unknown error".to_string());
        return Err(ProtocolError::HandshakeRejected(reason).into());
    }
    let url = reply
        .url
        .ok_or_else(|| ProtocolError::HandshakeRejected("no socket url".into()))?;
    let me = reply
        .me
        .ok_or_else(|| ProtocolError::HandshakeRejected("no self identity".into()))?;

    let snapshot = RtmSnapshot {
        self_id: me.id,
        self_name: me.name,
        channels: reply.channels.into_iter().map(|c| (c.id, c.name)).collect(),
        users: reply.users.into_iter().map(|u| (u.id, u.name)).collect(),
        ims: reply.ims.into_iter().map(|im| im.id).collect(),
    };
    info!(
        network = %config.name,
        user = %snapshot.self_name,
        channels = snapshot.channels.len(),
        users = snapshot.users.len(),
        "rtm handshake complete"
    );
    *inner.snapshot.write().await = snapshot;
    Ok(url)
}

/// Handshake, open the socket and install it as the live transport.
///
/// The session is `Authenticated` once the token is accepted and stays
/// there until the socket says `hello`.
async fn open(inner: &Inner) -> ClientResult<mpsc::Receiver<TransportEvent>> {
    inner
        .session
        .write()
        .await
        .set_state(SessionState::Handshaking);
    let url = handshake(inner).await?;
    inner
        .session
        .write()
        .await
        .set_state(SessionState::Authenticated);
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let handle = transport::connect_websocket(&url, tx).await?;
    *inner.transport.write().await = Some(handle);
    Ok(rx)
}

async fn run(inner: Arc<Inner>, mut rx: mpsc::Receiver<TransportEvent>) {
    loop {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Received(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                    Ok(frame) => handle_frame(&inner, &frame).await,
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
        inner.transport.write().await.take();

        if inner.quitting.load(Ordering::SeqCst) {
            break;
        }
        warn!(network = %inner.config.name, "socket lost, repeating handshake");
        match open(&inner).await {
            Ok(next) => rx = next,
            Err(e) => {
                warn!(network = %inner.config.name, error = %e, "re-handshake failed");
                break;
            }
        }
        // A quit that landed while the handshake was in flight.
        if inner.quitting.load(Ordering::SeqCst) {
            close_transport(&inner).await;
            break;
        }
    }

    inner.session.write().await.reset();
    let user_initiated = inner.quitting.swap(false, Ordering::SeqCst);
    info!(network = %inner.config.name, user_initiated, "disconnected");
    let _ = inner
        .events
        .send(ClientEvent::Disconnected { user_initiated })
        .await;
}

async fn close_transport(inner: &Inner) {
    if let Some(handle) = inner.transport.write().await.take() {
        handle.shutdown();
    }
}

async fn handle_frame(inner: &Inner, frame: &Value) {
    let field = |key: &str| frame.get(key).and_then(Value::as_str);
    let Some(kind) = field("type") else {
        if frame.get("reply_to").is_some() {
            trace!(network = %inner.config.name, "send acknowledged");
        }
        return;
    };

    let event = match kind {
        "hello" => {
            let nickname = inner.snapshot.read().await.self_name.clone();
            inner.session.write().await.mark_ready(nickname.clone());
            info!(network = %inner.config.name, %nickname, "rtm ready");
            ClientEvent::Ready { nickname }
        }
        "message" => {
            let (Some(channel), Some(text)) = (field("channel"), field("text")) else {
                debug!(network = %inner.config.name, "message without channel or text");
                return;
            };
            let user = field("user").unwrap_or_default();
            let snapshot = inner.snapshot.read().await;
            let source_type = if snapshot.ims.contains(channel) {
                SourceType::Message
            } else {
                SourceType::ChannelOrGroup
            };
            ClientEvent::Message(ChatMessage {
                target: channel.to_string(),
                source_type,
                sender: UserIdentity {
                    nickname: snapshot.user_name(user),
                    host: None,
                    account: Some(user.to_string()),
                },
                text: text.to_string(),
                is_owned: !user.is_empty() && user == snapshot.self_id,
                is_notice: false,
            })
        }
        "presence_change" => ClientEvent::PresenceChanged {
            user: field("user").unwrap_or_default().to_string(),
            status: field("presence").unwrap_or_default().to_string(),
        },
        "user_typing" => ClientEvent::Typing {
            channel: field("channel").unwrap_or_default().to_string(),
            user: field("user").unwrap_or_default().to_string(),
        },
        other => {
            debug!(network = %inner.config.name, kind = other, "unhandled frame");
            return;
        }
    };
    let _ = inner.events.send(event).await;
}

#[async_trait]
impl ProtocolClient for RtmClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Rtm
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
        let rx = match open(inner).await {
            Ok(rx) => rx,
            Err(e) => {
                inner.session.write().await.reset();
                return Err(e);
            }
        };
        if inner.quitting.swap(false, Ordering::SeqCst) {
            close_transport(inner).await;
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
        let _ = inner.events.send(ClientEvent::Connected).await;
        tokio::spawn(run(Arc::clone(inner), rx));
        Ok(())
    }

    async fn send_message(&self, target: &str, text: &str) -> ClientResult<()> {
        let handle = self
            .inner
            .transport
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        for chunk in split_into_chunks(text, MAX_MESSAGE_CHARS) {
            let frame = json!({
                "id": self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                "type": "message",
                "channel": target,
                "text": chunk,
            });
            handle.send(frame.to_string())?;
        }
        Ok(())
    }

    async fn quit(&self, _reason: Option<&str>) -> ClientResult<()> {
        // Set first so a handshake still in flight sees it.
        self.inner.quitting.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.transport.read().await.clone() {
            handle.shutdown();
        }
        Ok(())
    }
}
