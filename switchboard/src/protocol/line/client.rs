//! Line protocol client.
//!
//! Registers with the server, frames the byte stream into lines, keeps
//! the session's membership and mode state in step with what the server
//! reports, and raises [`ClientEvent`]s for the adapter. Reconnecting is
//! left to the adapter; this client only reports `Disconnected`.

use super::message::{LineCodec, Message, is_channel};
use super::modes::{ModeTable, parse_user_modes};
use crate::config::{ConnectionConfig, ProtocolKind, ServerAddress};
use crate::error::{ClientError, ClientResult};
use crate::events::{ChatMessage, ClientEvent, SourceType, UserIdentity};
use crate::protocol::ProtocolClient;
use crate::session::{SessionState, SharedSession};
use crate::transport::{self, EVENT_CHANNEL_CAPACITY, TransportEvent, TransportHandle};
use crate::util::segment_bytes;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{RwLock, mpsc};
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

/// Most payload bytes carried by one outbound message line.
pub const MAX_PAYLOAD_BYTES: usize = 400;

/// Settings for a line protocol client.
#[derive(Debug, Clone)]
pub struct LineClientConfig {
    /// Connection name for logs.
    pub name: String,
    /// Servers tried in round-robin order.
    pub servers: Vec<ServerAddress>,
    /// Nickname registered with the server.
    pub nickname: String,
    /// Alternate nickname from configuration.
    pub alternate_nickname: Option<String>,
    /// Username sent in `USER`.
    pub username: String,
    /// Real name sent in `USER`.
    pub realname: String,
    /// Per-line payload limit.
    pub max_payload: usize,
}

impl LineClientConfig {
    /// Derive client settings from a connection entry.
    pub fn from_connection(config: &ConnectionConfig) -> ClientResult<Self> {
        let nickname = config
            .nickname
            .clone()
            .ok_or_else(|| ClientError::Config(format!("{}: nickname missing", config.name)))?;
        Ok(Self {
            name: config.name.clone(),
            servers: config.servers.clone(),
            username: config.username.clone().unwrap_or_else(|| nickname.clone()),
            realname: config
                .realname
                .clone()
                .unwrap_or_else(|| "switchboard".to_string()),
            alternate_nickname: config.alternate_nickname.clone(),
            nickname,
            max_payload: MAX_PAYLOAD_BYTES,
        })
    }
}

struct Inner {
    config: LineClientConfig,
    session: SharedSession,
    events: mpsc::Sender<ClientEvent>,
    transport: RwLock<Option<TransportHandle>>,
    modes: std::sync::RwLock<ModeTable>,
    next_server: AtomicUsize,
    quitting: AtomicBool,
}

/// IRC-style protocol client.
#[derive(Clone)]
pub struct LineClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineClient")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl LineClient {
    /// Create a client that reports to `events`.
    #[must_use]
    pub fn new(
        config: LineClientConfig,
        session: SharedSession,
        events: mpsc::Sender<ClientEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                session,
                events,
                transport: RwLock::new(None),
                modes: std::sync::RwLock::new(ModeTable::new()),
                next_server: AtomicUsize::new(0),
                quitting: AtomicBool::new(false),
            }),
        }
    }

    /// Run the protocol over an already-open stream instead of dialing.
    pub async fn connect_stream<S>(&self, stream: S) -> ClientResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if !self.inner.session.write().await.begin_connect() {
            return Err(ClientError::AlreadyConnecting);
        }
        self.inner.quitting.store(false, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = transport::from_stream(stream, tx);
        self.attach(handle, rx).await
    }

    /// Current per-network mode table.
    #[must_use]
    pub fn mode_table(&self) -> ModeTable {
        self.inner
            .modes
            .read()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn next_server(&self) -> Option<ServerAddress> {
        let servers = &self.inner.config.servers;
        if servers.is_empty() {
            return None;
        }
        let idx = self.inner.next_server.fetch_add(1, Ordering::Relaxed) % servers.len();
        Some(servers[idx].clone())
    }

    async fn attach(
        &self,
        handle: TransportHandle,
        rx: mpsc::Receiver<TransportEvent>,
    ) -> ClientResult<()> {
        let inner = &self.inner;
        *inner.transport.write().await = Some(handle.clone());
        {
            let mut session = inner.session.write().await;
            session.set_nickname(inner.config.nickname.clone());
            session.set_state(SessionState::Handshaking);
        }
        let _ = inner.events.send(ClientEvent::Connected).await;

        tokio::spawn(run(Arc::clone(inner), rx));
        Ok(())
    }

    /// Attach a freshly dialed socket and register, unless a quit arrived
    /// while dialing.
    async fn finish_dial(
        &self,
        handle: TransportHandle,
        rx: mpsc::Receiver<TransportEvent>,
        server: &ServerAddress,
    ) -> ClientResult<()> {
        let inner = &self.inner;
        if inner.quitting.swap(false, Ordering::SeqCst) {
            handle.shutdown();
            inner.session.write().await.reset();
            info!(network = %inner.config.name, "quit during connect");
            emit(
                inner,
                ClientEvent::Disconnected {
                    user_initiated: true,
                },
            )
            .await;
            return Ok(());
        }
        self.attach(handle, rx).await?;
        self.register(server).await
    }

    async fn register(&self, server: &ServerAddress) -> ClientResult<()> {
        let config = &self.inner.config;
        if let Some(ref password) = server.password {
            self.send_line(&Message::new("PASS", &[password], None)).await?;
        }
        self.send_line(&Message::new("NICK", &[&config.nickname], None))
            .await?;
        self.send_line(&Message::new(
            "USER",
            &[&config.username, "0", "*"],
            Some(&config.realname),
        ))
        .await
    }

    async fn send_line(&self, msg: &Message) -> ClientResult<()> {
        send_line(&self.inner, msg).await
    }

    async fn transport(&self) -> ClientResult<TransportHandle> {
        self.inner
            .transport
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)
    }
}

async fn send_line(inner: &Inner, msg: &Message) -> ClientResult<()> {
    let handle = inner
        .transport
        .read()
        .await
        .clone()
        .ok_or(ClientError::NotConnected)?;
    let mut line = msg.to_string().replace(['\r', '\n'], " ");
    trace!(network = %inner.config.name, %line, "send");
    line.push_str("\r\n");
    handle.send(line)?;
    Ok(())
}

/// Consume transport events for one connection.
async fn run(inner: Arc<Inner>, mut rx: mpsc::Receiver<TransportEvent>) {
    let mut codec = LineCodec::new();
    let mut buffer = BytesMut::new();
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Received(bytes) => {
                buffer.extend_from_slice(&bytes);
                loop {
                    match codec.decode(&mut buffer) {
                        Ok(Some(line)) => handle_line(&inner, &line).await,
                        Ok(None) => break,
                        Err(e) => warn!(network = %inner.config.name, error = %e, "dropping line"),
                    }
                }
            }
            TransportEvent::SendFailed(reason) => {
                warn!(network = %inner.config.name, %reason, "send failed");
            }
            TransportEvent::Disconnected => break,
            other => trace!(network = %inner.config.name, ?other, "transport event"),
        }
    }

    inner.transport.write().await.take();
    inner.session.write().await.reset();
    let user_initiated = inner.quitting.swap(false, Ordering::SeqCst);
    info!(network = %inner.config.name, user_initiated, "disconnected");
    let _ = inner
        .events
        .send(ClientEvent::Disconnected { user_initiated })
        .await;
}

async fn emit(inner: &Inner, event: ClientEvent) {
    let _ = inner.events.send(event).await;
}

async fn handle_line(inner: &Inner, line: &str) {
    let Some(msg) = Message::parse(line) else {
        debug!(network = %inner.config.name, %line, "dropping malformed line");
        return;
    };
    trace!(network = %inner.config.name, %line, "recv");

    match msg.command.as_str() {
        "001" => {
            let nickname = msg
                .arg(0)
                .map_or_else(|| inner.config.nickname.clone(), ToString::to_string);
            inner.session.write().await.mark_ready(nickname.clone());
            info!(network = %inner.config.name, %nickname, "registered");
            emit(inner, ClientEvent::Ready { nickname }).await;
        }
        "005" => {
            let mut table = match inner.modes.write() {
                Ok(table) => table,
                Err(poisoned) => poisoned.into_inner(),
            };
            for token in msg.params.iter().skip(1) {
                if table.apply_isupport(token) {
                    debug!(network = %inner.config.name, %token, "mode table updated");
                }
            }
        }
        "396" => {
            let host = msg.arg(1).unwrap_or_default().to_string();
            info!(network = %inner.config.name, %host, "host masked");
            emit(inner, ClientEvent::HostMasked { host }).await;
        }
        "433" => {
            // The nickname stays as configured; switching is not attempted.
            warn!(
                network = %inner.config.name,
                nickname = %inner.config.nickname,
                alternate = ?inner.config.alternate_nickname,
                "nickname already in use"
            );
        }
        "PING" => {
            let token = msg.args().next().unwrap_or_default().trim_start_matches(':');
            let pong = if token.is_empty() {
                Message::new("PONG", &[], None)
            } else {
                Message::new("PONG", &[token], None)
            };
            if let Err(e) = send_line(inner, &pong).await {
                warn!(network = %inner.config.name, error = %e, "failed to answer ping");
            }
        }
        "JOIN" | "PART" => handle_membership(inner, &msg).await,
        "NICK" => {
            let user = actor(&msg);
            if let Some(new_nick) = msg.arg(0) {
                let mut session = inner.session.write().await;
                if session.is_self(&user.nickname) {
                    session.set_nickname(new_nick);
                }
            }
        }
        "MODE" => handle_mode(inner, &msg).await,
        "PRIVMSG" | "NOTICE" => handle_chat(inner, &msg).await,
        "QUIT" => {
            emit(
                inner,
                ClientEvent::Quit {
                    user: actor(&msg),
                    reason: msg.trailing.clone(),
                },
            )
            .await;
        }
        "ERROR" => {
            warn!(network = %inner.config.name, reason = ?msg.trailing, "server error");
        }
        _ => {}
    }
}

fn actor(msg: &Message) -> UserIdentity {
    msg.prefix
        .as_deref()
        .map(UserIdentity::parse_prefix)
        .unwrap_or_default()
}

async fn handle_membership(inner: &Inner, msg: &Message) {
    let Some(channel) = msg.arg(0).map(ToString::to_string) else {
        debug!(network = %inner.config.name, command = %msg.command, "missing channel");
        return;
    };
    let user = actor(msg);
    let joining = msg.command == "JOIN";
    let is_self = {
        let mut session = inner.session.write().await;
        let is_self = session.is_self(&user.nickname);
        if is_self {
            if joining {
                session.join(&channel);
            } else {
                session.part(&channel);
            }
        }
        is_self
    };

    let event = if joining {
        ClientEvent::Joined {
            channel,
            user,
            is_self,
        }
    } else {
        ClientEvent::Parted {
            channel,
            user,
            is_self,
        }
    };
    emit(inner, event).await;
}

async fn handle_mode(inner: &Inner, msg: &Message) {
    let mut args = msg.args();
    let (Some(target), Some(modes)) = (args.next(), args.next()) else {
        return;
    };
    let rest: Vec<&str> = args.collect();

    if is_channel(target) {
        let (added, removed) = match inner.modes.read() {
            Ok(table) => table.parse_channel_modes(modes, &rest),
            Err(poisoned) => poisoned.into_inner().parse_channel_modes(modes, &rest),
        };
        inner
            .session
            .write()
            .await
            .apply_channel_modes(target, &added, &removed);
        emit(
            inner,
            ClientEvent::ChannelModeChanged {
                channel: target.to_string(),
                added,
                removed,
            },
        )
        .await;
    } else {
        let (added, removed) = parse_user_modes(modes);
        emit(
            inner,
            ClientEvent::UserModeChanged {
                target: target.to_string(),
                added,
                removed,
            },
        )
        .await;
    }
}

async fn handle_chat(inner: &Inner, msg: &Message) {
    let (Some(target), Some(text)) = (msg.arg(0), msg.arg(1)) else {
        debug!(network = %inner.config.name, "message without target or text");
        return;
    };
    let sender = actor(msg);
    let is_owned = inner.session.read().await.is_self(&sender.nickname);

    let (reply_to, source_type) = if is_channel(target) {
        (target.to_string(), SourceType::ChannelOrGroup)
    } else {
        (sender.nickname.clone(), SourceType::Message)
    };

    emit(
        inner,
        ClientEvent::Message(ChatMessage {
            target: reply_to,
            source_type,
            sender,
            text: text.to_string(),
            is_owned,
            is_notice: msg.command == "NOTICE",
        }),
    )
    .await;
}

/// Build the wire lines for one outbound message.
///
/// Each input line is cut into `max_payload`-byte segments.
#[must_use]
pub fn build_message_lines(target: &str, text: &str, max_payload: usize) -> Vec<Vec<u8>> {
    let head = format!("PRIVMSG {target} :");
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty())
        .flat_map(|line| segment_bytes(line.as_bytes(), max_payload))
        .map(|segment| {
            let mut out = Vec::with_capacity(head.len() + segment.len() + 2);
            out.extend_from_slice(head.as_bytes());
            out.extend_from_slice(segment);
            out.extend_from_slice(b"\r\n");
            out
        })
        .collect()
}

#[async_trait]
impl ProtocolClient for LineClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Line
    }

    fn session(&self) -> &SharedSession {
        &self.inner.session
    }

    async fn connect(&self) -> ClientResult<()> {
        if !self.inner.session.write().await.begin_connect() {
            return Err(ClientError::AlreadyConnecting);
        }
        let Some(server) = self.next_server() else {
            self.inner.session.write().await.reset();
            return Err(ClientError::Config("no servers configured".into()));
        };

        self.inner.quitting.store(false, Ordering::SeqCst);
        info!(network = %self.inner.config.name, host = %server.host, port = server.port, "connecting");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = match transport::connect_tcp(&server.host, server.port, tx).await {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.session.write().await.reset();
                return Err(e.into());
            }
        };
        self.finish_dial(handle, rx, &server).await
    }

    async fn send_message(&self, target: &str, text: &str) -> ClientResult<()> {
        let handle = self.transport().await?;
        for line in build_message_lines(target, text, self.inner.config.max_payload) {
            handle.send(line)?;
        }
        Ok(())
    }

    async fn quit(&self, reason: Option<&str>) -> ClientResult<()> {
        // Set first so a dial still in flight sees it.
        self.inner.quitting.store(true, Ordering::SeqCst);
        let Ok(handle) = self.transport().await else {
            return Ok(());
        };
        let _ = handle.send(format!("{}\r\n", Message::new("QUIT", &[], reason)));
        handle.shutdown();
        Ok(())
    }

    async fn join(&self, channel: &str) -> ClientResult<()> {
        self.send_line(&Message::new("JOIN", &[channel], None)).await
    }

    async fn set_user_mode(&self, mode: &str) -> ClientResult<()> {
        let nickname = self
            .inner
            .session
            .read()
            .await
            .nickname()
            .map_or_else(|| self.inner.config.nickname.clone(), ToString::to_string);
        self.send_line(&Message::new("MODE", &[&nickname, mode], None))
            .await
    }

    async fn send_raw(&self, line: &str) -> ClientResult<()> {
        let msg = Message::parse(line)
            .ok_or_else(|| crate::error::ProtocolError::MalformedLine(line.to_string()))?;
        self.send_line(&msg).await
    }
}
