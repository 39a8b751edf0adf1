//! Bot adapter: one per configured connection.
//!
//! The adapter binds a protocol client to its connection settings. It
//! consumes the client's [`ClientEvent`]s, runs the post-connect sequence
//! (user mode, network login, channel joins), turns command-token messages
//! into [`Command`]s for the dispatcher queue, delivers responses back
//! through the client, and reconnects after unsolicited disconnects.

use crate::command::{Command, ResponseSink, Source};
use crate::config::{ConnectionConfig, Credentials, JoinPolicy, ProtocolKind};
use crate::error::{ClientError, ClientResult};
use crate::events::{ChatMessage, ClientEvent};
use crate::protocol::gateway::GatewayClientConfig;
use crate::protocol::line::LineClientConfig;
use crate::protocol::rtm::RtmClientConfig;
use crate::protocol::{GatewayClient, LineClient, ProtocolClient, RtmClient};
use crate::queue::CommandQueue;
use crate::session::{NetworkSession, SessionState};
use crate::util::truncate_str;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the client-to-adapter event channel.
pub const CLIENT_EVENT_CAPACITY: usize = 256;

/// Network-specific login sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginSequence {
    /// `AUTH` to Q.
    QuakeNet,
    /// `LOGIN` to X.
    Undernet,
    /// `AUTH` to AuthServ.
    GameSurge,
    /// `IDENTIFY` to NickServ.
    NickServ,
}

impl LoginSequence {
    /// Pick the sequence for a network identity, case-insensitively.
    #[must_use]
    pub fn for_network(network: Option<&str>) -> Self {
        match network.map(str::to_ascii_lowercase).as_deref() {
            Some("quakenet") => Self::QuakeNet,
            Some("undernet") => Self::Undernet,
            Some("gamesurge") => Self::GameSurge,
            _ => Self::NickServ,
        }
    }

    /// Service the login is addressed to.
    #[must_use]
    pub const fn service(self) -> &'static str {
        match self {
            Self::QuakeNet => "Q@CServe.quakenet.org",
            Self::Undernet => "x@channels.undernet.org",
            Self::GameSurge => "AuthServ@Services.GameSurge.net",
            Self::NickServ => "NickServ",
        }
    }

    /// Protocol line performing the login.
    #[must_use]
    pub fn line(self, credentials: &Credentials) -> String {
        let verb = match self {
            Self::QuakeNet | Self::GameSurge => "AUTH",
            Self::Undernet => "LOGIN",
            Self::NickServ => "IDENTIFY",
        };
        format!(
            "PRIVMSG {} :{verb} {} {}",
            self.service(),
            credentials.account,
            credentials.password
        )
    }
}

/// Adapter status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    /// Connection name.
    pub name: String,
    /// Protocol spoken.
    pub protocol: ProtocolKind,
    /// Session state, debug-formatted.
    pub state: String,
    /// Current nickname.
    pub nickname: Option<String>,
    /// Channels this bot has joined.
    pub channels: Vec<String>,
    /// Commands queued from this connection.
    pub commands_received: u64,
    /// Responses delivered.
    pub responses_sent: u64,
    /// Most recent error.
    pub last_error: Option<String>,
    /// Whether the session is ready and no error is pending.
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct AdapterStats {
    commands_received: u64,
    responses_sent: u64,
    last_error: Option<String>,
}

/// Per-connection bot adapter.
pub struct BotAdapter {
    config: ConnectionConfig,
    client: Arc<dyn ProtocolClient>,
    queue: Arc<CommandQueue>,
    stats: RwLock<AdapterStats>,
    events: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    reconnecting: AtomicBool,
    joined: AtomicBool,
    this: Weak<Self>,
}

impl std::fmt::Debug for BotAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotAdapter")
            .field("name", &self.config.name)
            .field("protocol", &self.config.protocol)
            .finish_non_exhaustive()
    }
}

impl BotAdapter {
    /// Build the protocol client named by `config.protocol` and bind it.
    pub fn from_config(config: ConnectionConfig, queue: Arc<CommandQueue>) -> ClientResult<Arc<Self>> {
        let (tx, rx) = mpsc::channel(CLIENT_EVENT_CAPACITY);
        let session = NetworkSession::shared();
        let client: Arc<dyn ProtocolClient> = match config.protocol {
            ProtocolKind::Line => Arc::new(LineClient::new(
                LineClientConfig::from_connection(&config)?,
                session,
                tx,
            )),
            ProtocolKind::Gateway => Arc::new(GatewayClient::new(
                GatewayClientConfig::from_connection(&config)?,
                session,
                tx,
            )),
            ProtocolKind::Rtm => Arc::new(RtmClient::new(
                RtmClientConfig::from_connection(&config)?,
                session,
                tx,
            )),
        };
        Ok(Self::new(config, client, rx, queue))
    }

    /// Bind an existing client whose events arrive on `events`.
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        client: Arc<dyn ProtocolClient>,
        events: mpsc::Receiver<ClientEvent>,
        queue: Arc<CommandQueue>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            client,
            queue,
            stats: RwLock::new(AdapterStats::default()),
            events: Mutex::new(Some(events)),
            event_task: Mutex::new(None),
            running: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            joined: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Connection settings.
    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The bound protocol client.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    /// Start consuming client events and connect.
    ///
    /// A failed first connect is recorded and handed to the reconnect loop.
    pub async fn start(&self) -> ClientResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let events = self.events.lock().ok().and_then(|mut e| e.take());
        if let Some(events) = events {
            let task = tokio::spawn(event_loop(self.this.clone(), events));
            if let Ok(mut slot) = self.event_task.lock() {
                *slot = Some(task);
            }
        }

        info!(network = %self.config.name, protocol = %self.config.protocol, "starting adapter");
        match self.client.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_error(format!("connect failed: {e}")).await;
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Quit the network and stop reconnecting.
    pub async fn stop(&self) -> ClientResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(network = %self.config.name, "stopping adapter");
        self.client.quit(Some("shutting down")).await
    }

    /// Whether the adapter is started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current status.
    pub async fn status(&self) -> AdapterStatus {
        let (state, nickname, channels) = {
            let session = self.client.session().read().await;
            (
                session.state(),
                session.nickname().map(ToString::to_string),
                session.channels().iter().cloned().collect(),
            )
        };
        let stats = self.stats.read().await;
        AdapterStatus {
            name: self.config.name.clone(),
            protocol: self.config.protocol,
            state: format!("{state:?}"),
            nickname,
            channels,
            commands_received: stats.commands_received,
            responses_sent: stats.responses_sent,
            last_error: stats.last_error.clone(),
            healthy: state == SessionState::Ready && stats.last_error.is_none(),
        }
    }

    async fn record_error(&self, error: impl Into<String>) {
        let error = error.into();
        error!(network = %self.config.name, %error, "adapter error");
        self.stats.write().await.last_error = Some(error);
    }

    async fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Connected => {
                self.joined.store(false, Ordering::SeqCst);
                debug!(network = %self.config.name, "transport connected");
            }
            ClientEvent::Ready { nickname } => {
                self.stats.write().await.last_error = None;
                info!(network = %self.config.name, %nickname, "session ready");
                self.on_ready().await;
            }
            ClientEvent::HostMasked { host } => {
                debug!(network = %self.config.name, %host, "host masked");
                if self.config.join_policy == JoinPolicy::AfterHostMasked {
                    self.join_channels().await;
                }
            }
            ClientEvent::Message(msg) => self.on_message(msg).await,
            ClientEvent::Disconnected { user_initiated } => {
                if user_initiated || !self.is_running() {
                    info!(network = %self.config.name, "disconnected on request");
                } else {
                    warn!(network = %self.config.name, "connection lost");
                    self.schedule_reconnect();
                }
            }
            other => trace!(network = %self.config.name, ?other, "client event"),
        }
    }

    async fn on_ready(&self) {
        if let Some(ref mode) = self.config.user_mode {
            self.optional(self.client.set_user_mode(mode).await, "user mode").await;
        }
        if let Some(ref credentials) = self.config.credentials {
            let login = LoginSequence::for_network(self.config.network.as_deref());
            debug!(network = %self.config.name, service = login.service(), "logging in");
            let sent = self.client.send_raw(&login.line(credentials)).await;
            if sent.is_ok() {
                let mut session = self.client.session().write().await;
                session.set_authenticated(true);
            }
            self.optional(sent, "login").await;
        }
        if self.config.join_policy == JoinPolicy::Immediate {
            self.join_channels().await;
        }
    }

    async fn join_channels(&self) {
        if self.joined.swap(true, Ordering::SeqCst) {
            return;
        }
        for channel in &self.config.channels {
            let result = self.client.join(channel).await;
            self.optional(result, "join").await;
        }
    }

    async fn optional(&self, result: ClientResult<()>, what: &str) {
        match result {
            Ok(()) => {}
            Err(ClientError::Unsupported(op)) => {
                debug!(network = %self.config.name, op, "{what} skipped");
            }
            Err(e) => self.record_error(format!("{what} failed: {e}")).await,
        }
    }

    async fn on_message(&self, msg: ChatMessage) {
        if msg.is_owned {
            return;
        }
        let Some(request) = msg.text.strip_prefix(self.config.command_token.as_str()) else {
            return;
        };
        let request = request.trim();
        if request.is_empty() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let origin: Arc<dyn ResponseSink> = this;
        let source = Source::new(msg.target, msg.source_type);
        let cmd = Command::from_user(request, source, msg.sender, &origin);
        debug!(
            network = %self.config.name,
            id = %cmd.id,
            request = %truncate_str(&cmd.request, 80),
            "command received"
        );

        match self.queue.enqueue(cmd) {
            Ok(()) => self.stats.write().await.commands_received += 1,
            Err(e) => warn!(network = %self.config.name, error = %e, "command rejected"),
        }
    }

    fn schedule_reconnect(&self) {
        if !self.is_running() {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(network = %self.config.name, "reconnect already scheduled");
            return;
        }
        let delay = self.config.reconnect_delay();
        let weak = self.this.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                let Some(adapter) = weak.upgrade() else { return };
                if !adapter.is_running() {
                    adapter.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                info!(network = %adapter.config.name, "reconnecting");
                match adapter.client.connect().await {
                    Ok(()) | Err(ClientError::AlreadyConnecting) => {
                        adapter.reconnecting.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        adapter
                            .record_error(format!("reconnect failed: {e}"))
                            .await;
                    }
                }
            }
        });
    }
}

async fn event_loop(adapter: Weak<BotAdapter>, mut events: mpsc::Receiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        let Some(adapter) = adapter.upgrade() else {
            break;
        };
        adapter.handle_event(event).await;
    }
}

#[async_trait]
impl ResponseSink for BotAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn queue_response(&self, cmd: Command) {
        let Some(response) = cmd.response.filter(|r| !r.is_empty()) else {
            return;
        };
        match self
            .client
            .send_message(&cmd.source.identifier, &response)
            .await
        {
            Ok(()) => self.stats.write().await.responses_sent += 1,
            Err(e) => {
                self.record_error(format!("response to {} failed: {e}", cmd.source.identifier))
                    .await;
            }
        }
    }
}

impl Drop for BotAdapter {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{SourceType, UserIdentity};
    use crate::session::SharedSession;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorded {
        sent: Vec<(String, String)>,
        raw: Vec<String>,
        joins: Vec<String>,
        connects: usize,
    }

    struct FakeClient {
        session: SharedSession,
        log: Arc<StdMutex<Recorded>>,
    }

    #[async_trait]
    impl ProtocolClient for FakeClient {
        fn kind(&self) -> ProtocolKind {
            ProtocolKind::Line
        }

        fn session(&self) -> &SharedSession {
            &self.session
        }

        async fn connect(&self) -> ClientResult<()> {
            if !self.session.write().await.begin_connect() {
                return Err(ClientError::AlreadyConnecting);
            }
            self.log.lock().unwrap().connects += 1;
            Ok(())
        }

        async fn send_message(&self, target: &str, text: &str) -> ClientResult<()> {
            self.log.lock().unwrap().sent.push((target.into(), text.into()));
            Ok(())
        }

        async fn quit(&self, _reason: Option<&str>) -> ClientResult<()> {
            Ok(())
        }

        async fn join(&self, channel: &str) -> ClientResult<()> {
            self.log.lock().unwrap().joins.push(channel.into());
            Ok(())
        }

        async fn send_raw(&self, line: &str) -> ClientResult<()> {
            self.log.lock().unwrap().raw.push(line.into());
            Ok(())
        }
    }

    fn adapter(config: ConnectionConfig) -> (Arc<BotAdapter>, Arc<CommandQueue>, Arc<StdMutex<Recorded>>) {
        let log = Arc::new(StdMutex::new(Recorded::default()));
        let client = Arc::new(FakeClient {
            session: NetworkSession::shared(),
            log: Arc::clone(&log),
        });
        let queue = Arc::new(CommandQueue::new());
        let (_tx, rx) = mpsc::channel(4);
        let adapter = BotAdapter::new(config, client, rx, Arc::clone(&queue));
        (adapter, queue, log)
    }

    fn line_config() -> ConnectionConfig {
        ConnectionConfig::new("net", ProtocolKind::Line)
            .server("irc.example.org", 6667)
            .nickname("bot")
            .channel("#a")
            .channel("#b")
    }

    fn chat(text: &str, is_owned: bool) -> ChatMessage {
        ChatMessage {
            target: "#a".into(),
            source_type: SourceType::ChannelOrGroup,
            sender: UserIdentity::nick("alice"),
            text: text.into(),
            is_owned,
            is_notice: false,
        }
    }

    #[test]
    fn test_login_sequences() {
        let creds = Credentials {
            account: "acct".into(),
            password: "pw".into(),
        };
        assert_eq!(
            LoginSequence::for_network(Some("QuakeNet")).line(&creds),
            "PRIVMSG Q@CServe.quakenet.org :AUTH acct pw"
        );
        assert_eq!(
            LoginSequence::for_network(Some("undernet")).line(&creds),
            "PRIVMSG x@channels.undernet.org :LOGIN acct pw"
        );
        assert_eq!(LoginSequence::for_network(Some("GameSurge")), LoginSequence::GameSurge);
        assert_eq!(
            LoginSequence::for_network(None).line(&creds),
            "PRIVMSG NickServ :IDENTIFY acct pw"
        );
    }

    #[tokio::test]
    async fn test_command_token_filter() {
        let (adapter, queue, _log) = adapter(line_config());

        adapter.handle_event(ClientEvent::Message(chat("hello", false))).await;
        adapter.handle_event(ClientEvent::Message(chat("!", false))).await;
        adapter.handle_event(ClientEvent::Message(chat("!echo mine", true))).await;
        assert!(queue.is_empty());

        adapter.handle_event(ClientEvent::Message(chat("!echo hi there", false))).await;
        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].request, "echo hi there");
        assert_eq!(drained[0].source.identifier, "#a");
        assert_eq!(drained[0].origin().map(|o| o.name().to_string()).as_deref(), Some("net"));
        assert_eq!(adapter.status().await.commands_received, 1);
    }

    #[tokio::test]
    async fn test_ready_logs_in_then_joins() {
        let mut config = line_config();
        config.network = Some("quakenet".into());
        config.credentials = Some(Credentials {
            account: "acct".into(),
            password: "pw".into(),
        });
        let (adapter, _queue, log) = adapter(config);

        adapter.handle_event(ClientEvent::Ready { nickname: "bot".into() }).await;
        {
            let log = log.lock().unwrap();
            assert_eq!(log.raw, vec!["PRIVMSG Q@CServe.quakenet.org :AUTH acct pw"]);
            assert_eq!(log.joins, vec!["#a", "#b"]);
        }
        assert!(adapter.client().session().read().await.is_authenticated());
    }

    #[tokio::test]
    async fn test_join_deferred_until_host_masked() {
        let mut config = line_config();
        config.join_policy = JoinPolicy::AfterHostMasked;
        let (adapter, _queue, log) = adapter(config);

        adapter.handle_event(ClientEvent::Ready { nickname: "bot".into() }).await;
        assert!(log.lock().unwrap().joins.is_empty());

        adapter.handle_event(ClientEvent::HostMasked { host: "bot.users.example".into() }).await;
        adapter.handle_event(ClientEvent::HostMasked { host: "again".into() }).await;
        assert_eq!(log.lock().unwrap().joins, vec!["#a", "#b"]);
    }

    #[tokio::test]
    async fn test_queue_response_skips_empty() {
        let (adapter, _queue, log) = adapter(line_config());
        let source = Source::new("#a", SourceType::ChannelOrGroup);

        adapter.queue_response(Command::detached("x", source.clone())).await;
        adapter
            .queue_response(Command::detached("x", source.clone()).with_response(""))
            .await;
        adapter
            .queue_response(Command::detached("x", source).with_response("pong"))
            .await;

        assert_eq!(log.lock().unwrap().sent, vec![("#a".to_string(), "pong".to_string())]);
        assert_eq!(adapter.status().await.responses_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_only_after_unsolicited_disconnect() {
        let mut config = line_config();
        config.reconnect_delay_secs = 1;
        let (adapter, _queue, log) = adapter(config);
        adapter.start().await.unwrap();
        assert_eq!(log.lock().unwrap().connects, 1);

        adapter.client().session().write().await.reset();
        adapter
            .handle_event(ClientEvent::Disconnected { user_initiated: true })
            .await;
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert_eq!(log.lock().unwrap().connects, 1);

        // two triggers inside one delay window still reconnect once
        adapter
            .handle_event(ClientEvent::Disconnected { user_initiated: false })
            .await;
        adapter
            .handle_event(ClientEvent::Disconnected { user_initiated: false })
            .await;
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert_eq!(log.lock().unwrap().connects, 2);
    }
}
