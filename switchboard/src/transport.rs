//! Async duplex transports.
//!
//! A transport owns one socket and two pump tasks. The receive pump re-arms
//! a read after every successful read until shutdown; the send pump drains
//! an ordered queue of outgoing frames. Both report through a
//! [`TransportEvent`] channel so the protocol client above never blocks on
//! the socket.
//!
//! Two socket kinds share the same handle and event contract:
//! - byte streams ([`connect_tcp`], [`from_stream`]) for the line protocol
//! - websockets ([`connect_websocket`]) where each frame is one receive

use crate::error::{TransportError, TransportResult};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};

/// Size of a single read from a byte stream.
const READ_BUFFER_SIZE: usize = 4096;

/// Default capacity for transport event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is connected.
    Connected,
    /// The connect attempt failed.
    ConnectFailed(String),
    /// Bytes (or one websocket frame) arrived.
    Received(Vec<u8>),
    /// A queued frame was written.
    Sent(usize),
    /// A queued frame could not be written.
    SendFailed(String),
    /// The socket is gone. Raised exactly once per transport.
    Disconnected,
}

#[derive(Debug)]
enum Outgoing {
    Data(Vec<u8>),
    Shutdown,
}

#[derive(Debug)]
struct Shared {
    events: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    async fn emit(&self, event: TransportEvent) {
        // The consumer going away only means nobody cares any more.
        let _ = self.events.send(event).await;
    }

    /// Raise `Disconnected` once and stop both pumps.
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.send(true);
            self.emit(TransportEvent::Disconnected).await;
        }
    }
}

/// Cloneable handle for writing to and shutting down a transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<Outgoing>,
    shared: Arc<Shared>,
}

impl TransportHandle {
    /// Queue a frame for sending. Frames go out in call order.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(Outgoing::Data(data.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Flush queued frames, then shut the socket down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Outgoing::Shutdown);
    }

    /// Whether the transport has raised `Disconnected`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

fn new_shared(events: mpsc::Sender<TransportEvent>) -> (Arc<Shared>, watch::Receiver<bool>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        events,
        closed: AtomicBool::new(false),
        stop_tx,
    });
    (shared, stop_rx)
}

/// Next queued frame, or `None` once the transport is stopping.
async fn next_outgoing(
    rx: &mut mpsc::UnboundedReceiver<Outgoing>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Option<Outgoing> {
    if *stop_rx.borrow() {
        return None;
    }
    tokio::select! {
        item = rx.recv() => item,
        _ = stop_rx.changed() => None,
    }
}

/// Open a TCP connection to `host:port`.
///
/// Raises `Connected` or `ConnectFailed` on `events` before returning.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    events: mpsc::Sender<TransportEvent>,
) -> TransportResult<TransportHandle> {
    let addr = format!("{host}:{port}");
    debug!(%addr, "connecting");
    match TcpStream::connect(&addr).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            let _ = events.send(TransportEvent::Connected).await;
            Ok(from_stream(stream, events))
        }
        Err(e) => {
            let reason = e.to_string();
            let _ = events.send(TransportEvent::ConnectFailed(reason.clone())).await;
            Err(TransportError::ConnectFailed { addr, reason })
        }
    }
}

/// Wrap an already-connected byte stream.
pub fn from_stream<S>(stream: S, events: mpsc::Sender<TransportEvent>) -> TransportHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (shared, stop_rx) = new_shared(events);
    let (tx, rx) = mpsc::unbounded_channel();
    let (reader, writer) = tokio::io::split(stream);

    tokio::spawn(stream_receive_pump(reader, Arc::clone(&shared), stop_rx));
    tokio::spawn(stream_send_pump(
        writer,
        Arc::clone(&shared),
        rx,
        shared.stop_tx.subscribe(),
    ));

    TransportHandle { tx, shared }
}

async fn stream_receive_pump<R>(mut reader: R, shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("remote closed the stream");
                    break;
                }
                Ok(n) => {
                    trace!(bytes = n, "received");
                    shared.emit(TransportEvent::Received(buf[..n].to_vec())).await;
                }
                Err(e) => {
                    warn!(error = %TransportError::ReceiveFailed(e.to_string()), "read failed");
                    break;
                }
            },
            _ = stop_rx.changed() => break,
        }
    }
    shared.close().await;
}

async fn stream_send_pump<W>(
    mut writer: W,
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    mut stop_rx: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = next_outgoing(&mut rx, &mut stop_rx).await {
        match item {
            Outgoing::Data(data) => {
                let written = async {
                    writer.write_all(&data).await?;
                    writer.flush().await
                }
                .await;
                match written {
                    Ok(()) => shared.emit(TransportEvent::Sent(data.len())).await,
                    Err(e) => {
                        warn!(error = %e, "write failed");
                        shared.emit(TransportEvent::SendFailed(e.to_string())).await;
                        break;
                    }
                }
            }
            Outgoing::Shutdown => {
                let _ = writer.shutdown().await;
                debug!("stream shut down");
                break;
            }
        }
    }
    shared.close().await;
}

/// Open a websocket to `url`.
///
/// Raises `Connected` or `ConnectFailed` on `events` before returning.
pub async fn connect_websocket(
    url: &str,
    events: mpsc::Sender<TransportEvent>,
) -> TransportResult<TransportHandle> {
    debug!(%url, "opening websocket");
    let socket = match tokio_tungstenite::connect_async(url).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            let reason = e.to_string();
            let _ = events.send(TransportEvent::ConnectFailed(reason.clone())).await;
            return Err(TransportError::ConnectFailed {
                addr: url.to_string(),
                reason,
            });
        }
    };
    let _ = events.send(TransportEvent::Connected).await;

    let (shared, mut stop_rx) = new_shared(events);
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    let (mut sink, mut stream) = socket.split();

    let recv_shared = Arc::clone(&shared);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        recv_shared.emit(TransportEvent::Received(text.into_bytes())).await;
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        recv_shared.emit(TransportEvent::Received(data)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(?frame, "websocket closed by remote");
                        break;
                    }
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read failed");
                        break;
                    }
                    None => break,
                },
                _ = stop_rx.changed() => break,
            }
        }
        recv_shared.close().await;
    });

    let send_shared = Arc::clone(&shared);
    let mut send_stop = shared.stop_tx.subscribe();
    tokio::spawn(async move {
        while let Some(item) = next_outgoing(&mut rx, &mut send_stop).await {
            match item {
                Outgoing::Data(data) => {
                    let len = data.len();
                    let text = String::from_utf8_lossy(&data).into_owned();
                    match sink.send(WsMessage::Text(text)).await {
                        Ok(()) => send_shared.emit(TransportEvent::Sent(len)).await,
                        Err(e) => {
                            warn!(error = %e, "websocket write failed");
                            send_shared
                                .emit(TransportEvent::SendFailed(e.to_string()))
                                .await;
                            break;
                        }
                    }
                }
                Outgoing::Shutdown => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                    debug!("websocket shut down");
                    break;
                }
            }
        }
        send_shared.close().await;
    });

    Ok(TransportHandle { tx, shared })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_receive_pump_rearms() {
        let (client, mut server) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = from_stream(client, tx);

        server.write_all(b"one").await.unwrap();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Received(b"one".to_vec()));
        server.write_all(b"two").await.unwrap();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Received(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_zero_length_read_disconnects_once() {
        let (client, server) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = from_stream(client, tx);

        drop(server);
        assert_eq!(next_event(&mut rx).await, TransportEvent::Disconnected);
        assert!(handle.is_closed());
        assert!(matches!(handle.send("late"), Err(TransportError::Closed)));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .map_or(true, |e| e != Some(TransportEvent::Disconnected))
        );
    }

    #[tokio::test]
    async fn test_send_order_and_shutdown() {
        let (client, mut server) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = from_stream(client, tx);

        handle.send("a").unwrap();
        handle.send("b").unwrap();
        handle.shutdown();

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ab");

        let mut saw_disconnect = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
        {
            if event == TransportEvent::Disconnected {
                saw_disconnect = true;
                break;
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_event() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(4);
        let result = connect_tcp("127.0.0.1", port, tx).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::ConnectFailed(_)));
    }
}
