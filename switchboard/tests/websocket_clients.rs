//! Gateway and RTM clients against a local websocket server.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use switchboard::events::{ClientEvent, SourceType};
use switchboard::protocol::ProtocolClient;
use switchboard::protocol::gateway::{GatewayClient, GatewayClientConfig, opcode};
use switchboard::protocol::rtm::{RtmClient, RtmClientConfig};
use switchboard::session::{NetworkSession, SessionState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_async};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Socket = WebSocketStream<TcpStream>;

/// Accept websocket connections on a random port and hand them out in order.
async fn ws_server() -> (String, mpsc::Receiver<Socket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(socket) = accept_async(stream).await else {
                continue;
            };
            if tx.send(socket).await.is_err() {
                break;
            }
        }
    });
    (url, rx)
}

async fn accept(sockets: &mut mpsc::Receiver<Socket>) -> Socket {
    tokio::time::timeout(Duration::from_secs(2), sockets.recv())
        .await
        .expect("no connection")
        .expect("listener gone")
}

async fn send_json(socket: &mut Socket, value: &Value) {
    socket
        .send(WsMessage::Text(value.to_string()))
        .await
        .unwrap();
}

async fn recv_json(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("frame timed out")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event timed out")
        .expect("event channel closed")
}

fn gateway(url: &str, api_base: &str) -> (GatewayClient, mpsc::Receiver<ClientEvent>) {
    let mut config = GatewayClientConfig::new("guild", "secret");
    config.gateway_url = Some(url.to_string());
    config.api_base = api_base.to_string();
    let (tx, rx) = mpsc::channel(32);
    (GatewayClient::new(config, NetworkSession::shared(), tx), rx)
}

#[tokio::test]
async fn test_gateway_identify_and_heartbeat_sequence() {
    let (url, mut sockets) = ws_server().await;
    let (client, mut events) = gateway(&url, "http://127.0.0.1:9");

    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    let mut socket = accept(&mut sockets).await;

    send_json(&mut socket, &json!({"op": opcode::HELLO, "d": {"heartbeat_interval": 100}})).await;
    let identify = recv_json(&mut socket).await;
    assert_eq!(identify["op"], opcode::IDENTIFY);
    assert_eq!(identify["d"]["token"], "secret");

    send_json(
        &mut socket,
        &json!({
            "op": opcode::DISPATCH,
            "s": 5,
            "t": "READY",
            "d": {"user": {"id": "42", "username": "switchboard"}}
        }),
    )
    .await;
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Ready {
            nickname: "switchboard".into()
        }
    );
    assert_eq!(client.self_id().as_deref(), Some("42"));
    assert_eq!(client.session().read().await.state(), SessionState::Ready);

    // A heartbeat raced ahead of READY may still carry null.
    let beat = loop {
        let frame = recv_json(&mut socket).await;
        assert_eq!(frame["op"], opcode::HEARTBEAT);
        if !frame["d"].is_null() {
            break frame;
        }
    };
    assert_eq!(beat["d"], 5);
}

#[tokio::test]
async fn test_gateway_message_routing_and_owned_filter() {
    let (url, mut sockets) = ws_server().await;
    let (client, mut events) = gateway(&url, "http://127.0.0.1:9");
    client.connect().await.unwrap();
    next_event(&mut events).await;
    let mut socket = accept(&mut sockets).await;

    send_json(
        &mut socket,
        &json!({"op": 0, "s": 1, "t": "READY", "d": {"user": {"id": "42", "username": "bot"}}}),
    )
    .await;
    next_event(&mut events).await;

    send_json(
        &mut socket,
        &json!({"op": 0, "s": 2, "t": "MESSAGE_CREATE", "d": {
            "channel_id": "c1", "guild_id": "g1", "content": "!ping",
            "author": {"id": "7", "username": "alice"}
        }}),
    )
    .await;
    let ClientEvent::Message(msg) = next_event(&mut events).await else {
        panic!("expected a message");
    };
    assert_eq!(msg.target, "c1");
    assert_eq!(msg.source_type, SourceType::ChannelOrGroup);
    assert_eq!(msg.sender.nickname, "alice");
    assert!(!msg.is_owned);

    send_json(
        &mut socket,
        &json!({"op": 0, "s": 3, "t": "MESSAGE_CREATE", "d": {
            "channel_id": "d1", "content": "pong",
            "author": {"id": "42", "username": "bot"}
        }}),
    )
    .await;
    let ClientEvent::Message(own) = next_event(&mut events).await else {
        panic!("expected a message");
    };
    assert_eq!(own.source_type, SourceType::Message);
    assert!(own.is_owned);
}

#[tokio::test]
async fn test_gateway_send_message_posts_chunks() {
    let api = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/channels/c1/messages"))
        .and(header("Authorization", "Bot secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1"})))
        .expect(2)
        .mount(&api)
        .await;

    let (client, _events) = gateway("ws://127.0.0.1:9", &api.uri());
    let text = "y".repeat(2500);
    client.send_message("c1", &text).await.unwrap();
}

#[tokio::test]
async fn test_gateway_quit_during_endpoint_lookup() {
    let (url, mut sockets) = ws_server().await;
    let api = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gateway/bot"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"url": url, "shards": 1}))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&api)
        .await;

    let mut config = GatewayClientConfig::new("guild", "secret");
    config.api_base = api.uri();
    let (tx, mut events) = mpsc::channel(32);
    let client = GatewayClient::new(config, NetworkSession::shared(), tx);

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.quit(None).await.unwrap();
    connecting.await.unwrap().unwrap();

    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Disconnected {
            user_initiated: true
        }
    );
    assert_eq!(
        client.session().read().await.state(),
        SessionState::Disconnected
    );
    if let Ok(Some(socket)) = tokio::time::timeout(Duration::from_millis(500), sockets.recv()).await {
        assert_socket_ends(socket).await;
    }
}

/// The peer closes `socket` soon.
async fn assert_socket_ends(mut socket: Socket) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(Ok(frame)) = socket.next().await {
            if frame.is_close() {
                break;
            }
        }
    })
    .await
    .expect("socket left open after quit");
}

#[tokio::test]
async fn test_gateway_quit_is_user_initiated() {
    let (url, mut sockets) = ws_server().await;
    let (client, mut events) = gateway(&url, "http://127.0.0.1:9");
    client.connect().await.unwrap();
    next_event(&mut events).await;
    let mut socket = accept(&mut sockets).await;

    client.quit(None).await.unwrap();
    // Drive the server side so the close handshake completes.
    while let Some(Ok(frame)) = socket.next().await {
        if frame.is_close() {
            break;
        }
    }
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Disconnected {
            user_initiated: true
        }
    );
}

async fn rtm_api(ws_url: &str) -> MockServer {
    let api = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rtm.start"))
        .and(header("Authorization", "Bearer xoxb-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "url": ws_url,
            "self": {"id": "UBOT", "name": "switchboard"},
            "channels": [{"id": "C1", "name": "general"}],
            "users": [{"id": "U1", "name": "alice"}],
            "ims": [{"id": "D1"}]
        })))
        .mount(&api)
        .await;
    api
}

fn rtm(api_base: &str) -> (RtmClient, mpsc::Receiver<ClientEvent>) {
    let mut config = RtmClientConfig::new("workspace", "xoxb-test");
    config.api_base = api_base.to_string();
    let (tx, rx) = mpsc::channel(32);
    (RtmClient::new(config, NetworkSession::shared(), tx), rx)
}

#[tokio::test]
async fn test_rtm_handshake_hello_and_messages() {
    let (url, mut sockets) = ws_server().await;
    let api = rtm_api(&url).await;
    let (client, mut events) = rtm(&api.uri());

    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    assert_eq!(
        client.session().read().await.state(),
        SessionState::Authenticated
    );
    let snapshot = client.snapshot().await;
    assert_eq!(snapshot.self_id, "UBOT");
    assert_eq!(snapshot.channels.get("C1").map(String::as_str), Some("general"));

    let mut socket = accept(&mut sockets).await;
    send_json(&mut socket, &json!({"type": "hello"})).await;
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Ready {
            nickname: "switchboard".into()
        }
    );
    assert_eq!(client.session().read().await.state(), SessionState::Ready);

    send_json(
        &mut socket,
        &json!({"type": "message", "channel": "D1", "user": "U1", "text": "!help"}),
    )
    .await;
    let ClientEvent::Message(msg) = next_event(&mut events).await else {
        panic!("expected a message");
    };
    assert_eq!(msg.source_type, SourceType::Message);
    assert_eq!(msg.sender.nickname, "alice");
    assert_eq!(msg.text, "!help");

    client.send_message("C1", "hi").await.unwrap();
    let frame = recv_json(&mut socket).await;
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["channel"], "C1");
    assert_eq!(frame["text"], "hi");
}

#[tokio::test]
async fn test_rtm_rejected_handshake() {
    let api = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rtm.start"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"ok": false, "error": "invalid_auth"})),
        )
        .mount(&api)
        .await;
    let (client, _events) = rtm(&api.uri());

    let err = client.connect().await.unwrap_err();
    assert!(err.to_string().contains("invalid_auth"));
    assert_eq!(
        client.session().read().await.state(),
        SessionState::Disconnected
    );
}

#[tokio::test]
async fn test_rtm_socket_loss_repeats_handshake() {
    let (url, mut sockets) = ws_server().await;
    let api = rtm_api(&url).await;
    let (client, mut events) = rtm(&api.uri());

    client.connect().await.unwrap();
    next_event(&mut events).await;
    let mut first = accept(&mut sockets).await;
    first.close(None).await.unwrap();

    let mut second = accept(&mut sockets).await;
    send_json(&mut second, &json!({"type": "hello"})).await;
    // No Disconnected in between: the next event comes from the new socket.
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Ready { .. }
    ));
    let handshakes = api.received_requests().await.unwrap_or_default();
    assert_eq!(handshakes.len(), 2);
}

#[tokio::test]
async fn test_rtm_quit_during_rehandshake() {
    let (url, mut sockets) = ws_server().await;
    let api = MockServer::start().await;
    let reply = json!({"ok": true, "url": url, "self": {"id": "UBOT", "name": "switchboard"}});
    Mock::given(method("GET"))
        .and(path("/rtm.start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply.clone()))
        .up_to_n_times(1)
        .mount(&api)
        .await;
    Mock::given(method("GET"))
        .and(path("/rtm.start"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(reply)
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&api)
        .await;
    let (client, mut events) = rtm(&api.uri());

    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    let mut first = accept(&mut sockets).await;
    first.close(None).await.unwrap();

    // Wait until the second handshake is held by the delayed reply.
    tokio::time::timeout(Duration::from_secs(2), async {
        while api.received_requests().await.unwrap_or_default().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no second handshake");
    client.quit(None).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Disconnected {
            user_initiated: true
        }
    );
    assert_eq!(
        client.session().read().await.state(),
        SessionState::Disconnected
    );
    if let Ok(Some(socket)) = tokio::time::timeout(Duration::from_millis(500), sockets.recv()).await {
        assert_socket_ends(socket).await;
    }
}

#[tokio::test]
async fn test_rtm_send_requires_connection() {
    let (client, _events) = rtm("http://127.0.0.1:9");
    assert!(client.send_message("C1", "hi").await.is_err());
}
