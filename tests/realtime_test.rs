// Integration tests for the realtime adapter against a local WebSocket server.
//
// Each test binds a listener on 127.0.0.1:0, plays the server side of the
// JSON realtime protocol for one connection, and drives `AblyRealtime`
// through the `MessagingClient` trait the way the session does.

use std::time::Duration;

use channel_tail::realtime::{ChannelState, ConnectionState, MessagingClient};
use channel_tail::AblyRealtime;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(5);

async fn next<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("queue closed")
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    (listener, host)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: Value) {
    ws.send(WsFrame::Text(frame.to_string().into())).await.unwrap();
}

/// Next protocol frame from the client, skipping control frames.
async fn recv(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
    while let Some(Ok(frame)) = ws.next().await {
        if let WsFrame::Text(text) = frame {
            return Some(serde_json::from_str(&text).unwrap());
        }
    }
    None
}

/// Server that accepts one connection, attaches `room1`, publishes two
/// messages and acknowledges CLOSE.
fn spawn_happy_server(listener: TcpListener) -> JoinHandle<Vec<Value>> {
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut seen = Vec::new();
        send(
            &mut ws,
            json!({
                "action": 4,
                "connectionId": "conn-1",
                "connectionDetails": {"connectionKey": "key-1", "maxIdleInterval": 15000}
            }),
        )
        .await;

        while let Some(frame) = recv(&mut ws).await {
            seen.push(frame.clone());
            match frame["action"].as_u64() {
                Some(10) => {
                    send(&mut ws, json!({"action": 11, "channel": frame["channel"]})).await;
                    send(
                        &mut ws,
                        json!({
                            "action": 15,
                            "id": "frame-1",
                            "channel": "room1",
                            "connectionId": "publisher",
                            "timestamp": 1_700_000_000_000_i64,
                            "messages": [
                                {"name": "ping", "data": "aGVsbG8=", "encoding": "base64"},
                                {"name": "pong", "data": {"n": 1}, "clientId": "bob"}
                            ]
                        }),
                    )
                    .await;
                    send(
                        &mut ws,
                        json!({
                            "action": 14,
                            "id": "frame-2",
                            "channel": "room1",
                            "presence": [{"action": 2, "clientId": "alice", "connectionId": "c2"}]
                        }),
                    )
                    .await;
                }
                Some(7) => {
                    send(&mut ws, json!({"action": 8})).await;
                    break;
                }
                _ => {}
            }
        }
        seen
    })
}

#[tokio::test]
async fn test_connect_attach_receive_and_close() {
    let (listener, host) = bind().await;
    let server = spawn_happy_server(listener);

    let mut client = AblyRealtime::new(host, false);
    let mut connection = client.connect("app.key:secret").await.unwrap();

    let change = next(&mut connection).await;
    assert_eq!(change.current, ConnectionState::Connecting);
    let change = next(&mut connection).await;
    assert_eq!(change.current, ConnectionState::Connected);
    assert_eq!(change.connection_id.as_deref(), Some("conn-1"));

    let mut feeds = client.channel("room1").await.unwrap();
    assert_eq!(next(&mut feeds.states).await.current, ChannelState::Attaching);
    assert_eq!(next(&mut feeds.states).await.current, ChannelState::Attached);

    let ping = next(&mut feeds.messages).await;
    assert_eq!(ping.name(), Some("ping"));
    assert_eq!(ping.id.as_deref(), Some("frame-1:0"));
    assert_eq!(ping.encoding.as_deref(), Some("base64"));
    assert_eq!(ping.connection_id.as_deref(), Some("publisher"));
    assert_eq!(ping.timestamp, 1_700_000_000_000);

    let pong = next(&mut feeds.messages).await;
    assert_eq!(pong.name(), Some("pong"));
    assert_eq!(pong.client_id.as_deref(), Some("bob"));
    assert_eq!(pong.data, Some(json!({"n": 1})));

    let presence = next(&mut feeds.presence).await;
    assert_eq!(presence.client_id.as_deref(), Some("alice"));

    tokio::time::timeout(WAIT, client.close())
        .await
        .expect("close timed out")
        .unwrap();
    assert_eq!(next(&mut connection).await.current, ConnectionState::Closing);
    assert_eq!(next(&mut connection).await.current, ConnectionState::Closed);

    let seen = server.await.unwrap();
    assert_eq!(seen[0]["action"], 10);
    assert_eq!(seen[0]["channel"], "room1");
    assert_eq!(seen.last().unwrap()["action"], 7);
}

#[tokio::test]
async fn test_connection_error_fails_connection() {
    let (listener, host) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send(
            &mut ws,
            json!({
                "action": 9,
                "error": {"code": 40101, "statusCode": 401, "message": "Invalid credentials"}
            }),
        )
        .await;
        // Keep the socket open until the client goes away.
        while recv(&mut ws).await.is_some() {}
    });

    let mut client = AblyRealtime::new(host, false);
    let mut connection = client.connect("bad.key:secret").await.unwrap();

    assert_eq!(next(&mut connection).await.current, ConnectionState::Connecting);
    let failed = next(&mut connection).await;
    assert_eq!(failed.current, ConnectionState::Failed);
    let reason = failed.reason.unwrap();
    assert_eq!(reason.code, 40101);
    assert_eq!(reason.status_code, 401);
}

#[tokio::test]
async fn test_rejected_handshake_fails_connection() {
    let (listener, host) = bind().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0_u8; 4096];
        let _ = stream.read(&mut buf).await;
        stream
            .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
    });

    let mut client = AblyRealtime::new(host, false);
    let mut connection = client.connect("app.key:secret").await.unwrap();

    assert_eq!(next(&mut connection).await.current, ConnectionState::Connecting);
    let failed = next(&mut connection).await;
    assert_eq!(failed.current, ConnectionState::Failed);
    assert!(failed.reason.unwrap().message.contains("401"));
}

#[tokio::test]
async fn test_channel_error_fails_channel_only() {
    let (listener, host) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send(&mut ws, json!({"action": 4, "connectionId": "conn-1"})).await;
        while let Some(frame) = recv(&mut ws).await {
            if frame["action"] == 10 {
                send(
                    &mut ws,
                    json!({
                        "action": 9,
                        "channel": "room1",
                        "error": {"code": 40160, "statusCode": 401, "message": "Channel denied"}
                    }),
                )
                .await;
            }
        }
    });

    let mut client = AblyRealtime::new(host, false);
    let mut connection = client.connect("app.key:secret").await.unwrap();
    assert_eq!(next(&mut connection).await.current, ConnectionState::Connecting);
    assert_eq!(next(&mut connection).await.current, ConnectionState::Connected);

    let mut feeds = client.channel("room1").await.unwrap();
    assert_eq!(next(&mut feeds.states).await.current, ChannelState::Attaching);
    let failed = next(&mut feeds.states).await;
    assert_eq!(failed.current, ChannelState::Failed);
    assert_eq!(failed.reason.unwrap().code, 40160);

    assert!(connection.try_recv().is_err());
}

#[tokio::test]
async fn test_connect_twice_rejected() {
    let (listener, host) = bind().await;
    let _server = spawn_happy_server(listener);

    let mut client = AblyRealtime::new(host, false);
    let _connection = client.connect("app.key:secret").await.unwrap();
    assert!(client.connect("app.key:secret").await.is_err());
}

#[tokio::test]
async fn test_duplicate_channel_rejected() {
    let (listener, host) = bind().await;
    let _server = spawn_happy_server(listener);

    let mut client = AblyRealtime::new(host, false);
    let _connection = client.connect("app.key:secret").await.unwrap();
    let _feeds = client.channel("room1").await.unwrap();
    assert!(client.channel("room1").await.is_err());
}

#[tokio::test]
async fn test_close_sends_close_frame_when_message_queue_is_full() {
    let (listener, host) = bind().await;
    let (saw_close_tx, saw_close_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send(&mut ws, json!({"action": 4, "connectionId": "conn-1"})).await;
        let mut saw_close = false;
        while let Some(frame) = recv(&mut ws).await {
            match frame["action"].as_u64() {
                Some(10) => {
                    send(&mut ws, json!({"action": 11, "channel": "room1"})).await;
                    for n in 0..400 {
                        send(
                            &mut ws,
                            json!({
                                "action": 15,
                                "id": format!("flood-{n}"),
                                "channel": "room1",
                                "messages": [{"name": "tick", "data": n}]
                            }),
                        )
                        .await;
                    }
                }
                Some(7) => {
                    saw_close = true;
                    send(&mut ws, json!({"action": 8})).await;
                    break;
                }
                _ => {}
            }
        }
        let _ = saw_close_tx.send(saw_close);
    });

    let mut client = AblyRealtime::new(host, false);
    let mut connection = client.connect("app.key:secret").await.unwrap();
    assert_eq!(next(&mut connection).await.current, ConnectionState::Connecting);
    assert_eq!(next(&mut connection).await.current, ConnectionState::Connected);

    // Never drained: the adapter fills the queue and blocks on it.
    let mut feeds = client.channel("room1").await.unwrap();
    assert_eq!(next(&mut feeds.states).await.current, ChannelState::Attaching);
    assert_eq!(next(&mut feeds.states).await.current, ChannelState::Attached);
    tokio::time::timeout(WAIT, async {
        while feeds.messages.capacity() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message queue never filled");

    tokio::time::timeout(Duration::from_secs(3), client.close())
        .await
        .expect("close blocked on the full queue")
        .unwrap();

    let saw_close = tokio::time::timeout(WAIT, saw_close_rx)
        .await
        .expect("server never finished")
        .unwrap();
    assert!(saw_close, "server never received CLOSE");
}
