use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_core::{ChannelEvent, Envelope, LocalIdentity, PeerId, SignalChannel, WebSocketChannel};
use huddle_relay::{ROOM_PATH, Room};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> (SocketAddr, Room) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let room = Room::new();
    let served = room.clone();
    tokio::spawn(async move {
        huddle_relay::serve(listener, served, std::future::pending())
            .await
            .unwrap();
    });
    (addr, room)
}

async fn client(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}{ROOM_PATH}")).await.unwrap();
    ws
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(ws: &mut Client, text: &str) {
    ws.send(Message::Text(text.to_owned())).await.unwrap();
}

async fn wait_for_members(room: &Room, count: usize) {
    timeout(Duration::from_secs(5), async {
        while room.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room never reached expected size");
}

#[tokio::test]
async fn joins_and_signaling_reach_every_socket() {
    let (addr, room) = start_relay().await;
    let mut ann = client(addr).await;
    let mut bob = client(addr).await;
    wait_for_members(&room, 2).await;

    send(&mut ann, r#"{"type":"join","userId":"1","username":"ann"}"#).await;
    for ws in [&mut ann, &mut bob] {
        assert_eq!(next_json(ws).await["type"], "user-join");
        let users = next_json(ws).await;
        assert_eq!(users["type"], "users");
        assert_eq!(users["users"][0]["username"], "ann");
    }

    let offer = r#"{"type":"offer","userId":"1","targetUserId":"2","sdp":{"type":"offer","sdp":"v=0"}}"#;
    send(&mut ann, offer).await;
    assert_eq!(next_json(&mut bob).await["targetUserId"], "2");
    assert_eq!(next_json(&mut ann).await["type"], "offer");
}

#[tokio::test]
async fn closing_a_joined_socket_announces_user_left() {
    let (addr, room) = start_relay().await;
    let mut ann = client(addr).await;
    let mut bob = client(addr).await;
    wait_for_members(&room, 2).await;

    send(&mut ann, r#"{"type":"join","userId":"1","username":"ann"}"#).await;
    next_json(&mut bob).await;
    next_json(&mut bob).await;

    ann.close(None).await.unwrap();

    let left = next_json(&mut bob).await;
    assert_eq!(left["type"], "user-left");
    assert_eq!(left["userId"], "1");
    let users = next_json(&mut bob).await;
    assert_eq!(users["users"], Value::Array(Vec::new()));
}

#[tokio::test]
async fn late_sockets_are_sent_chat_history_first() {
    let (addr, room) = start_relay().await;
    let mut ann = client(addr).await;
    wait_for_members(&room, 1).await;

    send(&mut ann, r#"{"type":"message","userId":"1","username":"ann","text":"hi"}"#).await;
    assert_eq!(next_json(&mut ann).await["text"], "hi");

    let mut bob = client(addr).await;
    let history = next_json(&mut bob).await;
    assert_eq!(history["type"], "history");
    assert_eq!(history["messages"][0]["text"], "hi");
    assert_eq!(history["messages"][0]["userId"], "1");
}

#[tokio::test]
async fn malformed_frames_do_not_close_the_socket() {
    let (addr, room) = start_relay().await;
    let mut ann = client(addr).await;
    wait_for_members(&room, 1).await;

    send(&mut ann, "{broken").await;
    send(&mut ann, r#"{"type":"typing","userId":"1","isTyping":true}"#).await;

    let typing = next_json(&mut ann).await;
    assert_eq!(typing["type"], "typing");
    assert_eq!(typing["isTyping"], true);
}

async fn next_envelope(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Envelope {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("channel closed");
        if let ChannelEvent::Envelope(envelope) = event {
            return envelope;
        }
    }
}

#[tokio::test]
async fn websocket_channels_talk_through_the_relay() {
    let (addr, _room) = start_relay().await;
    let url = format!("ws://{addr}{ROOM_PATH}");
    let (ann, mut ann_events) =
        WebSocketChannel::connect(&url, LocalIdentity::new("1", "ann"), Duration::from_millis(50))
            .unwrap();

    match next_envelope(&mut ann_events).await {
        Envelope::UserJoin { user_id, username } => {
            assert_eq!(user_id, PeerId::from("1"));
            assert_eq!(username, "ann");
        }
        other => panic!("expected user-join, got {other:?}"),
    }
    assert!(matches!(
        next_envelope(&mut ann_events).await,
        Envelope::UsersSnapshot { .. }
    ));

    let (_bob, mut bob_events) =
        WebSocketChannel::connect(&url, LocalIdentity::new("2", "bob"), Duration::from_millis(50))
            .unwrap();
    assert!(matches!(
        next_envelope(&mut bob_events).await,
        Envelope::UserJoin { .. }
    ));
    assert!(matches!(
        next_envelope(&mut bob_events).await,
        Envelope::UsersSnapshot { .. }
    ));

    assert!(ann.is_open());
    ann.send(&Envelope::JoinCall {
        user_id: "1".into(),
        username: "ann".into(),
    })
    .unwrap();
    assert!(matches!(
        next_envelope(&mut bob_events).await,
        Envelope::JoinCall { .. }
    ));
}
