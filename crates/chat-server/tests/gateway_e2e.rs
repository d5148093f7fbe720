mod common;

use chat_server::build_router;
use chat_server::config::AppState;
use chat_server::models::Participant;
use common::{befriend, member, register, staff, store, token, TENANT};
use std::collections::HashSet;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, token: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws?token={}", addr, token))
        .await
        .unwrap();
    ws
}

/// Next event named `name`, skipping any other frames
async fn next_named(ws: &mut Client, name: &str) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["event"] == name {
                        return value["data"].clone();
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended waiting for {}: {:?}", name, other),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", name))
}

/// Close code of the first close frame
async fn close_code(ws: &mut Client) -> u16 {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(_)) => {}
                other => panic!("no close frame: {:?}", other),
            }
        }
    })
    .await
    .unwrap()
}

async fn send(ws: &mut Client, event: Value) {
    ws.send(Message::Text(event.to_string())).await.unwrap();
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_close_codes_for_missing_and_invalid_credentials() {
    let dir = TempDir::new().unwrap();
    let mut config = common::config(dir.path());
    config.auth_timeout = Duration::from_millis(200);
    let addr = spawn_server(common::state_with(config)).await;

    let (mut silent, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    assert_eq!(close_code(&mut silent).await, 4001);

    let mut forged = connect(addr, "not-a-token").await;
    assert_eq!(close_code(&mut forged).await, 4002);

    // Credential may also arrive as the first frame
    let dir2 = TempDir::new().unwrap();
    let state = common::state(dir2.path());
    let addr = spawn_server(state.clone()).await;
    let (mut late, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    let credential = token(&state, &member("alice"), TENANT);
    send(&mut late, json!({"event": "authenticate", "data": {"token": credential}})).await;
    let ack = next_named(&mut late, "connection").await;
    assert_eq!(ack["identityId"], "alice");
    assert_eq!(ack["role"], "MEMBER");
}

#[tokio::test]
async fn test_send_typing_and_read_receipt_between_friends() {
    let dir = TempDir::new().unwrap();
    let state = common::state(dir.path());
    let (alice, coach) = (member("alice"), staff("coach"));
    befriend(&state, &alice, &coach).await;
    register(&state, &coach).await;
    let addr = spawn_server(state.clone()).await;

    let mut coach_ws = connect(addr, &token(&state, &coach, "Iron Gym")).await;
    next_named(&mut coach_ws, "connection").await;

    let mut alice_ws = connect(addr, &token(&state, &alice, "Iron Gym")).await;
    next_named(&mut alice_ws, "connection").await;

    let online = next_named(&mut coach_ws, "userStatus").await;
    assert_eq!(online, json!({"userId": "alice", "isOnline": true}));

    send(
        &mut alice_ws,
        json!({"event": "typing_status", "data": {"receiverId": "coach", "isTyping": true}}),
    )
    .await;
    let typing = next_named(&mut coach_ws, "user_typing").await;
    assert_eq!(typing, json!({"userId": "alice", "isTyping": true}));

    send(
        &mut alice_ws,
        json!({"event": "send_message", "data": {"receiverId": "coach", "receiverRole": "STAFF", "message": "hi"}}),
    )
    .await;

    let echoed = next_named(&mut alice_ws, "receive_message").await;
    let sent = next_named(&mut alice_ws, "message_sent").await;
    assert_eq!(sent["status"], "sent");
    assert_eq!(sent["messageId"], echoed["id"]);

    let received = next_named(&mut coach_ws, "receive_message").await;
    assert_eq!(received["body"], "hi");
    assert_eq!(received["senderId"], "alice");
    assert_eq!(received["read"], false);

    send(
        &mut coach_ws,
        json!({"event": "message_seen", "data": {"messageId": received["id"], "senderId": "alice"}}),
    )
    .await;
    let receipt = next_named(&mut alice_ws, "message_status_update").await;
    assert_eq!(receipt["messageId"], received["id"]);
    assert_eq!(receipt["status"], "seen");

    let store = store(&state).await;
    let history = state.messages.history(&store, "alice", "coach").await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].read);

    // Alice leaving is announced to the coach
    alice_ws.close(None).await.unwrap();
    let offline = next_named(&mut coach_ws, "userStatus").await;
    assert_eq!(offline, json!({"userId": "alice", "isOnline": false}));
}

#[tokio::test]
async fn test_unauthorized_send_is_refused_and_not_stored() {
    let dir = TempDir::new().unwrap();
    let state = common::state(dir.path());
    let addr = spawn_server(state.clone()).await;

    let mut alice_ws = connect(addr, &token(&state, &member("alice"), TENANT)).await;
    next_named(&mut alice_ws, "connection").await;

    send(
        &mut alice_ws,
        json!({"event": "send_message", "data": {"receiverId": "coach", "receiverRole": "STAFF", "body": "psst"}}),
    )
    .await;
    let error = next_named(&mut alice_ws, "error").await;
    assert_eq!(error["code"], "FORBIDDEN");

    // Malformed frames are ignored and the connection stays usable
    alice_ws.send(Message::Text("{not json".into())).await.unwrap();
    send(
        &mut alice_ws,
        json!({"event": "send_message", "data": {"receiverId": "coach", "receiverRole": "STAFF", "body": "again"}}),
    )
    .await;
    assert_eq!(next_named(&mut alice_ws, "error").await["code"], "FORBIDDEN");

    let store = store(&state).await;
    assert!(state
        .messages
        .history(&store, "alice", "coach")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_reconnect_replays_unread_messages() {
    let dir = TempDir::new().unwrap();
    let state = common::state(dir.path());
    let (alice, coach) = (member("alice"), staff("coach"));
    befriend(&state, &alice, &coach).await;
    register(&state, &alice).await;
    register(&state, &coach).await;
    let addr = spawn_server(state.clone()).await;

    let store = store(&state).await;
    for body in ["first", "second"] {
        state.send_direct(&store, &alice, &coach, body).await.unwrap();
    }

    let mut coach_ws = connect(addr, &token(&state, &coach, TENANT)).await;
    next_named(&mut coach_ws, "connection").await;
    let first = next_named(&mut coach_ws, "receive_message").await;
    let second = next_named(&mut coach_ws, "receive_message").await;
    assert_eq!(first["body"], "first");
    assert_eq!(second["body"], "second");

    // Catch-up does not mark anything read
    let since = chrono::Utc::now() - chrono::Duration::hours(1);
    let unseen = state.messages.unseen_since(&store, &coach, since).await.unwrap();
    assert_eq!(unseen.len(), 2);

    for message in [&first, &second] {
        send(
            &mut coach_ws,
            json!({"event": "message_seen", "data": {"messageId": message["id"], "senderId": "alice"}}),
        )
        .await;
    }
    // Frames are handled in order, so this ack follows both receipts
    send(
        &mut coach_ws,
        json!({"event": "send_message", "data": {"receiverId": "alice", "receiverRole": "MEMBER", "body": "thanks"}}),
    )
    .await;
    next_named(&mut coach_ws, "message_sent").await;

    assert!(state
        .messages
        .unseen_since(&store, &coach, since)
        .await
        .unwrap()
        .is_empty());

    // A later reconnect replays nothing
    coach_ws.close(None).await.unwrap();
    let mut again = connect(addr, &token(&state, &coach, TENANT)).await;
    next_named(&mut again, "connection").await;
    state.send_direct(&store, &alice, &coach, "fresh").await.unwrap();
    assert_eq!(next_named(&mut again, "receive_message").await["body"], "fresh");
}

#[tokio::test]
async fn test_catch_up_precedes_live_messages_without_duplicates() {
    const BACKLOG: usize = 200;
    const LIVE: usize = 20;

    let dir = TempDir::new().unwrap();
    let state = common::state(dir.path());
    let (alice, coach) = (member("alice"), staff("coach"));
    befriend(&state, &alice, &coach).await;
    register(&state, &coach).await;
    let addr = spawn_server(state.clone()).await;

    let store = store(&state).await;
    for i in 0..BACKLOG {
        state
            .send_direct(&store, &alice, &coach, &format!("old-{}", i))
            .await
            .unwrap();
    }

    // Live sends start as soon as the coach is registered, racing catch-up
    let sender = {
        let (state, store, alice, coach) = (state.clone(), store.clone(), alice.clone(), coach.clone());
        tokio::spawn(async move {
            assert!(wait_until(|| state.presence.is_online(TENANT, "coach")).await);
            for i in 0..LIVE {
                state
                    .send_direct(&store, &alice, &coach, &format!("live-{}", i))
                    .await
                    .unwrap();
            }
        })
    };

    let mut coach_ws = connect(addr, &token(&state, &coach, TENANT)).await;
    next_named(&mut coach_ws, "connection").await;

    let mut ids = HashSet::new();
    let mut bodies = Vec::new();
    while bodies.len() < BACKLOG + LIVE {
        let message = next_named(&mut coach_ws, "receive_message").await;
        assert!(
            ids.insert(message["id"].as_str().unwrap().to_string()),
            "duplicate delivery of {}",
            message["body"]
        );
        bodies.push(message["body"].as_str().unwrap().to_string());
    }
    sender.await.unwrap();

    let old: Vec<_> = (0..BACKLOG).map(|i| format!("old-{}", i)).collect();
    let live: Vec<_> = (0..LIVE).map(|i| format!("live-{}", i)).collect();
    assert_eq!(&bodies[..BACKLOG], &old[..]);
    assert_eq!(&bodies[BACKLOG..], &live[..]);
}

#[tokio::test]
async fn test_slow_reader_receives_every_message() {
    const COUNT: usize = 200;

    let dir = TempDir::new().unwrap();
    let state = common::state(dir.path());
    let (alice, coach) = (member("alice"), staff("coach"));
    befriend(&state, &alice, &coach).await;
    register(&state, &coach).await;
    let addr = spawn_server(state.clone()).await;

    let mut coach_ws = connect(addr, &token(&state, &coach, TENANT)).await;
    next_named(&mut coach_ws, "connection").await;

    // The coach reads nothing while the whole burst is delivered
    let store = store(&state).await;
    let padding = "x".repeat(16 * 1024);
    for i in 0..COUNT {
        state
            .send_direct(&store, &alice, &coach, &format!("{}:{}", i, padding))
            .await
            .unwrap();
    }

    for i in 0..COUNT {
        let message = next_named(&mut coach_ws, "receive_message").await;
        let body = message["body"].as_str().unwrap();
        assert_eq!(body.split(':').next(), Some(i.to_string().as_str()));
    }
}

#[tokio::test]
async fn test_store_failure_during_send_is_reported_and_connection_survives() {
    let dir = TempDir::new().unwrap();
    let state = common::state(dir.path());
    let (alice, coach) = (member("alice"), staff("coach"));
    befriend(&state, &alice, &coach).await;
    register(&state, &coach).await;
    let addr = spawn_server(state.clone()).await;

    let mut alice_ws = connect(addr, &token(&state, &alice, TENANT)).await;
    next_named(&mut alice_ws, "connection").await;

    store(&state).await.close().await;

    for body in ["lost", "lost again"] {
        send(
            &mut alice_ws,
            json!({"event": "send_message", "data": {"receiverId": "coach", "receiverRole": "STAFF", "body": body}}),
        )
        .await;
        let error = next_named(&mut alice_ws, "error").await;
        assert_eq!(error["code"], "STORE_UNAVAILABLE");
    }
    assert!(state.presence.is_online(TENANT, "alice"));
}

#[tokio::test]
async fn test_newest_connection_wins_and_stale_close_keeps_it() {
    let dir = TempDir::new().unwrap();
    let state = common::state(dir.path());
    let (alice, coach) = (member("alice"), staff("coach"));
    befriend(&state, &alice, &coach).await;
    register(&state, &alice).await;
    let addr = spawn_server(state.clone()).await;
    let alice_token = token(&state, &alice, TENANT);

    let mut first = connect(addr, &alice_token).await;
    next_named(&mut first, "connection").await;
    let mut second = connect(addr, &alice_token).await;
    next_named(&mut second, "connection").await;

    first.close(None).await.unwrap();
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(state.presence.is_online(TENANT, "alice"));

    let store = store(&state).await;
    state
        .send_direct(&store, &coach, &alice, "still there?")
        .await
        .unwrap();
    let received = next_named(&mut second, "receive_message").await;
    assert_eq!(received["body"], "still there?");
}

#[tokio::test]
async fn test_unanswered_pings_drop_the_connection() {
    let dir = TempDir::new().unwrap();
    let mut config = common::config(dir.path());
    config.ping_interval = Duration::from_millis(100);
    config.max_missed_pings = 2;
    let state = common::state_with(config);
    let addr = spawn_server(state.clone()).await;

    // Never polled after connecting, so no pong is ever written
    let _idle = connect(addr, &token(&state, &member("idle"), TENANT)).await;
    assert!(wait_until(|| state.presence.is_online(TENANT, "idle")).await);
    assert!(wait_until(|| !state.presence.is_online(TENANT, "idle")).await);
}

#[tokio::test]
async fn test_answered_pings_keep_the_connection() {
    let dir = TempDir::new().unwrap();
    let mut config = common::config(dir.path());
    config.ping_interval = Duration::from_millis(100);
    config.max_missed_pings = 2;
    let state = common::state_with(config);
    let addr = spawn_server(state.clone()).await;

    let who = Participant::new("lively", chat_server::models::Role::Member);
    let mut ws = connect(addr, &token(&state, &who, TENANT)).await;

    // Answer every ping with an application-level pong
    let responder = tokio::spawn(async move {
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Ping(_) = frame {
                let pong = json!({"event": "pong"}).to_string();
                if ws.send(Message::Text(pong)).await.is_err() {
                    break;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(state.presence.is_online(TENANT, "lively"));
    responder.abort();
}
