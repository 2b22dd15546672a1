#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::StreamExt;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use huddle_api::config::Config;
use huddle_api::db::groups::MemoryGroupStore;
use huddle_api::models::group::{GroupId, MemberId};
use huddle_api::AppState;

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub fn test_config() -> Config {
    Config {
        channel_buffer: 64,
        worker_mailbox_capacity: 64,
        ..Config::default()
    }
}

/// Fresh application state over an empty in-memory group store.
pub fn test_state(config: Config) -> AppState {
    AppState::new(config, Arc::new(MemoryGroupStore::new(1)))
}

/// Router plus the state behind it.
pub fn test_app() -> (Router, AppState) {
    app_with(test_config())
}

fn app_with(config: Config) -> (Router, AppState) {
    let state = test_state(config);
    let app = huddle_api::routes::router().with_state(state.clone());
    (app, state)
}

/// Start a real TCP server for WebSocket testing. The server runs in the
/// background.
pub async fn start_ws_server() -> (SocketAddr, AppState) {
    start_ws_server_with(test_config()).await
}

pub async fn start_ws_server_with(config: Config) -> (SocketAddr, AppState) {
    let (app, state) = app_with(config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

pub async fn create_group(state: &AppState, max_active_members: Option<u32>) -> GroupId {
    state
        .store
        .create_group(max_active_members)
        .await
        .expect("create group")
        .id
}

pub fn channel_url(addr: SocketAddr, group_id: GroupId, member_id: u64) -> String {
    format!("ws://{addr}/gateway/groups/{group_id}/members/{member_id}")
}

/// Open a member's channel.
pub async fn connect(addr: SocketAddr, group_id: GroupId, member_id: u64) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(channel_url(addr, group_id, member_id))
        .await
        .expect("ws connect");
    ws
}

/// Next message from the server, skipping control frames.
pub async fn next_message(ws: &mut WsClient) -> Message {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

/// Next text frame, parsed as JSON.
pub async fn next_json(ws: &mut WsClient) -> serde_json::Value {
    match next_message(ws).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("parse frame"),
        other => panic!("expected a text frame, got: {other:?}"),
    }
}

/// Assert that nothing but control frames arrives for a short while.
pub async fn assert_silent(ws: &mut WsClient) {
    let got = time::timeout(Duration::from_millis(200), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    if let Ok(msg) = got {
        panic!("expected silence, got: {msg:?}");
    }
}

/// Wait until the group's dispatcher has stopped and deregistered.
pub async fn wait_for_dispatcher_exit(state: &AppState, group_id: GroupId) {
    time::timeout(Duration::from_secs(5), async {
        while state.groups.get(group_id).is_some() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dispatcher did not stop");
}

/// Wait until the group store lists exactly `members` as active.
pub async fn wait_for_active_members(state: &AppState, group_id: GroupId, members: &[u64]) {
    let expected: Vec<MemberId> = members.iter().copied().map(MemberId).collect();
    time::timeout(Duration::from_secs(5), async {
        loop {
            let record = state.store.find_group(group_id).await.unwrap().unwrap();
            if record.active_members.iter().copied().collect::<Vec<_>>() == expected {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("active members never matched");
}
