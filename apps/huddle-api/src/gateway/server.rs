//! WebSocket upgrade handler and per-connection group channel loop.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::config::Config;
use crate::error::ApiError;
use crate::models::group::{GroupId, MemberId};
use crate::AppState;

use super::channel::{DropoutGuard, GroupChannel};
use super::dispatcher::DispatcherHandle;
use super::events::{to_frame, ErrorReply, GroupMessage};

/// Close codes (4000-range for application-level).
const CLOSE_GROUP_UNAVAILABLE: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;
const CLOSE_REMOVED: u16 = 4010;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Why a channel's connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelExit {
    ClientClosed,
    TransportError,
    IdleTimeout,
    /// The dispatcher removed the member itself.
    Removed,
    DispatcherGone,
}

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/gateway/groups/{group_id}/members/{member_id}",
        get(ws_upgrade),
    )
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((group_id, member_id)): Path<(GroupId, MemberId)>,
) -> Result<impl IntoResponse, ApiError> {
    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Group {group_id} not found")))?;

    if !group.admits(member_id) {
        return Err(ApiError::conflict(format!(
            "Member {member_id} can't join group {group_id} in state {}",
            group.state
        )));
    }

    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, group_id, member_id)))
}

async fn handle_connection(socket: WebSocket, state: AppState, group_id: GroupId, member_id: MemberId) {
    let (mut ws_tx, ws_rx) = socket.split();

    let (tx, rx) = mpsc::channel(state.config.channel_buffer);
    let channel = GroupChannel::new(member_id, tx);

    let dispatcher = match state.groups.join(group_id, channel.clone()).await {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            tracing::warn!(%group_id, %member_id, %err, "could not join group");
            let _ = send_close(&mut ws_tx, CLOSE_GROUP_UNAVAILABLE, "Group unavailable").await;
            return;
        }
    };
    let mut dropout = DropoutGuard::new(dispatcher.clone(), &channel);

    tracing::info!(
        %group_id,
        %member_id,
        channel_id = channel.id(),
        "group channel opened"
    );

    let exit = run_channel(&state.config, &channel, &dispatcher, ws_tx, ws_rx, rx).await;

    if exit == ChannelExit::Removed {
        dropout.disarm();
    }
    drop(dropout);

    tracing::info!(
        %group_id,
        %member_id,
        channel_id = channel.id(),
        ?exit,
        "group channel closed"
    );
}

/// Pump frames between the connection and the dispatcher until either side
/// goes away.
async fn run_channel(
    config: &Config,
    channel: &GroupChannel,
    dispatcher: &DispatcherHandle,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut frames: mpsc::Receiver<Arc<str>>,
) -> ChannelExit {
    let ping_interval = config.channel_ping_interval;
    let idle_deadline = ping_interval * 2;
    let mut last_seen = Instant::now();
    let mut ping_timer = time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            biased;

            // Removed from the group; checked first so nothing more is relayed.
            _ = channel.closed() => {
                let _ = send_close(&mut ws_tx, CLOSE_REMOVED, "Removed from group").await;
                return ChannelExit::Removed;
            }

            // Member sends us something.
            msg = ws_rx.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > config.max_frame_bytes {
                            let reply = ErrorReply::new(format!(
                                "Message exceeds {} bytes.",
                                config.max_frame_bytes
                            ));
                            if send_reply(&mut ws_tx, &reply).await.is_err() {
                                return ChannelExit::TransportError;
                            }
                            continue;
                        }

                        match GroupMessage::parse(channel.member_id(), text.as_str()) {
                            Ok(message) => {
                                if dispatcher.message(channel.clone(), message).await.is_err() {
                                    return ChannelExit::DispatcherGone;
                                }
                            }
                            Err(reply) => {
                                if send_reply(&mut ws_tx, &reply).await.is_err() {
                                    return ChannelExit::TransportError;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = ErrorReply::new("Binary frames aren't supported.");
                        if send_reply(&mut ws_tx, &reply).await.is_err() {
                            return ChannelExit::TransportError;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return ChannelExit::ClientClosed,
                    Some(Err(e)) => {
                        tracing::debug!(?e, channel_id = channel.id(), "ws read error");
                        return ChannelExit::TransportError;
                    }
                }
            }

            // Something from the group.
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(Utf8Bytes::from(&*frame))).await.is_err() {
                            return ChannelExit::TransportError;
                        }
                    }
                    None => return ChannelExit::DispatcherGone,
                }
            }

            // Liveness check.
            _ = ping_timer.tick() => {
                if last_seen.elapsed() >= idle_deadline {
                    tracing::debug!(channel_id = channel.id(), "idle timeout, closing connection");
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Idle timeout").await;
                    return ChannelExit::IdleTimeout;
                }
                if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                    return ChannelExit::TransportError;
                }
            }
        }
    }
}

async fn send_reply(ws_tx: &mut WsSink, reply: &ErrorReply) -> Result<(), axum::Error> {
    match to_frame(reply) {
        Some(frame) => ws_tx.send(Message::Text(Utf8Bytes::from(&*frame))).await,
        None => Ok(()),
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from(reason),
    }));
    ws_tx.send(close_msg).await
}
