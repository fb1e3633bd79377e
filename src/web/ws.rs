use axum::extract::ws::{self, CloseFrame, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use crate::auth::TOKEN_LENGTH;
use crate::connection::{Connection, FRAME_CHANNEL_CAPACITY};
use crate::game::STARTUP_TIMEOUT;
use crate::matchmaker::MatchmakerHandle;
use crate::state::AppState;

pub const NUMPLAYERS_REFRESH_TIME: Duration = Duration::from_secs(10);
pub const MAX_NUMPLAYERS_REFRESHES: usize = 360;

const CLOSE_INTERNAL_ERROR: u16 = 1011;

pub async fn game_ws_handler(
    ws_upgrade: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(app_state): State<AppState>,
) -> impl IntoResponse {
    let matchmaker = app_state.matchmaker_duo.clone();
    ws_upgrade.on_upgrade(move |socket| handle_game_socket(socket, remote, app_state, matchmaker))
}

pub async fn fourplayer_ws_handler(
    ws_upgrade: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(app_state): State<AppState>,
) -> impl IntoResponse {
    let matchmaker = app_state.matchmaker_quad.clone();
    ws_upgrade.on_upgrade(move |socket| handle_game_socket(socket, remote, app_state, matchmaker))
}

/// Admits a game websocket (one-shot ticket, then pair string), registers the
/// connection, and parks until the matchmaker and game engine are done with
/// it. Every exit path unwinds the live map, the matchmaker, and the
/// players-online count.
async fn handle_game_socket(
    socket: WebSocket,
    remote: SocketAddr,
    app_state: AppState,
    matchmaker: MatchmakerHandle,
) {
    let _online = app_state.players_online.enter();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // One continuous startup budget: admission, matchmaking, and the lobby
    // handshake all spend from this deadline; no phase re-arms it.
    let startup_deadline = Instant::now() + STARTUP_TIMEOUT;

    let admitted = timeout_at(startup_deadline, admit(&mut ws_receiver, remote, &app_state)).await;
    let pair_string = match admitted {
        Ok(Some(pair_string)) => pair_string,
        Ok(None) => {
            close_rejected(&mut ws_sender).await;
            return;
        }
        Err(_) => {
            let _ = ws_sender.close().await;
            return;
        }
    };

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ws::Message>(FRAME_CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel::<ws::Message>(FRAME_CHANNEL_CAPACITY);
    let conn = Connection::new(
        Some(remote),
        pair_string,
        outgoing_tx,
        inbound_rx,
        startup_deadline,
    );
    let conn_id = conn.id;
    let mut started_rx = conn.subscribe_started();
    let mut finished_rx = conn.subscribe_finished();
    app_state.connections.insert(Arc::clone(&conn)).await;

    tracing::info!(
        client.addr = %remote,
        conn.id = %conn_id,
        conn.pair = %conn.pair_string,
        "Connection admitted"
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut recv_task = tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(message)) => {
                    if matches!(message, ws::Message::Close(_)) {
                        break;
                    }
                    let forward =
                        matches!(message, ws::Message::Text(_) | ws::Message::Binary(_));
                    if forward && inbound_tx.send(message).await.is_err() {
                        // The engine dropped its receiving half; the game is
                        // over for this connection.
                        break;
                    }
                }
                Some(Err(error)) => {
                    tracing::debug!(conn.id = %conn_id, error = %error, "Websocket receive error");
                    break;
                }
                None => break,
            }
        }
    });

    matchmaker.add(conn_id).await;

    // Matchmaking phase: the remainder of the startup budget. A connection
    // that never reaches a started game is cut loose when it runs out.
    let matchmaking = timeout_at(startup_deadline, async {
        tokio::select! {
            result = started_rx.wait_for(|started| *started) => result.is_ok(),
            _ = finished_rx.wait_for(|finished| *finished) => false,
            _ = &mut send_task => false,
            _ = &mut recv_task => false,
        }
    })
    .await;

    if matches!(matchmaking, Ok(true)) {
        // Game phase: the engine's lifetime timer bounds this wait.
        tokio::select! {
            _ = finished_rx.wait_for(|finished| *finished) => {}
            _ = &mut send_task => {}
            _ = &mut recv_task => {}
        }
    }

    // Unconditional teardown; Remove is a no-op for ids the matchmaker no
    // longer tracks.
    matchmaker.remove(conn_id).await;
    app_state.connections.remove(&conn_id).await;
    send_task.abort();
    recv_task.abort();
    tracing::info!(client.addr = %remote, conn.id = %conn_id, "Connection closed");
}

/// First frame: the ticket, consumed from the registry exactly once. Second
/// frame: the pair string. Rejections are deliberately uniform.
async fn admit(
    ws_receiver: &mut SplitStream<WebSocket>,
    remote: SocketAddr,
    app_state: &AppState,
) -> Option<String> {
    let ticket = match ws_receiver.next().await {
        Some(Ok(ws::Message::Text(text))) => text,
        _ => return None,
    };
    if ticket.as_str().len() != TOKEN_LENGTH {
        tracing::info!(client.addr = %remote, "Rejected ticket of wrong length");
        return None;
    }
    let ticket_value = ticket.as_str().to_string();
    let Some(claim) = app_state.tickets.take_if_present(&ticket_value).await else {
        tracing::info!(client.addr = %remote, "Rejected unknown or expired ticket");
        return None;
    };
    if !claim.matches_addr(Some(remote.ip())) {
        tracing::info!(client.addr = %remote, "Rejected ticket issued to a different address");
        return None;
    }
    let age = chrono::Utc::now().signed_duration_since(claim.issued_at);
    tracing::debug!(
        client.addr = %remote,
        ticket.age_ms = age.num_milliseconds(),
        "Ticket consumed"
    );

    match ws_receiver.next().await {
        Some(Ok(ws::Message::Text(text))) => Some(text.as_str().to_string()),
        _ => None,
    }
}

async fn close_rejected(ws_sender: &mut SplitSink<WebSocket, ws::Message>) {
    let frame = CloseFrame {
        code: CLOSE_INTERNAL_ERROR,
        reason: "invalid ticket".into(),
    };
    let _ = ws_sender.send(ws::Message::Close(Some(frame))).await;
}

/// Pushes the live player count to a homepage viewer at a fixed cadence for a
/// bounded number of refreshes. Client frames are ignored; the viewer count
/// always unwinds through the gauge guard.
pub async fn playercount_ws_handler(
    ws_upgrade: WebSocketUpgrade,
    State(app_state): State<AppState>,
) -> impl IntoResponse {
    ws_upgrade.on_upgrade(move |socket| handle_playercount_socket(socket, app_state))
}

async fn handle_playercount_socket(mut socket: WebSocket, app_state: AppState) {
    let _viewer = app_state.on_homepage.enter();

    'refreshes: for _ in 0..MAX_NUMPLAYERS_REFRESHES {
        let message = format!("Players Online: {}", app_state.players_online.value());
        if socket.send(ws::Message::Text(message.into())).await.is_err() {
            break;
        }

        let pause = tokio::time::sleep(NUMPLAYERS_REFRESH_TIME);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                _ = &mut pause => break,
                incoming = socket.recv() => match incoming {
                    Some(Ok(ws::Message::Close(_))) | Some(Err(_)) | None => break 'refreshes,
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}
