// src/game.rs

use axum::extract::ws;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep, timeout, timeout_at};

use crate::connection::Connection;
use crate::matchmaker::{Lobby, MatchmakerHandle};

pub const FRAME_DELAY: Duration = Duration::from_millis(10);
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(300);
/// One-second ticks before the game is called on time.
pub const GAME_LIFETIME_SECS: u64 = 1203;

pub const MSG_GO: &str = "Go";
pub const MSG_TIMER: &str = "TIMER";
pub const MSG_TIMEOUT: &str = "TIMEOUT";
pub const MSG_FRAME_TIMEOUT: &str = "FRAME_TIMEOUT";
pub const MSG_DISCONNECT: &str = "DISCONNECT";
pub const MSG_RESIGN: &str = "RESIGN";

#[derive(Debug, Error)]
enum EngineError {
    #[error("peer gone")]
    PeerGone,
    #[error("frame deadline elapsed")]
    Deadline,
}

/// Why a running game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GameEnd {
    /// A client sent DISCONNECT or RESIGN; it was forwarded first.
    Control,
    FrameTimeout,
    PeerGone,
    TimeUp,
}

struct Seat {
    conn: Arc<Connection>,
    rx: mpsc::Receiver<ws::Message>,
}

pub fn spawn(lobby: Lobby, matchmaker: MatchmakerHandle) -> JoinHandle<()> {
    tokio::spawn(run(lobby, matchmaker))
}

async fn run(lobby: Lobby, matchmaker: MatchmakerHandle) {
    let lobby_id = lobby.id;
    let players: Vec<Arc<Connection>> = lobby.players.clone();
    tracing::info!(
        lobby.id = %lobby_id,
        lobby.pair = %lobby.pair_string,
        players = players.len(),
        "Game engine started"
    );

    match play(lobby).await {
        Ok(end) => {
            tracing::info!(lobby.id = %lobby_id, outcome = ?end, "Game over");
        }
        Err(error) => {
            tracing::info!(lobby.id = %lobby_id, error = %error, "Game never started");
        }
    }

    // Unblocks every handler regardless of how the game ended.
    for conn in &players {
        conn.signal_finished();
    }
    matchmaker.game_finished(lobby_id).await;
    tracing::debug!(lobby.id = %lobby_id, "Game engine stopped");
}

async fn play(lobby: Lobby) -> Result<GameEnd, EngineError> {
    let mut seats = Vec::with_capacity(lobby.players.len());
    for conn in &lobby.players {
        // The engine is the only taker; an empty slot means the handler died
        // before the game could begin.
        let rx = conn.take_inbound().await.ok_or(EngineError::PeerGone)?;
        seats.push(Seat {
            conn: Arc::clone(conn),
            rx,
        });
    }
    seats.shuffle(&mut rand::thread_rng());

    // The handshake spends whatever is left of the earliest joiner's startup
    // budget; it never re-arms the window.
    let startup_deadline = lobby
        .players
        .iter()
        .map(|conn| conn.startup_deadline)
        .min()
        .unwrap_or_else(|| Instant::now() + STARTUP_TIMEOUT);
    timeout_at(startup_deadline, handshake(&mut seats, &lobby.pair_string))
        .await
        .map_err(|_| EngineError::Deadline)??;

    for seat in &seats {
        seat.conn.mark_started();
    }

    let everyone: Vec<Arc<Connection>> = seats.iter().map(|seat| Arc::clone(&seat.conn)).collect();
    let mut loops: JoinSet<GameEnd> = JoinSet::new();
    for (index, seat) in seats.into_iter().enumerate() {
        loops.spawn(relay_loop(seat, index, everyone.clone()));
    }
    loops.spawn(timer_loop(everyone));

    // The first loop to return ends the game for everybody.
    let end = match loops.join_next().await {
        Some(Ok(end)) => end,
        _ => GameEnd::PeerGone,
    };
    loops.abort_all();
    while loops.join_next().await.is_some() {}
    Ok(end)
}

/// Seat-by-seat startup exchange: pair-string echo, ready, seat number, set;
/// seat 0 then gets "Go" and must answer before the relay begins.
async fn handshake(seats: &mut [Seat], pair_string: &str) -> Result<(), EngineError> {
    for (index, seat) in seats.iter_mut().enumerate() {
        send_frame(&seat.conn, ws::Message::Text(pair_string.to_owned().into())).await?;
        recv_frame(&mut seat.rx).await?;
        send_frame(
            &seat.conn,
            ws::Message::Text(format!("P{}", index + 1).into()),
        )
        .await?;
        recv_frame(&mut seat.rx).await?;
    }

    let first = seats.first_mut().ok_or(EngineError::PeerGone)?;
    send_frame(&first.conn, ws::Message::Text(MSG_GO.into())).await?;
    recv_frame(&mut first.rx).await?;
    Ok(())
}

async fn relay_loop(mut seat: Seat, index: usize, everyone: Vec<Arc<Connection>>) -> GameEnd {
    loop {
        sleep(FRAME_DELAY).await;
        let message = match timeout(FRAME_TIMEOUT, seat.rx.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(
                    conn.id = %seat.conn.id,
                    seat = index,
                    "Client channel closed mid-game"
                );
                return GameEnd::PeerGone;
            }
            Err(_) => {
                let _ = send_frame(&seat.conn, ws::Message::Text(MSG_FRAME_TIMEOUT.into())).await;
                tracing::info!(
                    conn.id = %seat.conn.id,
                    seat = index,
                    "Frame deadline elapsed"
                );
                return GameEnd::FrameTimeout;
            }
        };

        let control = is_control(&message);
        for (peer_index, peer) in everyone.iter().enumerate() {
            if peer_index == index {
                continue;
            }
            if send_frame(peer, message.clone()).await.is_err() {
                return GameEnd::PeerGone;
            }
        }
        if control {
            tracing::info!(
                conn.id = %seat.conn.id,
                seat = index,
                "Control message forwarded, ending game"
            );
            return GameEnd::Control;
        }
    }
}

/// Global game clock: a tick per second, each broadcast to everyone, then the
/// closing "TIMEOUT".
async fn timer_loop(everyone: Vec<Arc<Connection>>) -> GameEnd {
    for _ in 0..GAME_LIFETIME_SECS {
        sleep(Duration::from_secs(1)).await;
        if broadcast(&everyone, MSG_TIMER).await.is_err() {
            return GameEnd::PeerGone;
        }
    }
    let _ = broadcast(&everyone, MSG_TIMEOUT).await;
    GameEnd::TimeUp
}

fn is_control(message: &ws::Message) -> bool {
    matches!(
        message,
        ws::Message::Text(text) if text.as_str() == MSG_DISCONNECT || text.as_str() == MSG_RESIGN
    )
}

async fn broadcast(everyone: &[Arc<Connection>], text: &'static str) -> Result<(), EngineError> {
    for conn in everyone {
        send_frame(conn, ws::Message::Text(text.into())).await?;
    }
    Ok(())
}

async fn send_frame(conn: &Connection, message: ws::Message) -> Result<(), EngineError> {
    match timeout(FRAME_TIMEOUT, conn.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(EngineError::PeerGone),
        Err(_) => Err(EngineError::Deadline),
    }
}

async fn recv_frame(rx: &mut mpsc::Receiver<ws::Message>) -> Result<ws::Message, EngineError> {
    match timeout(FRAME_TIMEOUT, rx.recv()).await {
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(EngineError::PeerGone),
        Err(_) => Err(EngineError::Deadline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionMap, Counter};
    use crate::matchmaker::MatchmakerHandle;
    use chrono::Utc;
    use tokio::sync::mpsc::{Receiver, Sender};
    use uuid::Uuid;

    fn text(s: &str) -> ws::Message {
        ws::Message::Text(s.to_owned().into())
    }

    fn test_conn(pair: &str) -> (Arc<Connection>, Receiver<ws::Message>, Sender<ws::Message>) {
        let (out_tx, out_rx) = mpsc::channel(2048);
        let (in_tx, in_rx) = mpsc::channel(2048);
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        let conn = Connection::new(None, pair.to_string(), out_tx, in_rx, deadline);
        (conn, out_rx, in_tx)
    }

    fn test_lobby(players: Vec<Arc<Connection>>, pair: &str) -> Lobby {
        Lobby {
            id: Uuid::new_v4(),
            pair_string: pair.to_string(),
            game_size: players.len(),
            players,
            created_at: Utc::now(),
        }
    }

    fn test_matchmaker() -> MatchmakerHandle {
        MatchmakerHandle::new(2, ConnectionMap::new(), Counter::default())
    }

    /// Plays the client half of the startup exchange and reports the seat
    /// number this client was dealt.
    async fn client_handshake(
        out_rx: &mut Receiver<ws::Message>,
        in_tx: &Sender<ws::Message>,
        pair: &str,
    ) -> usize {
        let echo = out_rx.recv().await.expect("pair-string echo");
        match echo {
            ws::Message::Text(text) => assert_eq!(text.as_str(), pair),
            other => panic!("expected text echo, got {other:?}"),
        }
        in_tx.send(text("ready")).await.expect("send ready");

        let seat_msg = out_rx.recv().await.expect("seat number");
        let seat = match seat_msg {
            ws::Message::Text(text) => {
                let text = text.as_str();
                assert!(text.starts_with('P'), "unexpected frame {text:?}");
                text[1..].parse::<usize>().expect("seat digit")
            }
            other => panic!("expected seat number, got {other:?}"),
        };
        in_tx.send(text("set")).await.expect("send set");

        if seat == 1 {
            let go = out_rx.recv().await.expect("Go frame");
            match go {
                ws::Message::Text(text) => assert_eq!(text.as_str(), MSG_GO),
                other => panic!("expected Go, got {other:?}"),
            }
            in_tx.send(text("start")).await.expect("send start");
        }
        seat
    }

    /// Receives until a non-TIMER frame shows up.
    async fn next_game_frame(out_rx: &mut Receiver<ws::Message>) -> ws::Message {
        loop {
            let message = out_rx.recv().await.expect("game frame");
            if let ws::Message::Text(text) = &message {
                if text.as_str() == MSG_TIMER {
                    continue;
                }
            }
            return message;
        }
    }

    #[tokio::test]
    async fn handshake_relay_and_resign() {
        let (conn_a, mut out_a, in_a) = test_conn("default");
        let (conn_b, mut out_b, in_b) = test_conn("default");
        let lobby = test_lobby(vec![Arc::clone(&conn_a), Arc::clone(&conn_b)], "default");
        let engine = spawn(lobby, test_matchmaker());

        let (seat_a, seat_b) = tokio::join!(
            client_handshake(&mut out_a, &in_a, "default"),
            client_handshake(&mut out_b, &in_b, "default"),
        );
        let mut seats = vec![seat_a, seat_b];
        seats.sort_unstable();
        assert_eq!(seats, vec![1, 2], "seat numbers are a permutation");

        assert!(conn_a.started());
        assert!(conn_b.started());

        // The seat that got "Go" opens; the peer must receive the exact bytes.
        let (first_in, second_out) = if seat_a == 1 {
            (&in_a, &mut out_b)
        } else {
            (&in_b, &mut out_a)
        };
        let payload = vec![0x01, 0x02, 0x03];
        first_in
            .send(ws::Message::Binary(payload.clone().into()))
            .await
            .expect("send payload");
        match next_game_frame(second_out).await {
            ws::Message::Binary(bytes) => assert_eq!(&bytes[..], &payload[..]),
            other => panic!("expected relayed payload, got {other:?}"),
        }

        first_in.send(text(MSG_RESIGN)).await.expect("send resign");
        match next_game_frame(second_out).await {
            ws::Message::Text(text) => assert_eq!(text.as_str(), MSG_RESIGN),
            other => panic!("expected forwarded RESIGN, got {other:?}"),
        }

        engine.await.expect("engine exits after resign");
        assert!(conn_a.finished());
        assert!(conn_b.finished());
    }

    #[tokio::test]
    async fn four_player_relay_reaches_every_peer() {
        let mut conns = Vec::new();
        let mut outs = Vec::new();
        let mut ins = Vec::new();
        for _ in 0..4 {
            let (conn, out_rx, in_tx) = test_conn("default");
            conns.push(conn);
            outs.push(out_rx);
            ins.push(in_tx);
        }
        let lobby = test_lobby(conns.clone(), "default");
        let engine = spawn(lobby, test_matchmaker());

        let mut out_iter = outs.iter_mut();
        let (out_a, out_b, out_c, out_d) = (
            out_iter.next().expect("a"),
            out_iter.next().expect("b"),
            out_iter.next().expect("c"),
            out_iter.next().expect("d"),
        );
        let seats = tokio::join!(
            client_handshake(out_a, &ins[0], "default"),
            client_handshake(out_b, &ins[1], "default"),
            client_handshake(out_c, &ins[2], "default"),
            client_handshake(out_d, &ins[3], "default"),
        );
        let mut sorted = vec![seats.0, seats.1, seats.2, seats.3];
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 3, 4], "seats are a permutation of 1..=4");

        // A frame from the opener reaches the other three seats byte-for-byte.
        let seats = [seats.0, seats.1, seats.2, seats.3];
        let opener = seats.iter().position(|&s| s == 1).expect("seat 1 exists");
        let payload = vec![0xAA, 0xBB, 0xCC];
        ins[opener]
            .send(ws::Message::Binary(payload.clone().into()))
            .await
            .expect("send payload");
        for (index, out_rx) in outs.iter_mut().enumerate() {
            if index == opener {
                continue;
            }
            match next_game_frame(out_rx).await {
                ws::Message::Binary(bytes) => assert_eq!(&bytes[..], &payload[..]),
                other => panic!("expected relayed payload, got {other:?}"),
            }
        }

        ins[opener]
            .send(text(MSG_DISCONNECT))
            .await
            .expect("send disconnect");
        engine.await.expect("engine exits after disconnect");
        for conn in &conns {
            assert!(conn.finished());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_seat_triggers_frame_timeout() {
        let (conn_a, mut out_a, in_a) = test_conn("default");
        let (conn_b, mut out_b, in_b) = test_conn("default");
        let lobby = test_lobby(vec![Arc::clone(&conn_a), Arc::clone(&conn_b)], "default");
        let engine = spawn(lobby, test_matchmaker());

        tokio::join!(
            client_handshake(&mut out_a, &in_a, "default"),
            client_handshake(&mut out_b, &in_b, "default"),
        );

        // Nobody sends a frame; the watchdog must end the game.
        engine.await.expect("engine exits on frame timeout");
        assert!(conn_a.finished());
        assert!(conn_b.finished());

        let mut saw_frame_timeout = false;
        for out_rx in [&mut out_a, &mut out_b] {
            while let Ok(message) = out_rx.try_recv() {
                if let ws::Message::Text(text) = message {
                    if text.as_str() == MSG_FRAME_TIMEOUT {
                        saw_frame_timeout = true;
                    }
                }
            }
        }
        assert!(saw_frame_timeout, "silent seat is told FRAME_TIMEOUT");
    }

    #[tokio::test(start_paused = true)]
    async fn game_clock_expires_with_timeout_broadcast() {
        let (conn_a, mut out_a, in_a) = test_conn("default");
        let (conn_b, mut out_b, in_b) = test_conn("default");
        let lobby = test_lobby(vec![Arc::clone(&conn_a), Arc::clone(&conn_b)], "default");
        let engine = spawn(lobby, test_matchmaker());

        tokio::join!(
            client_handshake(&mut out_a, &in_a, "default"),
            client_handshake(&mut out_b, &in_b, "default"),
        );

        // Each client keeps the watchdog fed and counts clock ticks until the
        // closing broadcast.
        async fn run_client(
            mut out_rx: Receiver<ws::Message>,
            in_tx: Sender<ws::Message>,
        ) -> (u64, bool) {
            let mut timers = 0u64;
            let mut feeder = tokio::time::interval(Duration::from_secs(4));
            feeder.tick().await;
            loop {
                tokio::select! {
                    _ = feeder.tick() => {
                        if in_tx.send(ws::Message::Binary(vec![0u8].into())).await.is_err() {
                            return (timers, false);
                        }
                    }
                    message = out_rx.recv() => match message {
                        Some(ws::Message::Text(text)) if text.as_str() == MSG_TIMER => timers += 1,
                        Some(ws::Message::Text(text)) if text.as_str() == MSG_TIMEOUT => {
                            return (timers, true);
                        }
                        Some(_) => {}
                        None => return (timers, false),
                    },
                }
            }
        }

        let client_a = tokio::spawn(run_client(out_a, in_a));
        let client_b = tokio::spawn(run_client(out_b, in_b));

        let (timers_a, timed_out_a) = client_a.await.expect("client a");
        let (timers_b, timed_out_b) = client_b.await.expect("client b");
        assert!(timed_out_a && timed_out_b, "both receive the TIMEOUT broadcast");
        assert_eq!(timers_a, GAME_LIFETIME_SECS);
        assert_eq!(timers_b, GAME_LIFETIME_SECS);

        engine.await.expect("engine exits when the clock runs out");
        assert!(conn_a.finished());
        assert!(conn_b.finished());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_handshake_tears_down() {
        let (conn_a, _out_a, _in_a) = test_conn("default");
        let (conn_b, _out_b, _in_b) = test_conn("default");
        let lobby = test_lobby(vec![Arc::clone(&conn_a), Arc::clone(&conn_b)], "default");
        let engine = spawn(lobby, test_matchmaker());

        engine.await.expect("engine gives up");
        assert!(!conn_a.started());
        assert!(!conn_b.started());
        assert!(conn_a.finished());
        assert!(conn_b.finished());
    }
}
