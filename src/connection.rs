// src/connection.rs

use axum::extract::ws;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

/// Frames buffered between a socket pump task and the game engine.
pub const FRAME_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
#[error("peer connection is gone")]
pub struct PeerGone;

/// One admitted websocket. The handler task owns the socket itself; everyone
/// else talks to the client through the channels carried here. The inbound
/// half is taken by the game engine once the matchmaker commits the
/// connection to a started lobby.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub remote_addr: Option<SocketAddr>,
    pub pair_string: String,
    pub accepted_at: DateTime<Utc>,
    /// When the startup budget runs out. Armed once at the first ticket
    /// frame; admission, matchmaking, and the lobby handshake all spend from
    /// this same deadline.
    pub startup_deadline: Instant,
    outgoing: mpsc::Sender<ws::Message>,
    inbound: Mutex<Option<mpsc::Receiver<ws::Message>>>,
    started_tx: watch::Sender<bool>,
    finished_tx: watch::Sender<bool>,
}

impl Connection {
    pub fn new(
        remote_addr: Option<SocketAddr>,
        pair_string: String,
        outgoing: mpsc::Sender<ws::Message>,
        inbound: mpsc::Receiver<ws::Message>,
        startup_deadline: Instant,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            remote_addr,
            pair_string,
            accepted_at: Utc::now(),
            startup_deadline,
            outgoing,
            inbound: Mutex::new(Some(inbound)),
            started_tx: watch::channel(false).0,
            finished_tx: watch::channel(false).0,
        })
    }

    /// Queue a frame for the client. Fails once the socket pump is gone.
    pub async fn send(&self, message: ws::Message) -> Result<(), PeerGone> {
        self.outgoing.send(message).await.map_err(|_| PeerGone)
    }

    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<ws::Message>> {
        self.inbound.lock().await.take()
    }

    pub fn mark_started(&self) {
        let _ = self.started_tx.send(true);
    }

    pub fn started(&self) -> bool {
        *self.started_tx.borrow()
    }

    pub fn subscribe_started(&self) -> watch::Receiver<bool> {
        self.started_tx.subscribe()
    }

    pub fn signal_finished(&self) {
        let _ = self.finished_tx.send(true);
    }

    pub fn finished(&self) -> bool {
        *self.finished_tx.borrow()
    }

    pub fn subscribe_finished(&self) -> watch::Receiver<bool> {
        self.finished_tx.subscribe()
    }
}

/// Live admitted connections, keyed by id. The matchmaker resolves command
/// ids against this map and ignores ids that have already vanished.
#[derive(Clone, Debug, Default)]
pub struct ConnectionMap {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Connection>>>>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conn: Arc<Connection>) {
        self.inner.lock().await.insert(conn.id, conn);
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.inner.lock().await.remove(id)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.inner.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Occupancy counter whose decrement rides on guard drop, so cancellation of
/// the owning task can never skip it.
#[derive(Clone, Debug, Default)]
pub struct Gauge(Arc<AtomicUsize>);

impl Gauge {
    pub fn enter(&self) -> GaugeGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        GaugeGuard(Arc::clone(&self.0))
    }

    pub fn value(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct GaugeGuard(Arc<AtomicUsize>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Monotonic session counter (games played).
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn value(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_restores_on_guard_drop() {
        let gauge = Gauge::default();
        assert_eq!(gauge.value(), 0);
        {
            let _a = gauge.enter();
            let _b = gauge.enter();
            assert_eq!(gauge.value(), 2);
        }
        assert_eq!(gauge.value(), 0);
    }

    #[test]
    fn gauge_restores_even_when_task_panics() {
        let gauge = Gauge::default();
        let clone = gauge.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = clone.enter();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(gauge.value(), 0);
    }

    #[tokio::test]
    async fn inbound_half_is_taken_once() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (_in_tx, in_rx) = mpsc::channel(4);
        let deadline = Instant::now() + crate::game::STARTUP_TIMEOUT;
        let conn = Connection::new(None, "default".to_string(), out_tx, in_rx, deadline);

        assert!(conn.take_inbound().await.is_some());
        assert!(conn.take_inbound().await.is_none());
    }

    #[tokio::test]
    async fn events_latch() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (_in_tx, in_rx) = mpsc::channel(4);
        let deadline = Instant::now() + crate::game::STARTUP_TIMEOUT;
        let conn = Connection::new(None, "default".to_string(), out_tx, in_rx, deadline);

        let mut finished_rx = conn.subscribe_finished();
        assert!(!conn.started());
        assert!(!conn.finished());

        conn.mark_started();
        conn.signal_finished();
        assert!(conn.started());
        assert!(conn.finished());
        assert!(finished_rx.wait_for(|finished| *finished).await.is_ok());
    }
}
