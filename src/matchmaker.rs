// src/matchmaker.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{LOBBY_KEY_LIFETIME, PUBLIC_PAIR_STRING, new_lobby_key};
use crate::connection::{Connection, ConnectionMap, Counter};
use crate::game;
use crate::registry::TtlRegistry;

pub const MATCHMAKER_BUFFER_SIZE: usize = 64;

/// A group of connections bound for one game. Waiting lobbies accept and
/// lose members; once started, membership is frozen and the game engine owns
/// the players.
#[derive(Debug, Clone)]
pub struct Lobby {
    pub id: Uuid,
    pub pair_string: String,
    pub game_size: usize,
    pub players: Vec<Arc<Connection>>,
    pub created_at: DateTime<Utc>,
}

impl Lobby {
    fn new(pair_string: String, game_size: usize, first: Arc<Connection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pair_string,
            game_size,
            players: vec![first],
            created_at: Utc::now(),
        }
    }

    fn is_full(&self) -> bool {
        self.players.len() == self.game_size
    }
}

#[derive(Debug)]
pub enum MatchmakerMessage {
    Add {
        conn_id: Uuid,
    },
    Remove {
        conn_id: Uuid,
    },
    GameFinished {
        lobby_id: Uuid,
    },
    Snapshot {
        respond_to: oneshot::Sender<MatchmakerSnapshot>,
    },
    End,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchmakerSnapshot {
    /// Players currently waiting in public lobbies.
    pub queue_size: usize,
    pub private_games_waiting: usize,
    pub running_games: usize,
}

#[derive(Debug)]
struct RunningLobby {
    lobby: Lobby,
    engine: JoinHandle<()>,
}

pub struct MatchmakerActor {
    receiver: mpsc::Receiver<MatchmakerMessage>,
    game_size: usize,
    connections: ConnectionMap,
    games_played: Counter,
    public_lobbies: VecDeque<Lobby>,
    private_lobbies: HashMap<String, Lobby>,
    running: HashMap<Uuid, RunningLobby>,
    /// Started-lobby membership, for Remove-after-start lookups.
    lobby_of: HashMap<Uuid, Uuid>,
    self_handle: Option<MatchmakerHandle>,
}

impl MatchmakerActor {
    async fn handle_message(&mut self, msg: MatchmakerMessage) {
        match msg {
            MatchmakerMessage::Add { conn_id } => self.handle_add(conn_id).await,
            MatchmakerMessage::Remove { conn_id } => self.handle_remove(conn_id),
            MatchmakerMessage::GameFinished { lobby_id } => self.handle_game_finished(lobby_id),
            MatchmakerMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(MatchmakerSnapshot {
                    queue_size: self
                        .public_lobbies
                        .iter()
                        .map(|lobby| lobby.players.len())
                        .sum(),
                    private_games_waiting: self.private_lobbies.len(),
                    running_games: self.running.len(),
                });
            }
            // Consumed by the service loop.
            MatchmakerMessage::End => {}
        }
    }

    async fn handle_add(&mut self, conn_id: Uuid) {
        let Some(conn) = self.connections.get(&conn_id).await else {
            tracing::debug!(
                matchmaker.size = self.game_size,
                conn.id = %conn_id,
                "Add for a connection that already vanished, ignoring"
            );
            return;
        };
        let pair_string = conn.pair_string.clone();

        if pair_string == PUBLIC_PAIR_STRING {
            if self.public_lobbies.is_empty() {
                self.public_lobbies
                    .push_back(Lobby::new(pair_string, self.game_size, conn));
            } else if let Some(lobby) = self.public_lobbies.front_mut() {
                lobby.players.push(conn);
            }
            if self.public_lobbies.front().is_some_and(Lobby::is_full) {
                if let Some(lobby) = self.public_lobbies.pop_front() {
                    self.start_lobby(lobby);
                }
            }
        } else {
            match self.private_lobbies.entry(pair_string.clone()) {
                Entry::Occupied(mut entry) => entry.get_mut().players.push(conn),
                Entry::Vacant(entry) => {
                    entry.insert(Lobby::new(pair_string.clone(), self.game_size, conn));
                }
            }
            if self
                .private_lobbies
                .get(&pair_string)
                .is_some_and(Lobby::is_full)
            {
                if let Some(lobby) = self.private_lobbies.remove(&pair_string) {
                    self.start_lobby(lobby);
                }
            }
        }
    }

    fn handle_remove(&mut self, conn_id: Uuid) {
        for lobby in &mut self.public_lobbies {
            if let Some(pos) = lobby.players.iter().position(|p| p.id == conn_id) {
                lobby.players.remove(pos);
                tracing::debug!(
                    matchmaker.size = self.game_size,
                    conn.id = %conn_id,
                    lobby.id = %lobby.id,
                    "Removed player from waiting public lobby"
                );
            }
        }
        self.public_lobbies.retain(|lobby| !lobby.players.is_empty());

        let mut emptied_key = None;
        for (key, lobby) in &mut self.private_lobbies {
            if let Some(pos) = lobby.players.iter().position(|p| p.id == conn_id) {
                lobby.players.remove(pos);
                tracing::debug!(
                    matchmaker.size = self.game_size,
                    conn.id = %conn_id,
                    lobby.pair = %key,
                    "Removed player from waiting private lobby"
                );
                if lobby.players.is_empty() {
                    emptied_key = Some(key.clone());
                }
            }
        }
        if let Some(key) = emptied_key {
            self.private_lobbies.remove(&key);
        }

        // After start the engine notices the loss through broadcast failure;
        // here the lobby just stops being tracked as running.
        if let Some(lobby_id) = self.lobby_of.remove(&conn_id) {
            if let Some(running) = self.running.remove(&lobby_id) {
                tracing::info!(
                    matchmaker.size = self.game_size,
                    conn.id = %conn_id,
                    lobby.id = %lobby_id,
                    "Player left a started lobby, dropping it from the running set"
                );
                for player in &running.lobby.players {
                    self.lobby_of.remove(&player.id);
                }
            }
        }
    }

    fn handle_game_finished(&mut self, lobby_id: Uuid) {
        match self.running.remove(&lobby_id) {
            Some(running) => {
                for player in &running.lobby.players {
                    self.lobby_of.remove(&player.id);
                }
                tracing::info!(
                    matchmaker.size = self.game_size,
                    lobby.id = %lobby_id,
                    "Game over, lobby dropped"
                );
            }
            None => {
                tracing::debug!(
                    matchmaker.size = self.game_size,
                    lobby.id = %lobby_id,
                    "GameFinished for a lobby no longer tracked"
                );
            }
        }
    }

    /// WAITING → STARTED. Membership freezes, the session counter bumps, and
    /// the game engine takes over the players.
    fn start_lobby(&mut self, lobby: Lobby) {
        let Some(manager) = self.self_handle.clone() else {
            tracing::error!(
                matchmaker.size = self.game_size,
                lobby.id = %lobby.id,
                "Self handle not set, cannot dispatch game engine"
            );
            return;
        };
        self.games_played.increment();
        for player in &lobby.players {
            self.lobby_of.insert(player.id, lobby.id);
        }
        let waited = Utc::now().signed_duration_since(lobby.created_at);
        tracing::info!(
            matchmaker.size = self.game_size,
            lobby.id = %lobby.id,
            lobby.pair = %lobby.pair_string,
            lobby.waited_ms = waited.num_milliseconds(),
            "Lobby full, starting game"
        );
        let engine = game::spawn(lobby.clone(), manager);
        self.running.insert(lobby.id, RunningLobby { lobby, engine });
    }
}

pub async fn run_matchmaker_actor(mut actor: MatchmakerActor) {
    tracing::info!(matchmaker.size = actor.game_size, "Matchmaker actor started");
    while let Some(msg) = actor.receiver.recv().await {
        if matches!(msg, MatchmakerMessage::End) {
            break;
        }
        actor.handle_message(msg).await;
        // Keep long command bursts from starving sibling tasks.
        tokio::task::yield_now().await;
    }
    for (_, running) in actor.running.drain() {
        running.engine.abort();
    }
    tracing::info!(matchmaker.size = actor.game_size, "Matchmaker actor stopped");
}

/// Cheap clonable front for one matchmaker. The lobby-key registry rides on
/// the handle so the HTTP layer can validate keys without a command round
/// trip.
#[derive(Clone)]
pub struct MatchmakerHandle {
    sender: mpsc::Sender<MatchmakerMessage>,
    pub game_size: usize,
    pub lobby_keys: TtlRegistry<String, ()>,
}

impl MatchmakerHandle {
    pub fn new(game_size: usize, connections: ConnectionMap, games_played: Counter) -> Self {
        let (sender, receiver) = mpsc::channel(MATCHMAKER_BUFFER_SIZE);
        let mut actor = MatchmakerActor {
            receiver,
            game_size,
            connections,
            games_played,
            public_lobbies: VecDeque::new(),
            private_lobbies: HashMap::new(),
            running: HashMap::new(),
            lobby_of: HashMap::new(),
            self_handle: None,
        };
        let handle = Self {
            sender: sender.clone(),
            game_size,
            lobby_keys: TtlRegistry::new(LOBBY_KEY_LIFETIME),
        };
        actor.self_handle = Some(handle.clone());
        tokio::spawn(run_matchmaker_actor(actor));
        handle
    }

    pub async fn add(&self, conn_id: Uuid) {
        if self
            .sender
            .send(MatchmakerMessage::Add { conn_id })
            .await
            .is_err()
        {
            tracing::error!(conn.id = %conn_id, "Matchmaker gone, failed to send Add");
        }
    }

    pub async fn remove(&self, conn_id: Uuid) {
        if self
            .sender
            .send(MatchmakerMessage::Remove { conn_id })
            .await
            .is_err()
        {
            tracing::error!(conn.id = %conn_id, "Matchmaker gone, failed to send Remove");
        }
    }

    pub async fn game_finished(&self, lobby_id: Uuid) {
        if self
            .sender
            .send(MatchmakerMessage::GameFinished { lobby_id })
            .await
            .is_err()
        {
            tracing::error!(lobby.id = %lobby_id, "Matchmaker gone, failed to send GameFinished");
        }
    }

    pub async fn snapshot(&self) -> Option<MatchmakerSnapshot> {
        let (respond_to, rx) = oneshot::channel();
        if self
            .sender
            .send(MatchmakerMessage::Snapshot { respond_to })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    pub async fn end(&self) {
        let _ = self.sender.send(MatchmakerMessage::End).await;
    }

    /// Mints a fresh key in this matchmaker's registry.
    pub async fn create_lobby_key(&self) -> String {
        let key = new_lobby_key();
        self.lobby_keys.insert(key.clone(), ()).await;
        key
    }

    pub async fn owns_key(&self, key: &String) -> bool {
        self.lobby_keys.contains(key).await
    }
}
