use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::auth::{self, TOKEN_LIFETIME, TicketClaim};
use crate::captcha::CaptchaVerifier;
use crate::config::AppSettings;
use crate::connection::{ConnectionMap, Counter, Gauge};
use crate::matchmaker::MatchmakerHandle;
use crate::registry::TtlRegistry;

#[derive(Clone)]
pub struct AppState {
    pub matchmaker_duo: MatchmakerHandle,
    pub matchmaker_quad: MatchmakerHandle,
    pub tickets: TtlRegistry<String, TicketClaim>,
    pub connections: ConnectionMap,
    pub players_online: Gauge,
    pub on_homepage: Gauge,
    pub games_played: Counter,
    pub captcha: Arc<dyn CaptchaVerifier>,
    pub settings: Arc<AppSettings>,
    pub test_mode: bool,
    web_root: Arc<PathBuf>,
}

impl AppState {
    pub fn new(settings: AppSettings, captcha: Arc<dyn CaptchaVerifier>, test_mode: bool) -> Self {
        let connections = ConnectionMap::new();
        let games_played = Counter::default();
        let web_root = Arc::new(PathBuf::from(&settings.server.web_root));
        Self {
            matchmaker_duo: MatchmakerHandle::new(2, connections.clone(), games_played.clone()),
            matchmaker_quad: MatchmakerHandle::new(4, connections.clone(), games_played.clone()),
            tickets: TtlRegistry::new(TOKEN_LIFETIME),
            connections,
            players_online: Gauge::default(),
            on_homepage: Gauge::default(),
            games_played,
            captcha,
            settings: Arc::new(settings),
            test_mode,
            web_root,
        }
    }

    pub fn web_root(&self) -> &Path {
        &self.web_root
    }

    pub fn matchmaker_for_size(&self, game_size: usize) -> &MatchmakerHandle {
        if game_size == 4 {
            &self.matchmaker_quad
        } else {
            &self.matchmaker_duo
        }
    }

    /// A lobby key belongs to whichever matchmaker minted it; that decides
    /// the game size served for `/g/{key}`.
    pub async fn matchmaker_owning_key(&self, lobby_key: &str) -> Option<&MatchmakerHandle> {
        let key = lobby_key.to_string();
        if self.matchmaker_duo.owns_key(&key).await {
            Some(&self.matchmaker_duo)
        } else if self.matchmaker_quad.owns_key(&key).await {
            Some(&self.matchmaker_quad)
        } else {
            None
        }
    }

    pub async fn issue_ticket(&self, issued_to: Option<IpAddr>) -> String {
        let ticket = auth::new_ticket_value();
        self.tickets
            .insert(ticket.clone(), TicketClaim::new(issued_to))
            .await;
        ticket
    }

    pub async fn lobby_keys_active(&self) -> usize {
        self.matchmaker_duo.lobby_keys.len().await + self.matchmaker_quad.lobby_keys.len().await
    }
}
