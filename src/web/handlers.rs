use axum::Form;
use axum::extract::rejection::FormRejection;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::response::{Json, Response};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::error::{Result as WebResult, WebError};
use crate::auth::{LOBBY_KEY_MAX_LENGTH, PUBLIC_PAIR_STRING};
use crate::pages;
use crate::state::AppState;

#[derive(Deserialize, Debug, Default)]
pub struct ActionQuery {
    pub a: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ActionForm {
    #[serde(rename = "recaptcha-token", default)]
    pub recaptcha_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GameMode {
    Public,
    Private,
    FourPlayer,
    FourPlayerPrivate,
}

impl GameMode {
    fn from_action(action: &str) -> Option<Self> {
        match action {
            "public" => Some(GameMode::Public),
            "private" => Some(GameMode::Private),
            "fourplayer" => Some(GameMode::FourPlayer),
            "fourplayerprivate" => Some(GameMode::FourPlayerPrivate),
            _ => None,
        }
    }

    fn game_size(self) -> usize {
        match self {
            GameMode::Public | GameMode::Private => 2,
            GameMode::FourPlayer | GameMode::FourPlayerPrivate => 4,
        }
    }

    fn is_private(self) -> bool {
        matches!(self, GameMode::Private | GameMode::FourPlayerPrivate)
    }
}

/// Captcha-gated entry point: hands out a ticket and the play page for the
/// public queues, or a lobby key and the private page for the private rooms.
pub async fn action_handler(
    State(app_state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<ActionQuery>,
    form: Result<Form<ActionForm>, FormRejection>,
) -> WebResult<Response> {
    let action = query.a.unwrap_or_default();
    let form = form
        .map_err(|rejection| WebError::BadRequest(rejection.to_string()))?
        .0;

    if !app_state.test_mode {
        if action.is_empty() || form.recaptcha_token.is_empty() {
            return Err(WebError::BadRequest(
                "missing action or captcha token".to_string(),
            ));
        }
        app_state
            .captcha
            .verify(&form.recaptcha_token, &action)
            .await
            .map_err(|error| {
                tracing::info!(client.addr = %remote, error = %error, "Captcha verification failed");
                WebError::Unauthorized("failed captcha".to_string())
            })?;
    }

    let Some(mode) = GameMode::from_action(&action) else {
        return Err(WebError::NotFound);
    };
    let matchmaker = app_state.matchmaker_for_size(mode.game_size());

    if mode.is_private() {
        let lobby_key = matchmaker.create_lobby_key().await;
        tracing::info!(
            client.addr = %remote,
            lobby.key = %lobby_key,
            players = mode.game_size(),
            "Issued lobby key"
        );
        let page = pages::render(
            app_state.web_root(),
            "private.html",
            &[(pages::KEY_PLACEHOLDER, lobby_key.as_str())],
            false,
        )
        .await?;
        Ok(page)
    } else {
        let ticket = app_state.issue_ticket(Some(remote.ip())).await;
        tracing::info!(
            client.addr = %remote,
            players = mode.game_size(),
            "Issued ticket for the public queue"
        );
        let players = mode.game_size().to_string();
        let page = pages::render(
            app_state.web_root(),
            "play.html",
            &[
                (pages::TOKEN_PLACEHOLDER, ticket.as_str()),
                (pages::PSTR_PLACEHOLDER, PUBLIC_PAIR_STRING),
                (pages::PLAYERS_PLACEHOLDER, players.as_str()),
            ],
            true,
        )
        .await?;
        Ok(page)
    }
}

/// A valid lobby key turns into a play page with a fresh ticket; the key
/// keeps working until its TTL, so a room can refill after its game started.
pub async fn lobby_key_handler(
    State(app_state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(lobby_key): Path<String>,
) -> WebResult<Response> {
    if lobby_key.len() > LOBBY_KEY_MAX_LENGTH {
        return Err(WebError::NotFound);
    }
    let Some(matchmaker) = app_state.matchmaker_owning_key(&lobby_key).await else {
        return Err(WebError::NotFound);
    };

    let ticket = app_state.issue_ticket(Some(remote.ip())).await;
    tracing::info!(
        client.addr = %remote,
        lobby.key = %lobby_key,
        players = matchmaker.game_size,
        "Issued ticket for a private room"
    );
    let players = matchmaker.game_size.to_string();
    let page = pages::render(
        app_state.web_root(),
        "play.html",
        &[
            (pages::TOKEN_PLACEHOLDER, ticket.as_str()),
            (pages::PSTR_PLACEHOLDER, lobby_key.as_str()),
            (pages::PLAYERS_PLACEHOLDER, players.as_str()),
        ],
        true,
    )
    .await?;
    Ok(page)
}

#[derive(Serialize, Debug)]
pub struct ServerInfo {
    pub players_online: usize,
    pub on_homepage: usize,
    pub tokens_active: usize,
    pub lobby_keys_active: usize,
    pub queue_size: usize,
    pub private_games_waiting: usize,
    pub session_games_played: usize,
}

pub async fn serverinfo_handler(State(app_state): State<AppState>) -> Json<ServerInfo> {
    let duo = app_state.matchmaker_duo.snapshot().await.unwrap_or_default();
    let quad = app_state
        .matchmaker_quad
        .snapshot()
        .await
        .unwrap_or_default();

    Json(ServerInfo {
        players_online: app_state.players_online.value(),
        on_homepage: app_state.on_homepage.value(),
        tokens_active: app_state.tickets.len().await,
        lobby_keys_active: app_state.lobby_keys_active().await,
        queue_size: duo.queue_size + quad.queue_size,
        private_games_waiting: duo.private_games_waiting + quad.private_games_waiting,
        session_games_played: app_state.games_played.value(),
    })
}

pub async fn homepage_handler(State(app_state): State<AppState>) -> WebResult<Response> {
    static_file(&app_state, "index.html").await
}

pub async fn static_handler(
    State(app_state): State<AppState>,
    Path(file_path): Path<String>,
) -> WebResult<Response> {
    static_file(&app_state, &file_path).await
}

/// Test-mode-only static serving; the files that normally trigger the
/// captcha widget are rewritten to submit their forms directly.
async fn static_file(app_state: &AppState, rel_path: &str) -> WebResult<Response> {
    if !app_state.test_mode {
        return Err(WebError::NotFound);
    }

    let site_key = app_state.settings.captcha.site_key.as_str();
    let script_tag = format!(
        "<script src=\"https://www.recaptcha.net/recaptcha/enterprise.js?render={site_key}\"></script>"
    );
    let mut rewrites: Vec<(&str, &str)> = vec![("SITE_KEY_PLACEHOLDER", site_key)];
    if pages::NO_CAPTCHA_REWRITE_FILES.contains(&rel_path) {
        rewrites.push((
            "buttonClick(\"public\")",
            "document.getElementById(\"publicform\").submit()",
        ));
        rewrites.push((
            "buttonClick(\"private\")",
            "document.getElementById(\"privateform\").submit()",
        ));
        rewrites.push((script_tag.as_str(), ""));
    }

    let rel = format!("static/{rel_path}");
    let page = pages::render(app_state.web_root(), &rel, &rewrites, false).await?;
    Ok(page)
}
