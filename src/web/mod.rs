use axum::{
    Router,
    routing::{any, get, post},
};
use http::HeaderValue;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::{ConfigError, Result as AppResult};
use crate::state::AppState;

pub mod error;
pub mod handlers;
pub mod ws;

pub use self::error::{Result as WebResult, WebError};

/// Route table shared by the server and the handler tests. The rate limiter
/// and middleware stack are layered on in `serve_on`.
pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/action", post(handlers::action_handler))
        .route("/g/{lobby_key}", get(handlers::lobby_key_handler))
        .route("/serverinfo", get(handlers::serverinfo_handler))
        .route("/game", any(ws::game_ws_handler))
        .route("/fourplayergame", any(ws::fourplayer_ws_handler))
        .route("/playercount", any(ws::playercount_ws_handler))
        .route("/", get(handlers::homepage_handler))
        .route("/{*file_path}", get(handlers::static_handler))
        .with_state(app_state)
}

pub async fn run_server(app_state: AppState, server_config: &ServerConfig) -> AppResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(listener, app_state, server_config).await
}

/// Serves on an already-bound listener; the tests bind an ephemeral port and
/// call this directly.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    app_state: AppState,
    server_config: &ServerConfig,
) -> AppResult<()> {
    let cors_origins_result: Result<Vec<HeaderValue>, _> = server_config
        .cors_origins
        .iter()
        .map(|origin| {
            origin
                .parse()
                .map_err(|e| format!("Invalid CORS origin '{origin}': {e}"))
        })
        .collect();

    let cors_origins = cors_origins_result.unwrap_or_else(|e| {
        tracing::error!("CORS config error: {}. Defaulting to restrictive.", e);
        vec![]
    });

    let cors = if !cors_origins.is_empty() {
        CorsLayer::new()
            .allow_methods(vec![http::Method::GET, http::Method::POST])
            .allow_origin(cors_origins)
            .allow_credentials(true)
            .allow_headers(vec![http::header::CONTENT_TYPE, http::header::ACCEPT])
    } else {
        CorsLayer::new()
    };

    // Per-IP request throttle. Game traffic rides on websocket frames, so
    // this only bounds how fast one address can hit the HTTP surface.
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(2)
            .burst_size(16)
            .finish()
            .ok_or_else(|| ConfigError::InvalidValue("rate limiter settings".to_string()))?,
    );

    let app = router(app_state)
        .layer(GovernorLayer {
            config: governor_config,
        })
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new());

    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Listening on {}", addr);
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(Into::into)
}
