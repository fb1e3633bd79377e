// src/main.rs

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use matchpoint::captcha::{CaptchaDisabled, CaptchaVerifier, RecaptchaEnterprise};
use matchpoint::error::Result as AppResult;
use matchpoint::state::AppState;
use matchpoint::{config, web};

#[tokio::main]
async fn main() -> AppResult<()> {
    let test_mode = std::env::args().any(|arg| arg == "--test");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_PKG_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = config::load_settings(test_mode)?;
    if test_mode {
        tracing::warn!("Test mode: captcha disabled, static files served from the web root");
    }

    let captcha: Arc<dyn CaptchaVerifier> = if test_mode {
        Arc::new(CaptchaDisabled)
    } else {
        Arc::new(RecaptchaEnterprise::new(settings.captcha.clone()))
    };

    let server_config = settings.server.clone();
    let app_state = AppState::new(settings, captcha, test_mode);

    web::run_server(app_state, &server_config).await
}
