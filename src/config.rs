// src/config.rs

use config::{Config, Environment};
use serde::Deserialize;

use crate::error::{ConfigError, Result as AppResult};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub web_root: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaConfig {
    pub project_id: String,
    pub site_key: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    pub server: ServerConfig,
    pub captcha: CaptchaConfig,
}

pub fn load_settings(test_mode: bool) -> AppResult<AppSettings> {
    let settings = Config::builder()
        .add_source(
            Environment::with_prefix("MATCHPOINT")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .try_parsing(true),
        )
        // Defaults for fields not set in the environment.
        .set_default("server.port", 8080)?
        .set_default("server.cors_origins", Vec::<String>::new())?
        .set_default("server.web_root", "web")?
        .set_default("captcha.project_id", "")?
        .set_default("captcha.site_key", "")?
        .set_default("captcha.api_key", "")?
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let app_settings: AppSettings = settings
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    // The captcha credentials only become optional when the gateway is
    // disabled outright.
    if !test_mode {
        if app_settings.captcha.project_id.is_empty() {
            return Err(ConfigError::Missing("captcha.project_id".to_string()).into());
        }
        if app_settings.captcha.site_key.is_empty() {
            return Err(ConfigError::Missing("captcha.site_key".to_string()).into());
        }
        if app_settings.captcha.api_key.is_empty() {
            return Err(ConfigError::Missing("captcha.api_key".to_string()).into());
        }
    }

    Ok(app_settings)
}
