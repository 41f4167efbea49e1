use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod api;
pub mod calendar;
pub mod gateway;
mod metrics;
pub mod posts;
pub mod timezone;

pub use gateway::GatewayError;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by all fallible operations within this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("failed to decode response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("credential store error: {0}")]
    Credentials(#[from] gateway::CredentialError),
    #[error("invalid post: {0}")]
    Validation(String),
    #[error(transparent)]
    Timezone(#[from] timezone::TimezoneError),
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Backend API configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ApiConfig {
    /// Base URL all request paths are joined onto, e.g. `http://localhost:3000/api`.
    pub base_url: String,
    /// Timeout for a single HTTP request in seconds.
    pub timeout_secs: u64,
    /// Upper bound for a token refresh call in seconds. A refresh that takes longer is treated
    /// as failed and ends the session.
    pub refresh_timeout_secs: u64,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

/// Session persistence configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SessionConfig {
    /// File holding the access token, refresh token and user profile.
    pub credentials_path: PathBuf,
}

/// Display configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DisplayConfig {
    /// IANA timezone used to render dates, e.g. `Europe/Berlin`.
    pub timezone: String,
}

/// Calendar configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CalendarConfig {
    /// Interval between background post syncs in seconds.
    pub sync_interval_secs: u64,
}

impl CalendarConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

/// Global application configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AppConfig {
    /// Backend API section.
    pub api: ApiConfig,
    /// Session persistence section.
    pub session: SessionConfig,
    /// Display section.
    pub display: DisplayConfig,
    /// Calendar section.
    pub calendar: CalendarConfig,
}

impl AppConfig {
    /// Loads the application configuration from built-in defaults, files in the `config/`
    /// directory and environment variables.
    pub fn load() -> Result<AppConfig> {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        log::debug!("loading configuration using {} environment", app_env);

        let config = Config::builder()
            .set_default("api.base_url", "http://localhost:3000/api")?
            .set_default("api.timeout_secs", 30_i64)?
            .set_default("api.refresh_timeout_secs", 30_i64)?
            .set_default("session.credentials_path", ".postpilot/session.json")?
            .set_default("display.timezone", "UTC")?
            .set_default("calendar.sync_interval_secs", 60_i64)?
            // Optional shared defaults from `config/default.toml`.
            .add_source(File::with_name("config/default").required(false))
            // Optional environment specific config overrides, e.g. `config/production.toml`.
            .add_source(File::with_name(&format!("config/{}", app_env)).required(false))
            // Optional local config overrides from `config/local.toml` (on .gitignore).
            .add_source(File::with_name("config/local").required(false))
            // Config from environment variables prefixed with `POSTPILOT_`.
            .add_source(
                Environment::with_prefix("POSTPILOT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        log::debug!("loaded configuration: {:?}", config);

        Ok(config)
    }
}
