//! Configuration management for the server.

use std::env;

/// Default cap on operations returned by one download.
pub const DEFAULT_MAX_DOWNLOAD_LIMIT: u32 = 1000;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Shared bearer token. Without it the server accepts anonymous clients.
    pub auth_secret: Option<String>,
    /// Upper bound for the `limit` of a download
    pub max_download_limit: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = var("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = var("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?;

        let auth_secret = var("AUTH_SECRET").filter(|s| !s.is_empty());

        let max_download_limit = match var("MAX_DOWNLOAD_LIMIT") {
            Some(raw) => match raw.parse() {
                Ok(limit) if limit > 0 => limit,
                _ => return Err(ConfigError::InvalidDownloadLimit),
            },
            None => DEFAULT_MAX_DOWNLOAD_LIMIT,
        };

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            max_download_limit,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("MAX_DOWNLOAD_LIMIT must be a positive integer")]
    InvalidDownloadLimit,
}
