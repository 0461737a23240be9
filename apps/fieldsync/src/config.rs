//! Configuration management for FieldSync Server

use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Limits for the push/pull protocol
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SyncSettings {
    /// Largest push batch accepted in one request
    pub max_batch_size: usize,
    /// Most rows returned by one pull
    pub pull_page_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_batch_size: 100,
            pull_page_size: 500,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./fieldsync.db".to_string(),
                max_connections: 5,
            },
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_var(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            sync: SyncSettings {
                max_batch_size: parse_var("SYNC_MAX_BATCH_SIZE", defaults.sync.max_batch_size)?,
                pull_page_size: parse_var("SYNC_PULL_PAGE_SIZE", defaults.sync.pull_page_size)?,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid value for {name}: {value}")]
pub struct ConfigError {
    name: &'static str,
    value: String,
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError { name, value }),
        Err(_) => Ok(default),
    }
}
