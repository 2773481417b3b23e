// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Chatflow server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file path
    pub database_path: String,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Messaging gateway base URL; when unset, sends are logged only
    pub gateway_url: Option<String>,
    /// Timer scheduler poll interval
    pub timer_poll_interval: Duration,
    /// Maximum timers claimed per sweep
    pub timer_batch_size: i64,
    /// Grace window before a suspended run with no timer row is re-woken
    pub timer_reconcile_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CHATFLOW_DATABASE_PATH`: SQLite database file path
    ///
    /// Optional (with defaults):
    /// - `CHATFLOW_HTTP_PORT`: HTTP listen port (default: 8080)
    /// - `CHATFLOW_GATEWAY_URL`: messaging gateway base URL (default: unset, log-only sends)
    /// - `CHATFLOW_TIMER_POLL_SECS`: timer poll interval in seconds (default: 5)
    /// - `CHATFLOW_TIMER_BATCH_SIZE`: timers claimed per sweep (default: 32)
    /// - `CHATFLOW_TIMER_GRACE_SECS`: reconciliation grace window in seconds (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = std::env::var("CHATFLOW_DATABASE_PATH")
            .map_err(|_| ConfigError::Missing("CHATFLOW_DATABASE_PATH"))?;

        let http_port: u16 = std::env::var("CHATFLOW_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CHATFLOW_HTTP_PORT", "must be a valid port number")
            })?;

        let gateway_url = std::env::var("CHATFLOW_GATEWAY_URL")
            .ok()
            .map(|url| url.trim_end_matches('/').to_string());

        let timer_poll_secs: u64 = std::env::var("CHATFLOW_TIMER_POLL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CHATFLOW_TIMER_POLL_SECS", "must be a positive integer")
            })?;

        let timer_batch_size: i64 = std::env::var("CHATFLOW_TIMER_BATCH_SIZE")
            .unwrap_or_else(|_| "32".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CHATFLOW_TIMER_BATCH_SIZE", "must be a positive integer")
            })?;

        let timer_grace_secs: u64 = std::env::var("CHATFLOW_TIMER_GRACE_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CHATFLOW_TIMER_GRACE_SECS", "must be a positive integer")
            })?;

        Ok(Self {
            database_path,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            gateway_url,
            timer_poll_interval: Duration::from_secs(timer_poll_secs),
            timer_batch_size,
            timer_reconcile_grace: Duration::from_secs(timer_grace_secs),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
