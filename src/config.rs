//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding settings
//! - GitHub API access and app-level webhook secret
//! - Database selection (PostgreSQL via DATABASE_URL, SQLite otherwise)
//! - Payout signer and notification sink endpoints

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub payouts: PayoutsConfig,
    pub notifications: NotificationsConfig,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// Base URL of the GitHub REST API.
    pub api_base: String,
    /// Secret for app-level (installation*) webhook deliveries.
    #[serde(default)]
    pub app_webhook_secret: String,
    /// Fallback API token when no installation token is available.
    #[serde(default)]
    pub token: String,
    pub request_timeout_secs: u64,
    pub installation_token_ttl_secs: u64,
}

impl GitHubConfig {
    /// GITHUB_TOKEN env var takes precedence over the config value.
    pub fn resolved_token(&self) -> Option<String> {
        non_empty(std::env::var("GITHUB_TOKEN").ok()).or_else(|| non_empty_str(&self.token))
    }

    /// GITHUB_APP_WEBHOOK_SECRET env var takes precedence.
    pub fn resolved_app_webhook_secret(&self) -> Option<String> {
        non_empty(std::env::var("GITHUB_APP_WEBHOOK_SECRET").ok())
            .or_else(|| non_empty_str(&self.app_webhook_secret))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Local database file used when DATABASE_URL is not set.
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "bounty-board.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutsConfig {
    /// JSON-RPC endpoint of the payout signer. Empty disables automated
    /// signing and routes every payout through the manual path.
    #[serde(default)]
    pub signer_url: String,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub callback_token: String,
}

impl PayoutsConfig {
    pub fn resolved_signer_url(&self) -> Option<String> {
        non_empty_str(&self.signer_url)
    }

    /// PAYOUT_CALLBACK_TOKEN env var takes precedence.
    pub fn resolved_callback_token(&self) -> Option<String> {
        non_empty(std::env::var("PAYOUT_CALLBACK_TOKEN").ok())
            .or_else(|| non_empty_str(&self.callback_token))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Fire-and-forget event sink. Empty disables notifications.
    #[serde(default)]
    pub sink_url: String,
    pub timeout_secs: u64,
}

impl NotificationsConfig {
    pub fn resolved_sink_url(&self) -> Option<String> {
        non_empty_str(&self.sink_url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Background access-key expiry sweep interval.
    pub interval_secs: u64,
}

impl Config {
    /// Load from config.toml or use defaults
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            // Use embedded default config
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }

    /// PostgreSQL connection string, when running in server mode.
    pub fn database_url(&self) -> Option<String> {
        non_empty(std::env::var("DATABASE_URL").ok())
    }
}

impl Default for Config {
    fn default() -> Self {
        // The embedded default config is validated by the tests, so this
        // should never fail. Using a fallback for robustness.
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            github: GitHubConfig {
                api_base: "https://api.github.com".to_string(),
                app_webhook_secret: String::new(),
                token: String::new(),
                request_timeout_secs: 10,
                installation_token_ttl_secs: 3300,
            },
            database: DatabaseConfig::default(),
            payouts: PayoutsConfig {
                signer_url: String::new(),
                request_timeout_secs: 15,
                callback_token: String::new(),
            },
            notifications: NotificationsConfig {
                sink_url: String::new(),
                timeout_secs: 5,
            },
            sweeper: SweeperConfig { interval_secs: 300 },
        })
    }
}

/// Server mode must not leave the payout-confirmation endpoint open:
/// without a callback token anyone could flip submissions to paid.
/// Local SQLite mode stays permissive.
pub fn payout_confirmation_unauthenticated(
    database_url: Option<&str>,
    callback_token: Option<&str>,
) -> bool {
    database_url.is_some() && callback_token.is_none()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn non_empty_str(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
