//! Server configuration, parsed from a TOML file plus environment overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use heirloom_core::reminder;
use heirloom_engine::{EngineConfig, RetryPolicy};
use heirloom_notify::{Contact, EmailConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// General server settings
    #[serde(default)]
    pub server: ServerSection,

    /// Release engine tunables
    pub engine: EngineSection,

    /// Notification delivery
    #[serde(default)]
    pub notifications: NotificationSection,
}

/// General server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Data directory holding the SQLite database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Database file name, relative to `data_dir`
    #[serde(default = "default_database")]
    pub database: String,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// How long a write waits on a locked database before failing
    #[serde(default = "default_storage_timeout")]
    pub storage_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: default_database(),
            log_level: default_log_level(),
            listen_addr: default_listen_addr(),
            storage_timeout_ms: default_storage_timeout(),
        }
    }
}

/// Release engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Seconds between sweeper passes
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Vaults or capsules loaded per sweep batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Reminder thresholds in days before grace entry
    #[serde(default = "reminder::default_thresholds")]
    pub reminder_days: Vec<u32>,

    /// Lifetime of an access grant in seconds
    #[serde(default = "default_grant_ttl")]
    pub grant_ttl_secs: i64,

    /// Secret mixed into every stored token hash. Changing it invalidates
    /// every outstanding token.
    pub token_salt: String,
}

/// Notification delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSection {
    /// Seconds between outbox drains
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,

    /// First retry delay after a failed delivery
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: i64,

    /// Upper bound on the retry delay
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: i64,

    /// Attempts before a notification is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// SMTP settings; without them notifications are only logged
    pub email: Option<EmailConfig>,

    /// User id to email address directory
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: default_dispatch_interval(),
            retry_base_secs: default_retry_base(),
            retry_max_secs: default_retry_max(),
            max_attempts: default_max_attempts(),
            email: None,
            contacts: Vec::new(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_database() -> String {
    "heirloom.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_storage_timeout() -> u64 {
    5000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_batch_size() -> usize {
    100
}

fn default_grant_ttl() -> i64 {
    3600
}

fn default_dispatch_interval() -> u64 {
    30
}

fn default_retry_base() -> i64 {
    30
}

fn default_retry_max() -> i64 {
    3600
}

fn default_max_attempts() -> u32 {
    8
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServerConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `HEIRLOOM_DATA_DIR`
    /// - `HEIRLOOM_DATABASE`
    /// - `HEIRLOOM_LOG_LEVEL`
    /// - `HEIRLOOM_LISTEN_ADDR`
    /// - `HEIRLOOM_SWEEP_INTERVAL`
    /// - `HEIRLOOM_BATCH_SIZE`
    /// - `HEIRLOOM_TOKEN_SALT`
    /// - `HEIRLOOM_SMTP_PASSWORD`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HEIRLOOM_DATA_DIR") {
            self.server.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HEIRLOOM_DATABASE") {
            self.server.database = v;
        }
        if let Ok(v) = std::env::var("HEIRLOOM_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Ok(v) = std::env::var("HEIRLOOM_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Ok(v) = std::env::var("HEIRLOOM_SWEEP_INTERVAL") {
            if let Ok(secs) = v.parse::<u64>() {
                self.engine.sweep_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("HEIRLOOM_BATCH_SIZE") {
            if let Ok(size) = v.parse::<usize>() {
                self.engine.batch_size = size;
            }
        }
        if let Ok(v) = std::env::var("HEIRLOOM_TOKEN_SALT") {
            self.engine.token_salt = v;
        }
        if let Ok(v) = std::env::var("HEIRLOOM_SMTP_PASSWORD") {
            if let Some(ref mut email) = self.notifications.email {
                email.smtp_password = v;
            }
        }
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.engine.sweep_interval_secs >= 1,
            "engine.sweep_interval_secs must be >= 1"
        );
        anyhow::ensure!(self.engine.batch_size > 0, "engine.batch_size must be > 0");
        anyhow::ensure!(
            self.engine.grant_ttl_secs > 0,
            "engine.grant_ttl_secs must be > 0"
        );
        anyhow::ensure!(
            !self.engine.token_salt.is_empty(),
            "engine.token_salt must not be empty"
        );
        anyhow::ensure!(
            self.engine.reminder_days.iter().all(|d| *d > 0),
            "engine.reminder_days must all be > 0"
        );

        anyhow::ensure!(
            !self.server.database.is_empty(),
            "server.database must not be empty"
        );
        anyhow::ensure!(
            self.server.storage_timeout_ms > 0,
            "server.storage_timeout_ms must be > 0"
        );
        self.listen_addr()?;

        let n = &self.notifications;
        anyhow::ensure!(
            n.dispatch_interval_secs >= 1,
            "notifications.dispatch_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            n.retry_base_secs > 0,
            "notifications.retry_base_secs must be > 0"
        );
        anyhow::ensure!(
            n.retry_max_secs >= n.retry_base_secs,
            "notifications.retry_max_secs must be >= retry_base_secs"
        );
        anyhow::ensure!(n.max_attempts > 0, "notifications.max_attempts must be > 0");

        if let Some(ref email) = n.email {
            anyhow::ensure!(
                !email.smtp_host.is_empty(),
                "notifications.email.smtp_host must not be empty"
            );
            anyhow::ensure!(
                !email.from_address.is_empty(),
                "notifications.email.from_address must not be empty"
            );
        }
        for contact in &n.contacts {
            anyhow::ensure!(
                !contact.user_id.is_empty() && contact.email.contains('@'),
                "notifications.contacts entry for '{}' is incomplete",
                contact.user_id
            );
        }

        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.server.data_dir.join(&self.server.database)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("server.listen_addr is invalid: {}", self.server.listen_addr))
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.server.storage_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.engine.sweep_interval_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.notifications.dispatch_interval_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_size: self.engine.batch_size,
            reminder_days: self.engine.reminder_days.clone(),
            grant_ttl_secs: self.engine.grant_ttl_secs,
            token_salt: self.engine.token_salt.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_secs: self.notifications.retry_base_secs,
            max_secs: self.notifications.retry_max_secs,
            max_attempts: self.notifications.max_attempts,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
