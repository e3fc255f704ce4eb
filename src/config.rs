//! Configuration for Cadence

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("CADENCE").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Postgres {
        url: String,
        #[serde(default = "default_max_conn")]
        max_connections: u32,
    },
    Sqlite {
        path: String,
    },
}

impl DatabaseConfig {
    pub fn postgres(url: impl Into<String>) -> Self {
        Self::Postgres {
            url: url.into(),
            max_connections: default_max_conn(),
        }
    }
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self::Sqlite { path: path.into() }
    }
    pub fn in_memory() -> Self {
        Self::Sqlite {
            path: ":memory:".to_string(),
        }
    }
}

fn default_max_conn() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Externally reachable URL of this node's trigger endpoint
    /// (e.g. `https://shop-1.internal/taskscheduler`)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Seconds between self-triggered polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Post to our own poll endpoint every `poll_interval_secs`
    #[serde(default = "default_true")]
    pub self_poll: bool,
    #[serde(default = "default_machine_name")]
    pub machine_name: String,
    #[serde(default = "default_init_max_attempts")]
    pub init_max_attempts: u32,
    #[serde(default = "default_init_initial_backoff")]
    pub init_initial_backoff_ms: u64,
    #[serde(default = "default_init_max_backoff")]
    pub init_max_backoff_ms: u64,
    /// Runs older than this are considered dead and abandoned
    #[serde(default = "default_stale_run_timeout")]
    pub stale_run_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_progress_flush_interval")]
    pub progress_flush_interval_ms: u64,
    #[serde(default = "default_history_keep")]
    pub history_keep_per_scope: i64,
    /// 0 keeps history regardless of age
    #[serde(default = "default_history_max_age")]
    pub history_max_age_days: i64,
    #[serde(default = "default_history_cleanup_cron")]
    pub history_cleanup_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            poll_interval_secs: default_poll_interval(),
            self_poll: true,
            machine_name: default_machine_name(),
            init_max_attempts: default_init_max_attempts(),
            init_initial_backoff_ms: default_init_initial_backoff(),
            init_max_backoff_ms: default_init_max_backoff(),
            stale_run_timeout_secs: default_stale_run_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            progress_flush_interval_ms: default_progress_flush_interval(),
            history_keep_per_scope: default_history_keep(),
            history_max_age_days: default_history_max_age(),
            history_cleanup_cron: default_history_cleanup_cron(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stale_run_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_run_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn progress_flush_interval(&self) -> Duration {
        Duration::from_millis(self.progress_flush_interval_ms)
    }

    /// Configured base URL without a trailing slash, or the local listener
    pub fn base_url_for(&self, server: &ServerConfig) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://127.0.0.1:{}/taskscheduler", server.port),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    60
}
fn default_machine_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
fn default_init_max_attempts() -> u32 {
    10
}
fn default_init_initial_backoff() -> u64 {
    1000
}
fn default_init_max_backoff() -> u64 {
    60_000
}
fn default_stale_run_timeout() -> u64 {
    4 * 60 * 60
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_progress_flush_interval() -> u64 {
    2000
}
fn default_history_keep() -> i64 {
    100
}
fn default_history_max_age() -> i64 {
    30
}
fn default_history_cleanup_cron() -> String {
    "30 3 * * *".to_string()
}
