//! # Configuration Management Module
//!
//! Centralized, TOML-backed configuration for the gateway core: the radio
//! link, the persistent store, the scheduler's job intervals, the
//! automation hooks, and the HTTP API surface.
//!
//! ## Configuration Structure
//!
//! - [`RadioConfig`] - transport, address, channel PSKs, reconnect backoff
//! - [`StoreConfig`] - database path and per-kind retention horizons
//! - [`SchedulerConfig`] - job cadence (traceroute rotation, announce, etc.)
//! - [`AutomationConfig`] - auto-ack / auto-welcome / auto-announce settings
//! - [`HttpConfig`] - bind port and base URL
//! - [`LoggingConfig`] - log level and an optional file sink
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshmonitor::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshmonitor.toml").await?;
//!     println!("Radio: {}", config.radio.node_ip);
//!     Config::create_default("meshmonitor.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! Values can also be overridden by the environment variables documented in
//! the external interface contract (`MESHTASTIC_NODE_IP`,
//! `MESHTASTIC_USE_TLS`, `BASE_URL`, `DB_PATH`, `HTTP_PORT`), applied after
//! the file is parsed so the file always wins over compiled-in defaults but
//! the environment always wins over the file.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RadioTransport {
    Tcp,
    Http,
}

impl Default for RadioTransport {
    fn default() -> Self {
        RadioTransport::Tcp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    pub node_ip: String,
    pub transport: RadioTransport,
    #[serde(default)]
    pub use_tls: bool,
    /// Channel index -> base64 PSK, used to AES-CTR decrypt that channel's packets.
    #[serde(default)]
    pub channel_psks: HashMap<u8, String>,
    #[serde(default = "default_reconnect_min")]
    pub reconnect_min_secs: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,
}

fn default_reconnect_min() -> u64 {
    1
}
fn default_reconnect_max() -> u64 {
    30
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            node_ip: "192.168.1.1".to_string(),
            transport: RadioTransport::Tcp,
            use_tls: false,
            channel_psks: HashMap::new(),
            reconnect_min_secs: default_reconnect_min(),
            reconnect_max_secs: default_reconnect_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_retention_messages_days")]
    pub retention_messages_days: i64,
    #[serde(default = "default_retention_telemetry_days")]
    pub retention_telemetry_days: i64,
    #[serde(default = "default_retention_position_days")]
    pub retention_position_days: i64,
    #[serde(default = "default_retention_neighbor_hours")]
    pub retention_neighbor_hours: i64,
}

fn default_db_path() -> String {
    "./data/meshmonitor.db".to_string()
}
fn default_retention_messages_days() -> i64 {
    90
}
fn default_retention_telemetry_days() -> i64 {
    30
}
fn default_retention_position_days() -> i64 {
    7
}
fn default_retention_neighbor_hours() -> i64 {
    24
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            db_path: default_db_path(),
            retention_messages_days: default_retention_messages_days(),
            retention_telemetry_days: default_retention_telemetry_days(),
            retention_position_days: default_retention_position_days(),
            retention_neighbor_hours: default_retention_neighbor_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_traceroute_interval")]
    pub traceroute_interval_secs: u64,
    /// A node is eligible for traceroute rotation only while its `lastHeard`
    /// is within this many seconds of now (spec.md §4.6's "active window").
    #[serde(default = "default_traceroute_active_window")]
    pub traceroute_active_window_secs: i64,
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
    #[serde(default)]
    pub announce_on_start: bool,
    #[serde(default = "default_node_refresh_interval")]
    pub node_refresh_interval_secs: u64,
    #[serde(default = "default_retention_sweep_interval")]
    pub retention_sweep_interval_secs: u64,
    #[serde(default = "default_version_check_interval")]
    pub version_check_interval_secs: u64,
}

fn default_traceroute_interval() -> u64 {
    180
}
fn default_traceroute_active_window() -> i64 {
    24 * 3600
}
fn default_announce_interval() -> u64 {
    6 * 3600
}
fn default_node_refresh_interval() -> u64 {
    60 * 60
}
fn default_retention_sweep_interval() -> u64 {
    60 * 60
}
fn default_version_check_interval() -> u64 {
    4 * 3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            traceroute_interval_secs: default_traceroute_interval(),
            traceroute_active_window_secs: default_traceroute_active_window(),
            announce_interval_secs: default_announce_interval(),
            announce_on_start: false,
            node_refresh_interval_secs: default_node_refresh_interval(),
            retention_sweep_interval_secs: default_retention_sweep_interval(),
            version_check_interval_secs: default_version_check_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default)]
    pub auto_ack_enabled: bool,
    #[serde(default = "default_auto_ack_regex")]
    pub auto_ack_regex: String,
    #[serde(default = "default_auto_ack_reply")]
    pub auto_ack_reply_template: String,
    #[serde(default)]
    pub auto_ack_channels: Vec<i32>,
    #[serde(default)]
    pub auto_ack_dm: bool,
    #[serde(default)]
    pub auto_welcome_enabled: bool,
    #[serde(default = "default_welcome_message")]
    pub auto_welcome_message: String,
    #[serde(default)]
    pub auto_welcome_wait_for_name: bool,
    #[serde(default)]
    pub auto_announce_enabled: bool,
    #[serde(default = "default_announce_message")]
    pub auto_announce_message: String,
    #[serde(default)]
    pub auto_announce_channel: i32,
}

fn default_auto_ack_regex() -> String {
    "^test$".to_string()
}
fn default_auto_ack_reply() -> String {
    "ack: {from}".to_string()
}
fn default_welcome_message() -> String {
    "Welcome to the mesh, {shortName}!".to_string()
}
fn default_announce_message() -> String {
    "MeshMonitor gateway online.".to_string()
}

impl Default for AutomationConfig {
    fn default() -> Self {
        AutomationConfig {
            auto_ack_enabled: false,
            auto_ack_regex: default_auto_ack_regex(),
            auto_ack_reply_template: default_auto_ack_reply(),
            auto_ack_channels: Vec::new(),
            auto_ack_dm: false,
            auto_welcome_enabled: false,
            auto_welcome_message: default_welcome_message(),
            auto_welcome_wait_for_name: false,
            auto_announce_enabled: false,
            auto_announce_message: default_announce_message(),
            auto_announce_channel: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_http_port() -> u16 {
    8080
}
fn default_base_url() -> String {
    "/".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            port: default_http_port(),
            base_url: default_base_url(),
        }
    }
}

/// Consumed by `main::init_logging`: `level` sets the default `env_logger`
/// filter (overridden by `-v`/`-vv`) and `file`, when set, redirects log
/// output there instead of stderr.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            radio: RadioConfig::default(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            automation: AutomationConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file, then layer in the documented
    /// environment variable overrides.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config.apply_env_overrides())
    }

    fn apply_env_overrides(mut self) -> Self {
        if let Ok(ip) = std::env::var("MESHTASTIC_NODE_IP") {
            self.radio.node_ip = ip;
        }
        if let Ok(tls) = std::env::var("MESHTASTIC_USE_TLS") {
            self.radio.use_tls = tls == "1" || tls.eq_ignore_ascii_case("true");
        }
        if let Ok(base) = std::env::var("BASE_URL") {
            self.http.base_url = base;
        }
        if let Ok(db) = std::env::var("DB_PATH") {
            self.store.db_path = db;
        }
        if let Ok(port) = std::env::var("HTTP_PORT") {
            if let Ok(p) = port.parse() {
                self.http.port = p;
            }
        }
        self
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let cfg = Config::default();
        let s = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&s).unwrap();
        assert_eq!(back.store.db_path, cfg.store.db_path);
        assert_eq!(back.scheduler.traceroute_interval_secs, 180);
    }

    #[tokio::test]
    async fn missing_file_errors() {
        let result = Config::load("/nonexistent/path/meshmonitor.toml").await;
        assert!(result.is_err());
    }

    #[test]
    fn env_overrides_apply_after_parse() {
        std::env::set_var("HTTP_PORT", "9999");
        let cfg = Config::default().apply_env_overrides();
        assert_eq!(cfg.http.port, 9999);
        std::env::remove_var("HTTP_PORT");
    }
}
