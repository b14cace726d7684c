use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::CourierError;
use crate::session_key::DmScope;

/// Top-level Courier configuration, as resolved from `config.toml`.
///
/// File parsing and defaults live here; schema migration and secrets
/// resolution are external concerns — by the time the gateway sees this
/// struct it is fully validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub courier: DaemonConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub lanes: LanesConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

/// General daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// WebSocket gateway bind and browser-origin policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Exact-match Origin allowlist checked before the upgrade.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Opt-in: accept an Origin whose host matches the request Host header.
    /// Off by default to avoid surprising acceptance behind proxies.
    #[serde(default)]
    pub allow_host_origin_fallback: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
            allow_host_origin_fallback: false,
        }
    }
}

/// Device authentication for RPC clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// When false, all Hello frames authenticate (local development).
    #[serde(default = "default_true")]
    pub require_device_auth: bool,
    /// Raw bearer tokens accepted during the Hello handshake. Stored
    /// hashed in memory; never logged.
    #[serde(default)]
    pub tokens: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_device_auth: true,
            tokens: Vec::new(),
        }
    }
}

/// Per-lane concurrency caps. Runtime-adjustable via `config.set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanesConfig {
    #[serde(default = "default_main_cap")]
    pub main: usize,
    #[serde(default = "default_subagent_cap")]
    pub subagent: usize,
    /// Cap 1 so scheduled jobs never overlap.
    #[serde(default = "default_cron_cap")]
    pub cron: usize,
    #[serde(default = "default_nested_cap")]
    pub nested: usize,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            main: default_main_cap(),
            subagent: default_subagent_cap(),
            cron: default_cron_cap(),
            nested: default_nested_cap(),
        }
    }
}

impl LanesConfig {
    /// Lane name/cap pairs in a stable order.
    pub fn caps(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("main", self.main),
            ("subagent", self.subagent),
            ("cron", self.cron),
            ("nested", self.nested),
        ]
    }
}

/// Session routing and persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub dm_scope: DmScope,
    /// Primary session store file, relative to `data_dir` unless absolute.
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// Additional per-agent store files merged into listings.
    #[serde(default)]
    pub agent_store_paths: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dm_scope: DmScope::default(),
            store_path: default_store_path(),
            agent_store_paths: HashMap::new(),
        }
    }
}

/// Background heartbeat wake loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_minutes: u64,
    #[serde(default = "default_heartbeat_prompt")]
    pub prompt: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_heartbeat_interval(),
            prompt: default_heartbeat_prompt(),
        }
    }
}

/// Scheduled (cron) agent jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cron_poll")]
    pub poll_interval_secs: u64,
    /// Jobs file, relative to `data_dir` unless absolute.
    #[serde(default = "default_jobs_path")]
    pub jobs_path: String,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_cron_poll(),
            jobs_path: default_jobs_path(),
        }
    }
}

/// Per-channel delivery overrides. The adapters themselves are external;
/// only their chunking knobs are configured here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Per-channel override of the adapter's default chunk size.
    #[serde(default)]
    pub text_chunk_limits: HashMap<String, usize>,
}

/// Load and validate configuration from a TOML file.
pub fn load(path: &str) -> Result<Config, CourierError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CourierError::Config(format!("cannot read {path}: {e}")))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| CourierError::Config(format!("invalid {path}: {e}")))?;
    cfg.validate()?;
    info!("loaded config from {path}");
    Ok(cfg)
}

/// Load the config file if present, otherwise fall back to defaults.
pub fn load_or_default(path: &str) -> Result<Config, CourierError> {
    if Path::new(path).exists() {
        load(path)
    } else {
        info!("no config at {path}, using defaults");
        Ok(Config::default())
    }
}

impl Config {
    /// Startup-fatal validation. Mid-flight reconfiguration goes through
    /// the same checks before being applied.
    pub fn validate(&self) -> Result<(), CourierError> {
        for (lane, cap) in self.lanes.caps() {
            if cap == 0 {
                return Err(CourierError::Config(format!(
                    "lane '{lane}' max_concurrent must be at least 1"
                )));
            }
        }
        if self.heartbeat.enabled && self.heartbeat.interval_minutes == 0 {
            return Err(CourierError::Config(
                "heartbeat interval_minutes must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve a store/jobs path against the data directory.
    pub fn resolve_path(&self, rel: &str) -> std::path::PathBuf {
        let p = Path::new(rel);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            Path::new(&self.courier.data_dir).join(p)
        }
    }

    /// Copy with secrets blanked, for `config.get` responses and logs.
    pub fn redacted(&self) -> Config {
        let mut cfg = self.clone();
        cfg.auth.tokens = cfg.auth.tokens.iter().map(|_| "***".to_string()).collect();
        cfg
    }
}

fn default_true() -> bool {
    true
}
fn default_name() -> String {
    "courier".to_string()
}
fn default_data_dir() -> String {
    "~/.courier".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8437
}
fn default_main_cap() -> usize {
    4
}
fn default_subagent_cap() -> usize {
    2
}
fn default_cron_cap() -> usize {
    1
}
fn default_nested_cap() -> usize {
    2
}
fn default_store_path() -> String {
    "sessions.json".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_prompt() -> String {
    "Check for anything that needs attention. Reply HEARTBEAT_OK if nothing does.".to_string()
}
fn default_cron_poll() -> u64 {
    30
}
fn default_jobs_path() -> String {
    "cron.json".to_string()
}
