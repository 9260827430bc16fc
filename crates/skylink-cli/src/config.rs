//! Configuration – reads/writes `~/.skylink/config.toml`.

use serde::{Deserialize, Serialize};
use skylink_middleware::BusConfig;
use skylink_transport::TransportConfig;
use skylink_types::LinkError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Persisted operator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub bus: BusSection,
}

/// `[transport]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// WebSocket endpoint of the device-control backend.
    pub url: String,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    /// `0` turns the heartbeat off.
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Log every frame at `debug`.
    pub debug: bool,
    /// Send binary frames instead of text.
    pub binary: bool,
    /// Bound on frames queued while disconnected; unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_len: Option<usize>,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            url: "ws://localhost:1888/ws".to_string(),
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 10_000,
            debug: false,
            binary: false,
            max_queue_len: None,
        }
    }
}

/// `[bus]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl Config {
    pub fn transport_config(&self) -> TransportConfig {
        let t = &self.transport;
        TransportConfig::new(t.url.clone())
            .with_reconnect_interval(Duration::from_millis(t.reconnect_interval_ms))
            .with_max_reconnect_attempts(t.max_reconnect_attempts)
            .with_heartbeat_interval(Duration::from_millis(t.heartbeat_interval_ms))
            .with_connect_timeout(Duration::from_millis(t.connect_timeout_ms))
            .with_debug(t.debug)
            .with_binary(t.binary)
            .with_max_queue_len(t.max_queue_len)
    }

    pub fn bus_config(&self) -> Result<BusConfig, LinkError> {
        let level = self
            .bus
            .log_level
            .parse::<Level>()
            .map_err(|_| LinkError::Config(format!("unknown log level '{}'", self.bus.log_level)))?;
        Ok(BusConfig::default()
            .with_log_level(level)
            .with_max_retries(self.bus.max_retries)
            .with_retry_delay(Duration::from_millis(self.bus.retry_delay_ms)))
    }
}

/// Return the path to `~/.skylink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".skylink").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `SKYLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SKYLINK_URL` | `transport.url` |
/// | `SKYLINK_MAX_RECONNECT_ATTEMPTS` | `transport.max_reconnect_attempts` |
/// | `SKYLINK_RECONNECT_INTERVAL_MS` | `transport.reconnect_interval_ms` |
/// | `SKYLINK_HEARTBEAT_INTERVAL_MS` | `transport.heartbeat_interval_ms` |
/// | `SKYLINK_LOG_LEVEL` | `bus.log_level` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SKYLINK_URL") {
        cfg.transport.url = v;
    }
    if let Some(v) = var("SKYLINK_MAX_RECONNECT_ATTEMPTS")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.transport.max_reconnect_attempts = n;
    }
    if let Some(v) = var("SKYLINK_RECONNECT_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.transport.reconnect_interval_ms = ms;
    }
    if let Some(v) = var("SKYLINK_HEARTBEAT_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.transport.heartbeat_interval_ms = ms;
    }
    if let Some(v) = var("SKYLINK_LOG_LEVEL") {
        cfg.bus.log_level = v;
    }
}

/// Save the config to disk, creating `~/.skylink/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
