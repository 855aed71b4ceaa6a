use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::time::Duration;

use crate::network::{ForwardSpec, ListenAddr, PeerAddr};

#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Peers to dial, `[servername:]host:port`.
    #[serde(default)]
    pub peer: Vec<String>,

    /// Local forwards, `[localHost:]localPort:host:port`.
    #[serde(default)]
    pub forward: Vec<String>,

    /// Listeners requested on the far side, `[remoteHost:]remotePort:host:port`.
    #[serde(default)]
    pub reverse: Vec<String>,

    /// Link listeners, `[host:]port`.
    #[serde(default)]
    pub listen: Vec<String>,

    /// Monitoring endpoint, `[host:]port`.
    pub api_address: Option<String>,

    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub ca_cert_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_ping_max")]
    pub ping_max_secs: u64,

    #[serde(default = "default_max_rtt")]
    pub max_rtt_ms: u64,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_buffer_high")]
    pub buffer_high: usize,

    #[serde(default = "default_buffer_low")]
    pub buffer_low: usize,

    #[serde(default = "default_ack_interval")]
    pub ack_interval: u32,

    #[serde(default = "default_ack_window")]
    pub ack_window: u32,

    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_retry_floor")]
    pub retry_floor_ms: u64,

    #[serde(default = "default_retry_cap")]
    pub retry_cap_ms: u64,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            ping_interval_secs: default_ping_interval(),
            ping_max_secs: default_ping_max(),
            max_rtt_ms: default_max_rtt(),
            flush_interval_ms: default_flush_interval(),
            buffer_high: default_buffer_high(),
            buffer_low: default_buffer_low(),
            ack_interval: default_ack_interval(),
            ack_window: default_ack_window(),
            request_delay_ms: default_request_delay(),
            connect_timeout_secs: default_connect_timeout(),
            retry_floor_ms: default_retry_floor(),
            retry_cap_ms: default_retry_cap(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl TunnelConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_max(&self) -> Duration {
        Duration::from_secs(self.ping_max_secs)
    }

    pub fn max_rtt(&self) -> Duration {
        Duration::from_millis(self.max_rtt_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_floor(&self) -> Duration {
        Duration::from_millis(self.retry_floor_ms)
    }

    pub fn retry_cap(&self) -> Duration {
        Duration::from_millis(self.retry_cap_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_idle_timeout() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_ping_interval() -> u64 {
    1
}
fn default_ping_max() -> u64 {
    30
}
fn default_max_rtt() -> u64 {
    30000
}
fn default_flush_interval() -> u64 {
    10
}
fn default_buffer_high() -> usize {
    1024
}
fn default_buffer_low() -> usize {
    512
}
fn default_ack_interval() -> u32 {
    4
}
fn default_ack_window() -> u32 {
    256
}
fn default_request_delay() -> u64 {
    3000
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_retry_floor() -> u64 {
    1000
}
fn default_retry_cap() -> u64 {
    30000
}
fn default_read_buffer_size() -> usize {
    16 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "plain".to_string()
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

fn invalid(what: &str, spec: &str, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::ValidationError(format!("Invalid {} '{}': {}", what, spec, e))
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    for spec in &config.peer {
        spec.parse::<PeerAddr>()
            .map_err(|e| invalid("peer", spec, e))?;
    }
    for spec in &config.forward {
        spec.parse::<ForwardSpec>()
            .map_err(|e| invalid("forward", spec, e))?;
    }
    for spec in &config.reverse {
        spec.parse::<ForwardSpec>()
            .map_err(|e| invalid("reverse", spec, e))?;
    }
    for spec in &config.listen {
        spec.parse::<ListenAddr>()
            .map_err(|e| invalid("listen", spec, e))?;
    }
    if let Some(ref api) = config.api_address {
        api.parse::<ListenAddr>()
            .map_err(|e| invalid("api address", api, e))?;
    }

    let tunnel = &config.tunnel;
    if tunnel.buffer_low >= tunnel.buffer_high {
        return Err(ConfigError::ValidationError(format!(
            "buffer_low ({}) must be below buffer_high ({})",
            tunnel.buffer_low, tunnel.buffer_high
        )));
    }
    if tunnel.ack_interval == 0 {
        return Err(ConfigError::ValidationError(
            "ack_interval must be at least 1".to_string(),
        ));
    }
    if tunnel.ack_window <= tunnel.ack_interval {
        return Err(ConfigError::ValidationError(format!(
            "ack_window ({}) must exceed ack_interval ({})",
            tunnel.ack_window, tunnel.ack_interval
        )));
    }

    let intervals = [
        ("idle_timeout_secs", tunnel.idle_timeout_secs),
        ("sweep_interval_secs", tunnel.sweep_interval_secs),
        ("ping_interval_secs", tunnel.ping_interval_secs),
        ("ping_max_secs", tunnel.ping_max_secs),
        ("max_rtt_ms", tunnel.max_rtt_ms),
        ("flush_interval_ms", tunnel.flush_interval_ms),
        ("request_delay_ms", tunnel.request_delay_ms),
        ("connect_timeout_secs", tunnel.connect_timeout_secs),
        ("retry_floor_ms", tunnel.retry_floor_ms),
        ("read_buffer_size", tunnel.read_buffer_size as u64),
    ];
    for (name, value) in intervals {
        if value == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{} must be non-zero",
                name
            )));
        }
    }
    if tunnel.retry_cap_ms < tunnel.retry_floor_ms {
        return Err(ConfigError::ValidationError(format!(
            "retry_cap_ms ({}) must not be below retry_floor_ms ({})",
            tunnel.retry_cap_ms, tunnel.retry_floor_ms
        )));
    }

    match config.logging.format.as_str() {
        "plain" | "json" => {}
        other => {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log format '{}'",
                other
            )))
        }
    }

    if let Some(ref tls) = config.tls {
        for path in [&tls.ca_cert_path, &tls.cert_path, &tls.key_path] {
            if !path.exists() {
                return Err(ConfigError::ValidationError(format!(
                    "TLS file not found: {:?}",
                    path
                )));
            }
        }
    }

    Ok(())
}
