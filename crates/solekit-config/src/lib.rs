//! Shared configuration for solekit tools.
//!
//! One TOML file merged with `SOLEKIT_`-prefixed environment variables,
//! translated into the runtime types `solekit_core` consumes
//! (`SessionConfig`, `BridgeConfig`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use solekit_core::{BridgeConfig, ConnectionConfig, FirmwareConfig, SessionConfig};

/// Environment prefix. Nested keys use a double underscore:
/// `SOLEKIT_CONNECTION__LIVENESS_INTERVAL_MS=2000`.
pub const ENV_PREFIX: &str = "SOLEKIT_";

/// Smallest SMP frame that still carries a header and a useful chunk.
const MIN_SMP_MTU: usize = 32;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionSection,

    #[serde(default)]
    pub firmware: FirmwareSection,

    #[serde(default)]
    pub bridge: BridgeSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectionSection {
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default)]
    pub reconnect_on_disconnection: bool,

    /// MTU assumed before the device reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mtu: Option<u16>,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            liveness_interval_ms: default_liveness_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            reconnect_on_disconnection: false,
            default_mtu: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FirmwareSection {
    #[serde(default = "default_smp_mtu")]
    pub smp_mtu: usize,

    #[serde(default = "default_true")]
    pub smp_strict_sequence: bool,
}

impl Default for FirmwareSection {
    fn default() -> Self {
        Self {
            smp_mtu: default_smp_mtu(),
            smp_strict_sequence: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BridgeSection {
    /// Bridge WebSocket URL. Commands that talk to a bridge fail without it
    /// unless one is passed on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    #[serde(default = "default_discovered_device_expiration_ms")]
    pub discovered_device_expiration_ms: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            url: None,
            ping_interval_ms: default_ping_interval_ms(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            discovered_device_expiration_ms: default_discovered_device_expiration_ms(),
        }
    }
}

fn default_liveness_interval_ms() -> u64 {
    5_000
}
fn default_reconnect_interval_ms() -> u64 {
    1_000
}
fn default_smp_mtu() -> usize {
    256
}
fn default_true() -> bool {
    true
}
fn default_ping_interval_ms() -> u64 {
    30_000
}
fn default_reconnect_initial_delay_ms() -> u64 {
    3_000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_discovered_device_expiration_ms() -> u64 {
    5_000
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "solekit", "solekit").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("solekit");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_from(&config_path())
}

/// Load from an explicit file + environment. A missing file is not an error.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Load config, returning a default if anything goes wrong.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation to runtime config ───────────────────────────────────

impl Config {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.liveness_interval_ms == 0 {
            return Err(invalid("connection.liveness_interval_ms", "must be greater than zero"));
        }
        if self.firmware.smp_mtu < MIN_SMP_MTU {
            return Err(invalid(
                "firmware.smp_mtu",
                &format!("must be at least {MIN_SMP_MTU}"),
            ));
        }
        if self.bridge.reconnect_max_delay_ms < self.bridge.reconnect_initial_delay_ms {
            return Err(invalid(
                "bridge.reconnect_max_delay_ms",
                "must not be below reconnect_initial_delay_ms",
            ));
        }
        if let Some(ref url) = self.bridge.url {
            parse_bridge_url(url)?;
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connection: ConnectionConfig {
                liveness_interval: Duration::from_millis(self.connection.liveness_interval_ms),
                reconnect_interval: Duration::from_millis(self.connection.reconnect_interval_ms),
                reconnect_on_disconnection: self.connection.reconnect_on_disconnection,
                default_mtu: self.connection.default_mtu,
            },
            firmware: FirmwareConfig {
                smp_mtu: self.firmware.smp_mtu,
                smp_strict_sequence: self.firmware.smp_strict_sequence,
            },
        }
    }

    /// Build a `BridgeConfig`. `url_override` wins over the file's
    /// `[bridge].url`; one of the two must be present.
    pub fn bridge_config(&self, url_override: Option<&str>) -> Result<BridgeConfig, ConfigError> {
        let raw = url_override
            .or(self.bridge.url.as_deref())
            .ok_or_else(|| invalid("bridge.url", "no bridge URL configured"))?;
        let mut config = BridgeConfig::new(parse_bridge_url(raw)?);
        config.ping_interval = Duration::from_millis(self.bridge.ping_interval_ms);
        config.reconnect.initial_delay = Duration::from_millis(self.bridge.reconnect_initial_delay_ms);
        config.reconnect.max_delay = Duration::from_millis(self.bridge.reconnect_max_delay_ms);
        config.discovered_device_expiration =
            Duration::from_millis(self.bridge.discovered_device_expiration_ms);
        config.session = self.session_config();
        Ok(config)
    }
}

fn parse_bridge_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| invalid("bridge.url", &e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(invalid(
            "bridge.url",
            &format!("expected a ws:// or wss:// URL, got {other}://"),
        )),
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}
