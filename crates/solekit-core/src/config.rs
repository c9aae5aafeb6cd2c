// ── Runtime session configuration ──
//
// These types describe *how* sessions and bridge clients behave. They never
// touch disk; solekit-config (or a test) builds them and hands them in.

use std::time::Duration;

use url::Url;

use solekit_proto::smp;
use solekit_proto::websocket::ReconnectConfig;

/// Connection-manager timing and reconnection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How often a connected transport is polled for liveness.
    pub liveness_interval: Duration,
    /// Delay between reconnection attempts.
    pub reconnect_interval: Duration,
    /// Reconnect automatically after an unexpected disconnection.
    pub reconnect_on_disconnection: bool,
    /// MTU to assume before the device reports one. `None` disables
    /// batching until `getMtu` arrives.
    pub default_mtu: Option<u16>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(1),
            reconnect_on_disconnection: false,
            default_mtu: None,
        }
    }
}

/// SMP firmware-update tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareConfig {
    /// Frame budget before the device reports its MTU.
    pub smp_mtu: usize,
    /// Match SMP responses strictly by sequence number.
    pub smp_strict_sequence: bool,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            smp_mtu: smp::DEFAULT_MTU,
            smp_strict_sequence: true,
        }
    }
}

/// Everything a [`Device`](crate::Device) needs besides its transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub firmware: FirmwareConfig,
}

/// Configuration for one bridge server connection.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bridge WebSocket URL (e.g., `ws://localhost:8080`).
    pub url: Url,
    pub ping_interval: Duration,
    pub reconnect: ReconnectConfig,
    /// Discovered devices not seen for this long are dropped.
    pub discovered_device_expiration: Duration,
    /// How often the discovered-device cache is swept.
    pub expiration_check_interval: Duration,
    /// Session settings for devices created through this bridge.
    pub session: SessionConfig,
}

impl BridgeConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            ping_interval: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
            discovered_device_expiration: Duration::from_secs(5),
            expiration_check_interval: Duration::from_secs(1),
            session: SessionConfig::default(),
        }
    }
}
