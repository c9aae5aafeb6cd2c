//! Device sessions between `solekit-proto` and applications (CLI, bridges).
//!
//! This crate owns the stateful half of the insole protocol:
//!
//! - **[`Device`]**: one session per insole. Wraps a [`Transport`] in a
//!   [`ConnectionManager`], runs the connect handshake, keeps the latest
//!   value of every message type and exposes typed managers for
//!   information, sensors, file transfer, TFLite, vibration and firmware.
//!
//! - **[`ConnectionManager`]**: connection-status state machine with
//!   liveness polling, automatic reconnection and MTU-sized batching of
//!   outbound messages.
//!
//! - **[`DeviceRegistry`]**: the set of sessions an application knows
//!   about, with added/removed/connected/disconnected notifications.
//!
//! - **[`BridgeClient`]**: a WebSocket client for a bridge server that owns
//!   the radios. Hands out `Device`s backed by a [`BridgeTransport`].
//!
//! Events fan out over `tokio::sync::broadcast`; [`EventStream`] adapts
//! any of them to a `futures_core::Stream`.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod event;
pub(crate) mod pending;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::{BridgeClient, BridgeEvent, BridgeTransport};
pub use config::{BridgeConfig, ConnectionConfig, FirmwareConfig, SessionConfig};
pub use connection::{ConnectionManager, ConnectionStatus, DeviceMessage};
pub use device::Device;
pub use error::CoreError;
pub use event::DeviceEvent;
pub use registry::{DeviceId, DeviceRegistry, RegistryEvent};
pub use stream::EventStream;
pub use transport::{Transport, TransportEvent, WriteTarget};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
