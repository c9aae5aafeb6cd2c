// ── Core error types ──
//
// Session-level errors from solekit-core. Callers never match on raw wire
// errors; the `From<solekit_proto::Error>` impl sorts them into protocol
// violations, validation failures and bridge connectivity problems.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Device is not connected")]
    NotConnected,

    #[error("Connection already in progress")]
    AlreadyInProgress,

    #[error("Device is not ready (handshake incomplete)")]
    NotReady,

    #[error("Device disconnected before responding")]
    Disconnected,

    #[error("Transport error: {message}")]
    Transport { message: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Device rejected SMP request (group {group}, id {id}): rc {rc}")]
    SmpRejected { group: u16, id: u8, rc: i64 },

    // ── Lookup errors ────────────────────────────────────────────────
    #[error("Device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    // ── Wire errors (wrapped) ────────────────────────────────────────
    #[error("Protocol error: {0}")]
    Protocol(#[source] solekit_proto::Error),

    #[error("Bridge error: {message}")]
    Bridge { message: String },
}

impl CoreError {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<solekit_proto::Error> for CoreError {
    fn from(err: solekit_proto::Error) -> Self {
        use solekit_proto::Error as E;
        match err {
            E::Validation { field, reason } => CoreError::Validation {
                message: format!("{field}: {reason}"),
            },
            E::PayloadTooLarge { len, max } => CoreError::Validation {
                message: format!("payload of {len} bytes exceeds {max}"),
            },
            E::InvalidImage(reason) => CoreError::Validation {
                message: format!("invalid firmware image: {reason}"),
            },
            E::WebSocketConnect(reason) => CoreError::Bridge {
                message: format!("WebSocket connection failed: {reason}"),
            },
            E::WebSocketClosed => CoreError::Bridge {
                message: "WebSocket closed".into(),
            },
            other => CoreError::Protocol(other),
        }
    }
}
