use thiserror::Error;

/// Top-level error type for the `solekit-proto` crate.
///
/// Covers every failure mode of the wire layer: framing, enum lookups,
/// CBOR, SMP, firmware images, sensor payloads, and the WebSocket bridge.
/// `solekit-core` maps these into session-level diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Framing ─────────────────────────────────────────────────────
    /// A message type index outside the known enumeration.
    #[error("Unknown {kind} message type index {index}")]
    UnknownMessageType { kind: &'static str, index: u8 },

    /// Buffer ended before a complete field could be read.
    #[error("Truncated {context}: needed {needed} bytes, {available} available")]
    Truncated {
        context: &'static str,
        needed: usize,
        available: usize,
    },

    /// Payload does not fit the protocol's length field.
    #[error("Payload of {len} bytes exceeds the {max}-byte length field")]
    PayloadTooLarge { len: usize, max: usize },

    // ── Enumerations ────────────────────────────────────────────────
    /// Byte value does not name a variant of a closed enumeration.
    #[error("Invalid {kind} index {index}")]
    InvalidEnum { kind: &'static str, index: u8 },

    // ── CBOR ────────────────────────────────────────────────────────
    /// Malformed CBOR input.
    #[error("CBOR decode error at byte {offset}: {reason}")]
    Cbor { offset: usize, reason: String },

    // ── SMP ─────────────────────────────────────────────────────────
    /// SMP response is missing a field or carries the wrong type.
    #[error("Malformed SMP response: {0}")]
    Smp(String),

    // ── Firmware image ──────────────────────────────────────────────
    /// Firmware image header failed validation.
    #[error("Invalid image ({0})")]
    InvalidImage(&'static str),

    // ── Text ────────────────────────────────────────────────────────
    /// String field is not valid UTF-8.
    #[error("Invalid UTF-8 in {context}")]
    Utf8 {
        context: &'static str,
        #[source]
        source: std::str::Utf8Error,
    },

    // ── Validation ──────────────────────────────────────────────────
    /// An outgoing value failed a range or shape check.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    // ── Bridge ──────────────────────────────────────────────────────
    /// JSON payload inside a bridge message could not be (de)serialized.
    #[error("Bridge JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket send queue is closed (socket task ended).
    #[error("WebSocket closed")]
    WebSocketClosed,
}

impl Error {
    pub(crate) fn truncated(context: &'static str, needed: usize, available: usize) -> Self {
        Self::Truncated {
            context,
            needed,
            available,
        }
    }

    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error means host and device disagree about
    /// the wire format. These are never skipped silently.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownMessageType { .. }
                | Self::Truncated { .. }
                | Self::InvalidEnum { .. }
                | Self::Cbor { .. }
                | Self::Smp(_)
                | Self::Utf8 { .. }
        )
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WebSocketConnect(_) | Self::WebSocketClosed)
    }
}
