//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` variants into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use solekit_config::ConfigError;
use solekit_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the bridge: {message}")]
    #[diagnostic(
        code(solekit::bridge),
        help(
            "Check that the bridge is running and the URL is right.\n\
             Pass --url ws://host:port or set [bridge].url in the config file."
        )
    )]
    Bridge { message: String },

    #[error("Device is not connected")]
    #[diagnostic(
        code(solekit::not_connected),
        help("The device dropped off or never finished connecting. Try again closer to the bridge.")
    )]
    NotConnected,

    // ── Devices ──────────────────────────────────────────────────────
    #[error("Device '{identifier}' not found")]
    #[diagnostic(
        code(solekit::not_found),
        help("Run: solekit bridge scan to see nearby devices")
    )]
    NotFound { identifier: String },

    #[error("Device is busy: {message}")]
    #[diagnostic(code(solekit::busy))]
    Busy { message: String },

    #[error("Device rejected the request: {message}")]
    #[diagnostic(code(solekit::rejected))]
    Rejected { message: String },

    #[error("Protocol error: {message}")]
    #[diagnostic(code(solekit::protocol))]
    Protocol { message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(solekit::validation))]
    Validation { field: String, reason: String },

    #[error("Invalid firmware image {path}: {reason}")]
    #[diagnostic(
        code(solekit::invalid_image),
        help("Only signed mcuboot images can be uploaded. Check with: solekit image-info {path}")
    )]
    InvalidImage { path: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(solekit::config), help("Check the file shown by: solekit config path"))]
    Config(Box<ConfigError>),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Timed out after {seconds}s waiting for {what}")]
    #[diagnostic(
        code(solekit::timeout),
        help("Increase the wait with --timeout or check the bridge logs.")
    )]
    Timeout { what: String, seconds: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(solekit::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to render TOML: {0}")]
    #[diagnostic(code(solekit::toml))]
    Toml(#[from] toml::ser::Error),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(Box::new(other)),
        }
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Bridge { .. } | Self::NotConnected => exit_code::CONNECTION,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Busy { .. } => exit_code::CONFLICT,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::InvalidImage { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Bridge { message } | CoreError::Transport { message } => Self::Bridge { message },

            CoreError::NotConnected | CoreError::NotReady | CoreError::Disconnected => Self::NotConnected,

            CoreError::DeviceNotFound { identifier } => Self::NotFound { identifier },

            CoreError::AlreadyInProgress => Self::Busy {
                message: "another operation is already running".into(),
            },

            CoreError::InvalidState { message } => Self::Busy { message },

            CoreError::Validation { message } => Self::Validation {
                field: "input".into(),
                reason: message,
            },

            CoreError::SmpRejected { group, id, rc } => Self::Rejected {
                message: format!("SMP group {group} command {id} returned rc {rc}"),
            },

            CoreError::Protocol(e) => Self::Protocol { message: e.to_string() },
        }
    }
}
