//! Clap derive structures for the `solekit` CLI.
//!
//! Defines the command tree, global flags, and shared types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// solekit -- diagnostics for smart insoles and their bridges
#[derive(Debug, Parser)]
#[command(
    name = "solekit",
    version,
    about = "Inspect smart-insole firmware and talk to devices through a bridge",
    long_about = "Diagnostic tooling for smart-insole devices.\n\n\
        Offline commands inspect files (checksums, firmware images). Bridge\n\
        commands connect to a WebSocket bridge to scan for, watch, and update\n\
        devices.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "SOLEKIT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Seconds to wait for the bridge or a device before giving up
    #[arg(long, default_value = "10", global = true)]
    pub timeout: u64,
}

// ── Output Enum ──────────────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// CRC32 of a file, as used by device file transfers
    Checksum(ChecksumArgs),

    /// Validate an mcuboot firmware image and print its header
    #[command(name = "image-info")]
    ImageInfo(ImageInfoArgs),

    /// Talk to devices through a WebSocket bridge
    #[command(alias = "b")]
    Bridge(BridgeArgs),

    /// Inspect the configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  FILES
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ChecksumArgs {
    /// File to checksum
    pub file: PathBuf,
}

#[derive(Debug, Args)]
pub struct ImageInfoArgs {
    /// Firmware image (mcuboot format)
    pub file: PathBuf,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  BRIDGE
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct BridgeArgs {
    /// Bridge WebSocket URL (overrides [bridge].url)
    #[arg(long, short = 'u', env = "SOLEKIT_BRIDGE_URL", global = true)]
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: BridgeCommand,
}

#[derive(Debug, Subcommand)]
pub enum BridgeCommand {
    /// Scan for nearby devices and list what the bridge discovers
    Scan {
        /// Seconds to scan for
        #[arg(long, short = 'd', default_value = "5")]
        duration: u64,
    },

    /// Connect a device and print every event it reports as JSON
    Watch {
        /// Bluetooth id of the device
        device_id: String,
    },

    /// Upload a firmware image to a device
    Firmware {
        /// Bluetooth id of the device
        device_id: String,

        /// Firmware image (mcuboot format)
        image: PathBuf,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  CONFIG
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Display the resolved configuration (file + environment)
    Show,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  COMPLETIONS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bridge_url_is_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "solekit",
            "bridge",
            "watch",
            "--url",
            "ws://localhost:8080",
            "dev-1",
        ])
        .unwrap();
        let Command::Bridge(args) = cli.command else {
            panic!("expected bridge command");
        };
        assert_eq!(args.url.as_deref(), Some("ws://localhost:8080"));
        assert!(matches!(args.command, BridgeCommand::Watch { ref device_id } if device_id == "dev-1"));
    }
}
