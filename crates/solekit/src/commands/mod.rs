//! Command handlers, one module per command group.

pub mod bridge;
pub mod config_cmd;
pub mod files;

use solekit_config::Config;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load the configuration named by `--config`, or the default one.
pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = global.config.clone().unwrap_or_else(solekit_config::config_path);
    Ok(solekit_config::load_from(&path)?)
}
