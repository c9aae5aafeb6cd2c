//! Config subcommand handlers.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            let path = global.config.clone().unwrap_or_else(solekit_config::config_path);
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = super::load_config(global)?;
            let text = toml::to_string_pretty(&cfg)?;
            let out = output::render_single(
                &global.output,
                &cfg,
                |_| text.clone(),
                |c| c.bridge.url.clone().unwrap_or_default(),
            )?;
            output::print_output(out.trim_end(), global.quiet);
            Ok(())
        }
    }
}
