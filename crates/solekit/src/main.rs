mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose, cli.global.json);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// Logs go to stderr so stdout stays parseable.
fn init_tracing(verbosity: u8, json: bool) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        // File commands need neither config nor a bridge
        Command::Checksum(args) => commands::files::checksum(&args, &cli.global),
        Command::ImageInfo(args) => commands::files::image_info(&args, &cli.global),

        Command::Config(args) => commands::config_cmd::handle(&args, &cli.global),

        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "solekit", &mut std::io::stdout());
            Ok(())
        }

        Command::Bridge(args) => {
            tracing::debug!(command = ?args.command, "dispatching bridge command");
            commands::bridge::handle(args, &cli.global).await
        }
    }
}
