//! Keel CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

#[cfg(test)]
mod handlers_tests;

use commands::{Commands, ConfigCommands, GlobalArgs};
use config::{CliConfig, LogFormat};

#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about = "Keel build graph orchestrator", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

fn init_logging(verbose: bool, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(verbose);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load().unwrap_or_default();
    init_logging(cli.global.verbose, config.log_format(&cli.global));
    tracing::debug!(config = ?config, "Loaded CLI configuration");

    match cli.command {
        Commands::Init { path } => handlers::init(&path)?,
        Commands::Validate => handlers::validate(config.engine_config(&cli.global)?)?,
        Commands::Run(args) => {
            handlers::run(config.engine_config(&cli.global)?, &args, false).await?
        }
        Commands::List(args) => {
            handlers::run(config.engine_config(&cli.global)?, &args, true).await?
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config, &cli.global)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(())
}
