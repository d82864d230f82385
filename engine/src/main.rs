// Warden security-assessment orchestrator
// Main entry point for the warden binary

use clap::Parser;
use warden_engine::cli::{Cli, Command, ConfigAction};
use warden_engine::config::Config;
use warden_engine::handlers::{
    handle_config_path, handle_config_show, handle_health, handle_plan, handle_run, handle_tools,
    OutputFormat,
};
use warden_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // `config path` must work even when the file is broken
    if let Command::Config {
        action: ConfigAction::Path,
    } = &cli.command
    {
        return handle_config_path(cli.config.as_deref(), format).await;
    }

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    tracing::debug!(
        "Warden v{} ({} - {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    match cli.command {
        Command::Run { args, concurrency } => handle_run(args, concurrency, config, format).await,
        Command::Plan { args } => handle_plan(args, config, format).await,
        Command::Health { capability } => handle_health(capability, &config, format).await,
        Command::Tools => handle_tools(&config, format).await,
        Command::Config { action } => match action {
            ConfigAction::Show => handle_config_show(&config, format).await,
            ConfigAction::Path => handle_config_path(cli.config.as_deref(), format).await,
        },
    }
}
