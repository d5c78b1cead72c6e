//! clipbot - Main entry point.

use anyhow::Result;
use clap::{Parser, Subcommand};
use clipbot::config::Config;
use clipbot::logging::init_logging;
use std::path::PathBuf;

/// Telegram bot for quick media edits: convert, merge, split, extract
/// audio, overlay audio, rename.
#[derive(Parser, Debug)]
#[command(name = "clipbot")]
#[command(version)]
#[command(about = "Telegram bot for quick media edits", long_about = None)]
struct Cli {
    /// Path to config.toml (default: platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bot (default)
    Run,
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_with_env(cli.config.as_deref())?;

    init_logging(&config.log_level, &config.log_format);
    tracing::info!("clipbot v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => clipbot::bot::run(config).await,
        Commands::CheckConfig => {
            config.validate()?;
            println!("Configuration OK");
            println!("  staging dir:      {}", config.expanded_temp_dir().display());
            println!("  video extensions: {}", config.video_extensions.join(", "));
            println!("  audio extensions: {}", config.audio_extensions.join(", "));
            println!("  upload limit:     {} MB", config.max_upload_bytes / (1024 * 1024));
            Ok(())
        }
    }
}
