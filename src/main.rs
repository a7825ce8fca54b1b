use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tunegrab::{
    app::config::Config,
    cli::{self, Cli},
    download::manager::DownloadManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first to get verbose flag
    let cli = Cli::parse();

    // Set config directory override if --config flag was used
    if let Some(ref config_dir) = cli.config {
        tunegrab::util::paths::set_config_dir_override(Some(config_dir.clone()));
    }

    // Get logs directory (creates if needed)
    let logs_dir = tunegrab::util::paths::get_logs_dir().unwrap_or_else(|_| PathBuf::from("."));
    std::fs::create_dir_all(&logs_dir).ok();

    // Set up daily rotating file appender
    let file_appender = tracing_appender::rolling::daily(&logs_dir, "app.jsonl");
    let (non_blocking, log_guard) = tracing_appender::non_blocking(file_appender);

    let log_level = if cli.verbose {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };

    // Initialize logging with JSON format for structured logs
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(tracing_subscriber::filter::LevelFilter::from_level(log_level)),
        )
        .init();

    tracing::info!("Starting tunegrab...");
    if cli.verbose {
        tracing::info!("Verbose logging enabled (TRACE level)");
    }
    tracing::trace!("CLI arguments: {:?}", cli);
    if let Some(ref config_dir) = cli.config {
        tracing::info!("Using config directory override: {:?}", config_dir);
    }

    // A broken settings file is not replaced by defaults; `config set` would overwrite it
    let config = Config::load().context("Failed to load settings; fix or delete settings.toml")?;
    tracing::info!(
        "Config loaded: max_concurrent={}, quality={}",
        config.download.max_concurrent,
        config.download.quality
    );

    let manager = DownloadManager::from_config(&config).context("Failed to build download manager")?;
    // One-shot commands must not start transfers; `run` releases the queue
    manager.hold_queue();

    let queue_path = tunegrab::util::paths::get_queue_path()?;
    // A broken queue file is not overwritten; fix or delete it by hand
    let count = manager
        .load_queue(&queue_path)
        .await
        .with_context(|| format!("Failed to load queue from {:?}", queue_path))?;
    tracing::info!("Loaded {} task(s) from {:?}", count, queue_path);

    let exit_code = cli::handler::handle_command(cli.command, config, manager, &queue_path).await;

    // Flush buffered log lines before exiting
    drop(log_guard);
    std::process::exit(exit_code);
}
