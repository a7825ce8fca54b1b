use clap::{Parser, Subcommand};

pub mod error;
pub mod handler;
pub mod output;

/// tunegrab - background music download queue
#[derive(Parser, Debug)]
#[command(name = "tunegrab")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Override config directory path
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<std::path::PathBuf>,

    /// Enable verbose logging (TRACE level)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue a song
    Add {
        /// Song id on the source platform
        #[arg(long)]
        id: String,

        /// Song name
        #[arg(long)]
        name: String,

        /// Singer
        #[arg(long)]
        singer: String,

        /// Source platform key (kw, kg, tx, wy, mg)
        #[arg(long, default_value = "kw")]
        source: String,

        /// Album name
        #[arg(long)]
        album: Option<String>,

        /// Quality (128k, 192k, 320k, flac, flac24bit, wav, ape); defaults to the configured one
        #[arg(long)]
        quality: Option<String>,
    },

    /// Queue songs from a JSON file
    BatchAdd {
        /// File containing a JSON array of {id, name, singer, source, album?}
        file: String,

        /// Quality for every song in the file
        #[arg(long)]
        quality: Option<String>,
    },

    /// List all tasks
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show task status
    Status {
        /// Task ID
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download everything waiting in the queue (Ctrl+C pauses and exits)
    Run,

    /// Put a paused or failed task back in the queue
    Resume {
        /// Task ID
        id: String,
    },

    /// Re-queue a failed task and resolve its URL again
    Retry {
        /// Task ID
        id: String,
    },

    /// Remove a task
    Remove {
        /// Task ID
        id: String,
    },

    /// Remove all completed tasks
    ClearCompleted,

    /// Manage configuration
    Config {
        /// Configuration action
        #[command(subcommand)]
        action: ConfigAction,
    },
}

impl Commands {
    /// Commands that change the queue and need it written back
    pub fn mutates_queue(&self) -> bool {
        !matches!(
            self,
            Commands::List { .. } | Commands::Status { .. } | Commands::Config { .. }
        )
    }
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Configuration key (e.g., download.max_concurrent)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., download.max_concurrent)
        key: String,

        /// Configuration value
        value: String,
    },

    /// Show all configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
