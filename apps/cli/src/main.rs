//! dltrack CLI - Command-line download tracker
//!
//! Fetches files over HTTP and keeps a persistent, searchable history of
//! every download.

mod commands;
mod output;
mod progress;
mod transfer;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// dltrack - download lifecycle manager
#[derive(Parser)]
#[command(name = "dltrack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for dltrack
    #[arg(long, env = "DLTRACK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Day {
    Today,
    Yesterday,
    Older,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL into the downloads directory
    Get {
        /// URL to download
        url: String,

        /// File name to save as (defaults to the last URL segment)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List downloads, newest first
    List {
        /// Only show downloads started on this day
        #[arg(short, long)]
        day: Option<Day>,

        /// Group by Today / Yesterday / Older
        #[arg(short, long)]
        grouped: bool,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Search downloads by file name or URL
    Search {
        /// Text to look for (case-insensitive)
        query: String,
    },

    /// Show download info
    Info {
        /// Download ID (or a unique prefix)
        id: String,
    },

    /// Download a failed or cancelled item again
    Retry {
        /// Download ID (or a unique prefix)
        id: String,
    },

    /// Remove a download from the history
    Remove {
        /// Download ID (or a unique prefix)
        id: String,
    },

    /// Clear the download history
    Clear {
        /// Only remove completed downloads
        #[arg(long)]
        completed: bool,

        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Open a completed download
    Open {
        /// Download ID (or a unique prefix)
        id: String,
    },

    /// Show a completed download in the file browser
    Reveal {
        /// Download ID (or a unique prefix)
        id: String,
    },

    /// Apply the retention policy now
    Prune,

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "dltrack", &mut std::io::stdout());
        return Ok(());
    }

    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("dltrack"))
            .unwrap_or_else(|| PathBuf::from(".dltrack"))
    });

    // Initialize core
    let transfer = Arc::new(transfer::HttpTransfer::new()?);
    let registry = dltrack_core::RegistryHandle::open(&data_dir, transfer).await?;

    // Execute command
    let result = match cli.command {
        Commands::Get { url, name } => commands::get(&registry, &url, name, cli.output).await,

        Commands::List { day, grouped, all } => {
            commands::list_downloads(&registry, day, grouped, all, cli.output).await
        }

        Commands::Search { query } => commands::search(&registry, &query, cli.output).await,

        Commands::Info { id } => commands::show_info(&registry, &id, cli.output).await,

        Commands::Retry { id } => commands::retry(&registry, &id, cli.output).await,

        Commands::Remove { id } => commands::remove(&registry, &id, cli.output).await,

        Commands::Clear { completed, yes } => {
            commands::clear(&registry, completed, yes, cli.output).await
        }

        Commands::Open { id } => commands::open(&registry, &id, false).await,

        Commands::Reveal { id } => commands::open(&registry, &id, true).await,

        Commands::Prune => commands::prune(&registry, cli.output).await,

        Commands::Config { action } => commands::config_action(&registry, action, cli.output).await,

        Commands::Completions { .. } => Ok(()),
    };

    // Run the quit-time retention pass even if the command failed
    registry.shutdown().await?;
    result
}
