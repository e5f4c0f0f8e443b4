//! VExport CLI - Command-line chunked video exporter
//!
//! Splits recorded time ranges into bounded chunks and downloads them
//! one after another through an export-link endpoint.

mod commands;
mod output;
mod progress;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vexport_types::{ExportConfig, ExportFormat};

/// VExport - Chunked Video Export
#[derive(Parser)]
#[command(name = "vexport")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, env = "VEXPORT_CONFIG")]
    config: Option<PathBuf>,

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

#[derive(Subcommand)]
enum Commands {
    /// Show how export items would be split into chunks
    Plan {
        /// JSON file with an array of export items
        #[arg(short, long)]
        items: PathBuf,

        /// Container format
        #[arg(short, long)]
        format: Option<ExportFormat>,
    },

    /// Export every chunk of the given items
    Run {
        /// JSON file with an array of export items
        #[arg(short, long)]
        items: PathBuf,

        /// Export-link endpoint
        #[arg(short, long, env = "VEXPORT_ENDPOINT")]
        endpoint: String,

        /// Bearer token for the export-link endpoint
        #[arg(long, env = "VEXPORT_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Directory to write chunks to
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Container format
        #[arg(short, long)]
        format: Option<ExportFormat>,

        /// Cancel on Ctrl-C without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "vexport_core=debug,vexport=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>, format: Option<ExportFormat>) -> Result<ExportConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => ExportConfig::default(),
    };
    if let Some(format) = format {
        config.format = format;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Plan { items, format } => {
            let config = load_config(cli.config.as_ref(), format)?;
            commands::plan(&config, &items, cli.output)?
        }

        Commands::Run {
            items,
            endpoint,
            token,
            dest,
            format,
            yes,
        } => {
            let mut config = load_config(cli.config.as_ref(), format)?;
            if dest.is_some() {
                config.destination = dest;
            }
            commands::run(config, &items, &endpoint, token, yes, cli.output).await?
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "vexport", &mut std::io::stdout());
        }
    }

    Ok(())
}
