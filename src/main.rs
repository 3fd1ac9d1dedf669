use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reconflow::config::{LogFormat, ReconToml};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "reconflow")]
#[command(version, about = "Reconnaissance pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding reconflow.toml and the .reconflow state directory
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log format: pretty, json. Overrides reconflow.toml.
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scan against a target domain and wait for it to finish
    Scan {
        /// Target domain, e.g. example.com
        target: String,

        /// Scan profile
        #[arg(short, long, default_value = "standard")]
        profile: String,

        /// Maximum concurrent stages (overrides config and RECONFLOW_WORKERS)
        #[arg(short, long)]
        workers: Option<usize>,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,

        /// Keep scan state in memory only; nothing is written to the journal
        #[arg(long)]
        ephemeral: bool,
    },
    /// List scan profiles and their execution waves
    Profiles,
    /// Show recorded scans, or one scan's stages
    Status {
        /// Scan ID to inspect
        #[arg(long)]
        scan: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove finished scans older than the given age
    Cleanup {
        /// Age in days
        #[arg(long, default_value = "30")]
        days: u64,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default reconflow.toml file
    Init,
}

/// Default log level when RUST_LOG is unset. The full scan UI owns the
/// terminal, so only warnings reach the console unless asked for.
fn default_level(cli: &Cli) -> &'static str {
    if cli.verbose {
        return "debug";
    }
    match &cli.command {
        Commands::Scan { ui, .. } if ui != "full" => "info",
        _ => "warn",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let toml = ReconToml::load_or_default(&project_dir)?;
    let format = match cli.log_format.as_deref() {
        Some(f) => f.parse::<LogFormat>()?,
        None => toml.logging.format,
    };
    let log_dir = toml.logging.dir.as_ref().map(|d| project_dir.join(d));
    let _log_guard = reconflow::logging::init_logging(format, log_dir.as_deref(), default_level(&cli))
        .context("Failed to initialize logging")?;

    match &cli.command {
        Commands::Scan {
            target,
            profile,
            workers,
            ui,
            ephemeral,
        } => {
            cmd::cmd_scan(
                &project_dir,
                cmd::ScanArgs {
                    target,
                    profile,
                    workers: *workers,
                    ui,
                    ephemeral: *ephemeral,
                    verbose: cli.verbose,
                },
            )
            .await?;
        }
        Commands::Profiles => cmd::cmd_profiles(&project_dir)?,
        Commands::Status { scan, json } => cmd::cmd_status(&project_dir, scan.as_deref(), *json)?,
        Commands::Cleanup { days } => cmd::cmd_cleanup(&project_dir, *days)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
