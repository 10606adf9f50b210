mod cmd;
mod output;
mod root;

use cadence_core::types::{JobStatus, PlatformKind};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cadence",
    about = "Simulate believable team activity against collaboration platforms",
    version,
    propagate_version = true
)]
struct Cli {
    /// Directory holding .cadence/ (default: auto-detect, then cwd)
    #[arg(long, global = true, env = "CADENCE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore persisted jobs and run them until Ctrl-C
    Serve {
        /// Start a new job from this config file (repeatable)
        #[arg(long = "start", value_name = "CONFIG")]
        start: Vec<PathBuf>,
    },

    /// List jobs
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        platform: Option<PlatformKind>,
    },

    /// Show one job
    Show {
        id: String,
        /// Number of recent activity records to print
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Mark a job stopped so `serve` no longer restores it
    Stop { id: String },

    /// Remove a job's snapshot
    Delete { id: String },

    /// Validate a job config file without starting it
    Check { config: PathBuf },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Serve { start } => cmd::serve::run(&root, &start),
        Commands::Jobs { status, platform } => cmd::jobs::run(&root, status, platform, cli.json),
        Commands::Show { id, limit } => cmd::show::run(&root, &id, limit, cli.json),
        Commands::Stop { id } => cmd::jobs::stop(&root, &id),
        Commands::Delete { id } => cmd::jobs::delete(&root, &id),
        Commands::Check { config } => cmd::check::run(&config, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
