/// TubeCast CLI - multi-account comment scheduling engine.
///
/// Entry point for the tubecast binary. Parses CLI arguments,
/// initializes logging, and dispatches to subcommand handlers.
mod commands;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tubecast_core::config::Config;

/// Multi-account comment scheduling engine
#[derive(Parser)]
#[command(name = "tubecast")]
#[command(version)]
#[command(about = "Multi-account comment scheduling engine")]
#[command(after_help = "\
Quick start:
  1. tubecast init     — write a default configuration file
  2. tubecast run      — start the engine
  3. tubecast status   — show per-schedule progress")]
struct Cli {
    /// Path to config.toml
    #[arg(short = 'c', long, global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init(commands::InitArgs),
    /// Start the engine
    Run(commands::RunArgs),
    /// Show per-schedule progress counters
    Status(commands::StatusArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > --verbose/--quiet flags > default.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("tubecast=debug,tubecast_core=debug,info")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::new("tubecast=info,tubecast_core=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .compact()
        .init();

    // `init` manages its own config lifecycle.
    if let Commands::Init(args) = cli.command {
        return commands::init::execute(&args, cli.config.as_deref());
    }

    let config = load_config(cli.config.as_deref()).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {e}\n\
             Hint: Run 'tubecast init' to create a default configuration file."
        )
    })?;

    match cli.command {
        Commands::Init(_) => unreachable!("handled above"),
        Commands::Run(args) => commands::run::execute(&args, config).await,
        Commands::Status(args) => commands::status::execute(&args, config).await,
    }
}

fn load_config(path: Option<&str>) -> Result<Config, tubecast_core::ConfigError> {
    match path {
        Some(path) => Config::load(std::path::Path::new(path)),
        None => Config::load_or_default(),
    }
}
