use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{ManualClock, RateLimiter};
use tollgate::replay::{replay, Trace};

/// Keyed token-bucket admission control.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a configuration file and print the buckets it declares
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Replay a request trace against the configured buckets on simulated time
    Replay {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        trace: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tollgate");

    match cli.command {
        Command::Check { config } => check(&config),
        Command::Replay { config, trace } => run_replay(&config, &trace),
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(format: LogFormat, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn check(config_path: &Path) -> anyhow::Result<()> {
    let config = TollgateConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let limiter = RateLimiter::from_config(&config, ManualClock::new())?;

    for snapshot in limiter.snapshot_all() {
        println!("{}", serde_json::to_string(&snapshot)?);
    }

    info!(buckets = limiter.bucket_count(), "Configuration is valid");
    Ok(())
}

fn run_replay(config_path: &Path, trace_path: &Path) -> anyhow::Result<()> {
    let config = TollgateConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let trace = Trace::from_file(trace_path)
        .with_context(|| format!("failed to load {}", trace_path.display()))?;

    let clock = ManualClock::new();
    let limiter = RateLimiter::from_config(&config, clock.clone())?;

    for record in replay(&limiter, &clock, &trace, config.limiter.idle_eviction()) {
        println!("{}", serde_json::to_string(&record)?);
    }

    for snapshot in limiter.snapshot_all() {
        println!("{}", serde_json::to_string(&snapshot)?);
    }

    Ok(())
}
