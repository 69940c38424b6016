use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use restic_monitor::config::{dry_run_from_env, LoggingConfig};
use restic_monitor::health::CheckResult;
use restic_monitor::{Config, Daemon, HealthCheck};

#[derive(Parser)]
#[command(name = "restic-monitor")]
#[command(about = "Metrics and scheduled maintenance for restic repositories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to /etc/restic-monitor or the XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor the configured repositories until interrupted (default)
    Run {
        /// Pass --dry-run to restic forget, no snapshots are removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Check the restic binary and configuration
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_config_path()?,
    };
    let config = Config::load(&config_path)?;

    init_logging(cli.verbose, &config.logging)?;
    info!("Starting restic-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %config_path.display(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => cmd_run(&config, dry_run || dry_run_from_env()).await,
        Commands::Doctor => cmd_doctor(&config),
    }
}

/// Initialize logging from the config, `--verbose` forces debug
///
/// RUST_LOG takes precedence over both.
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {:?}", level))?;

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "json" => registry.with(fmt::layer().json()).init(),
        "pretty" => registry
            .with(fmt::layer().pretty().with_ansi(logging.color))
            .init(),
        _ => registry
            .with(fmt::layer().compact().with_ansi(logging.color))
            .init(),
    }

    Ok(())
}

/// Run the monitor until SIGTERM or SIGINT
async fn cmd_run(config: &Config, dry_run: bool) -> Result<()> {
    let daemon = Daemon::new(config, dry_run)?;
    daemon.run().await
}

/// System health check and diagnostics
fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config);
    print_health_report(&health);

    if !health.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 restic-monitor Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(&name, result);
        println!();
    }

    let errors = health.errors().len();
    let warnings = health.warnings().len();
    if health.all_passed() {
        println!("✅ All checks passed ({} warnings)", warnings);
    } else {
        println!("❌ Some checks failed ({} errors, {} warnings)", errors, warnings);
    }
}
