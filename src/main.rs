// Isolaunch - Main Entry Point
//
// CLI over the library:
// - launch: run a batch of identities through isolated launches
// - status / info: read-only views of the isolation state
// - sweep: reconcile and purge leftovers
// - sanitize: show the directory name an identity maps to

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use isolaunch_orchestrator::config::Config;
use isolaunch_orchestrator::launch::{
    BatchControl, BatchReport, LaunchOrchestrator, MapCredentials, ProcessCountProbe,
};
use isolaunch_orchestrator::storage::{sanitize, IsolationManager, IsolationStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Isolaunch: one storage area per identity, one launch at a time
#[derive(Parser, Debug)]
#[command(name = "isolaunch")]
#[command(author = "Isolaunch Contributors")]
#[command(version)]
#[command(about = "Launch identities sequentially with per-identity storage isolation", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch identities one after another
    Launch {
        /// Target passed to the launcher for every identity
        #[arg(long)]
        target: String,

        /// JSON file mapping identity -> token
        #[arg(long)]
        tokens: Option<PathBuf>,

        /// Identities, launched in the given order
        #[arg(required = true)]
        identities: Vec<String>,
    },
    /// Show the current isolation state
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show where an identity's storage lives
    Info {
        identity: String,
    },
    /// Reconcile state and purge stale areas and backups
    Sweep {
        /// Override cleanup.max_age_hours
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    /// Print the directory name an identity maps to
    Sanitize {
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    init_tracing(&config, args.verbose)?;

    match args.command {
        Commands::Launch {
            target,
            tokens,
            identities,
        } => launch(&config, &target, tokens, identities).await,
        Commands::Status { json } => status(&config, json),
        Commands::Info { identity } => identity_info(&config, &identity),
        Commands::Sweep { max_age_hours } => sweep(&config, max_age_hours),
        Commands::Sanitize { name } => {
            println!("{}", sanitize(&name));
            Ok(())
        }
    }
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

async fn launch(
    config: &Config,
    target: &str,
    tokens: Option<PathBuf>,
    identities: Vec<String>,
) -> Result<()> {
    let storage = Arc::new(config.isolation_manager()?);
    if config.cleanup.sweep_on_startup {
        if let Err(e) = storage.sweep(config.cleanup_max_age(), &identities) {
            warn!("Startup sweep failed: {}", e);
        }
    }

    let process_name = config.launch.process_name.trim();
    if process_name.is_empty() {
        anyhow::bail!("launch.process_name is not configured");
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut builder = LaunchOrchestrator::builder(
        Arc::clone(&storage),
        Arc::new(config.command_launcher()),
        Arc::new(ProcessCountProbe::new(process_name)),
    )
    .settings(config.orchestrator_settings())
    .events(events_tx);
    if let Some(path) = tokens {
        let credentials = MapCredentials::from_json_file(&path)?;
        builder = builder.credentials(Arc::new(credentials));
    }
    let orchestrator = builder.build();

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            println!("{}", event);
        }
    });

    let control = BatchControl::new();
    {
        let control = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current identity");
                control.stop();
            }
        });
    }

    let report = orchestrator.run_batch(&identities, target, &control).await;
    drop(orchestrator);
    printer.await.context("Status printer task failed")?;

    print_report(&report);
    if report.failed() > 0 {
        anyhow::bail!(
            "{} of {} identities failed",
            report.failed(),
            report.outcomes.len()
        );
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    println!();
    for outcome in &report.outcomes {
        match (&outcome.failed_stage, &outcome.error) {
            (Some(stage), Some(error)) => {
                println!("  {:<24} failed at {}: {}", outcome.identity, stage, error)
            }
            _ => println!("  {:<24} ok", outcome.identity),
        }
    }
    println!(
        "{} succeeded, {} failed{}",
        report.succeeded(),
        report.failed(),
        if report.cancelled { " (stopped early)" } else { "" }
    );
}

fn manager(config: &Config) -> Result<IsolationManager> {
    config.isolation_manager()
}

fn status(config: &Config, json: bool) -> Result<()> {
    let status = manager(config)?.status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_status(status: &IsolationStatus) {
    let state = status
        .shared_state
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unreadable".to_string());
    println!("Shared path:  {} ({})", status.shared_path.display(), state);
    println!("Redirects:    {}", status.redirect_method);

    if status.records.is_empty() {
        println!("No active isolation");
    }
    for record in &status.records {
        println!(
            "  {:<24} active={} target_exists={} since {} -> {}",
            record.identity,
            record.active,
            record.target_exists,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.area_path.display()
        );
    }
    if let Some(journal) = &status.journal {
        println!(
            "Journal:      {} since {}",
            journal.identity,
            journal.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn identity_info(config: &Config, identity: &str) -> Result<()> {
    let info = manager(config)?.identity_info(identity);
    println!("Identity:       {}", info.identity);
    println!("Directory name: {}", info.sanitized_name);
    println!("Area:           {}", info.area_root.display());
    println!(
        "Content:        {} ({})",
        info.content_path.display(),
        if info.content_exists { "exists" } else { "missing" }
    );
    println!("Registered:     {}", info.registered);
    println!("Active:         {}", info.active);
    if let Some(state) = &info.shared_state {
        println!("Shared path:    {}", state);
    }
    Ok(())
}

fn sweep(config: &Config, max_age_hours: Option<u64>) -> Result<()> {
    let max_age = match max_age_hours {
        Some(hours) => Duration::from_secs(hours.saturating_mul(3600)),
        None => config.cleanup_max_age(),
    };
    let report = manager(config)?.sweep(max_age, &[])?;

    info!("Sweep complete");
    println!("{}", report);
    for violation in &report.violations {
        println!("  unresolved: {}", violation);
    }
    Ok(())
}
