//! mysql-ch-sync CLI - incremental MySQL to ClickHouse synchronization.

use clap::{Parser, Subcommand};
use mysql_ch_sync::config::{self, AliasConfig};
use mysql_ch_sync::{Orchestrator, RunSummary, SyncError};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mysql-ch-sync")]
#[command(about = "Incremental MySQL to ClickHouse table synchronization")]
#[command(version)]
struct Cli {
    /// Directory holding one configuration directory per alias
    #[arg(long, default_value = "home")]
    home: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run migrations and transfers for every alias
    Run {
        /// Only process these aliases
        #[arg(long, num_args = 1..)]
        names: Option<Vec<String>>,

        /// Keep re-running scheduled transfers until interrupted
        #[arg(long)]
        service: bool,

        /// Maximum concurrent transfers in service mode
        #[arg(long, default_value = "4")]
        pool_size: usize,
    },

    /// Show destination table statistics per alias
    Stats {
        /// Only show these aliases
        #[arg(long, num_args = 1..)]
        names: Option<Vec<String>>,
    },

    /// Load and validate configuration without connecting
    Check {
        /// Only check these aliases
        #[arg(long, num_args = 1..)]
        names: Option<Vec<String>>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), SyncError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(SyncError::Config)?;

    match cli.command {
        Commands::Run {
            ref names,
            service,
            pool_size,
        } => {
            let aliases = load(&cli.home, names.as_deref())?;
            let cancel_token = setup_signal_handler().await?;
            let orchestrator = Arc::new(Orchestrator::new(aliases).with_pool_size(pool_size));

            let summary = orchestrator.run_once(&cancel_token).await;
            print_summary(&summary, cli.output_json)?;

            if service && !cancel_token.is_cancelled() {
                info!("Entering service mode");
                Arc::clone(&orchestrator).serve(cancel_token).await?;
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&orchestrator.statuses().await)?);
                }
                return Ok(());
            }

            if summary.has_failures() {
                return Err(SyncError::Transfer {
                    alias: summary.failed_aliases.join(", "),
                    message: format!(
                        "{} of {} aliases failed",
                        summary.aliases_failed, summary.aliases_total
                    ),
                });
            }
        }

        Commands::Stats { ref names } => {
            let aliases = load(&cli.home, names.as_deref())?;
            let stats = Orchestrator::new(aliases).stats().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                for entry in &stats {
                    match (&entry.stats, &entry.error) {
                        (_, Some(err)) => println!("{}: error: {}", entry.alias, err),
                        (None, None) => println!("{}: table does not exist", entry.alias),
                        (Some(s), None) => {
                            println!("{}:", entry.alias);
                            println!("  Rows: {}", s.rows);
                            println!("  Bytes on disk: {}", s.bytes_on_disk);
                            println!("  Compression ratio: {:.2}", s.compression_ratio());
                            if let Some(ref engine) = s.engine {
                                println!("  Engine: {}", engine);
                            }
                            if let Some(modified) = s.last_modified {
                                println!("  Last modified: {}", modified);
                            }
                        }
                    }
                }
            }
        }

        Commands::Check { ref names } => {
            let aliases = load(&cli.home, names.as_deref())?;
            let checked: Vec<_> = aliases
                .iter()
                .map(|a| {
                    json!({
                        "alias": a.spec.alias,
                        "incremental": a.spec.supports_incremental(),
                        "schedule": a.spec.schedule.as_ref().map(|s| s.interval.clone()),
                        "migrations": a.migrations.len(),
                    })
                })
                .collect();

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&checked)?);
            } else {
                for a in &aliases {
                    println!(
                        "{}: OK ({}, {} migrations{})",
                        a.spec.alias,
                        if a.spec.supports_incremental() { "incremental" } else { "full refresh" },
                        a.migrations.len(),
                        a.spec
                            .schedule
                            .as_ref()
                            .map(|s| format!(", every {}", s.interval))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}

fn load(home: &Path, names: Option<&[String]>) -> Result<Vec<AliasConfig>, SyncError> {
    let aliases = config::load_all(home, names)?;
    if aliases.is_empty() {
        return Err(SyncError::Config(format!(
            "no alias configuration found under {}",
            home.display()
        )));
    }
    info!("Loaded {} aliases from {:?}", aliases.len(), home);
    Ok(aliases)
}

fn print_summary(summary: &RunSummary, output_json: bool) -> Result<(), SyncError> {
    if output_json {
        println!("{}", summary.to_json()?);
        return Ok(());
    }

    println!("\nSync {}!", summary.status);
    println!("  Run ID: {}", summary.run_id);
    println!("  Duration: {:.2}s", summary.duration_seconds);
    println!(
        "  Aliases: {}/{}",
        summary.aliases_success, summary.aliases_total
    );
    println!("  Rows: {}", summary.rows_transferred);
    println!("  Throughput: {} rows/sec", summary.rows_per_second);
    for report in &summary.reports {
        match report.error {
            Some(ref err) => println!("  {} failed after {} rows: {}", report.alias, report.rows, err),
            None => println!("  {}: {} rows ({:?})", report.alias, report.rows, report.state),
        }
    }
    if !summary.failed_aliases.is_empty() {
        println!("  Failed aliases: {:?}", summary.failed_aliases);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries the command's output
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM.
///
/// Running transfers stop at their next progress tick.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();

    let token_int = cancel_token.clone();
    let token_term = cancel_token.clone();

    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Stopping after the current progress tick...");
        token_int.cancel();
    });

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Stopping after the current progress tick...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to setup Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C. Stopping after the current progress tick...");
        token.cancel();
    });

    Ok(cancel_token)
}
