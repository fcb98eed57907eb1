//! mysql-pg-migrate CLI - chunked MySQL to PostgreSQL migration.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use mysql_pg_migrate::{create_run_dir, Config, MigrateError, MigrationReport, Orchestrator, RunOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Name of the run log inside a run directory.
const RUN_LOG: &str = "run.log";

#[derive(Parser)]
#[command(name = "mysql-pg-migrate")]
#[command(about = "Chunked bulk migration from MySQL to PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

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
    /// Mirror schemas and copy every table
    Run {
        /// Only recreate destination tables, copy no data
        #[arg(long)]
        schema_only: bool,

        /// Copy the queries listed under migration.tables instead of discovering tables
        #[arg(long)]
        from_config_tables: bool,

        /// Override migration.max_concurrent_chunks
        #[arg(long)]
        max_concurrent_chunks: Option<usize>,

        /// Exit with status 1 when any chunk or table failed
        #[arg(long)]
        strict: bool,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Run {
            schema_only,
            from_config_tables,
            max_concurrent_chunks,
            strict,
        } => {
            let run_dir = create_run_dir(&config.migration.log_dir)?;
            setup_logging(&cli.verbosity, &cli.log_format, Some(run_dir.as_path()))?;
            info!("Loaded configuration from {:?}", cli.config);
            info!("Source: {}", config.source.display_url());

            let cancel_token = setup_signal_handler();
            let orchestrator = Orchestrator::connect(config, run_dir).await?;

            let opts = RunOptions {
                schema_only,
                from_config_tables,
                max_concurrent_chunks,
            };
            let result = orchestrator.run(opts, cancel_token).await;
            // A cancelled run may still have connections checked out by
            // abandoned reads, and a graceful pool close would wait for them.
            if !matches!(result, Err(MigrateError::Cancelled)) {
                orchestrator.close().await;
            }
            let report = result?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                print_report(&report);
            }

            if strict && !report.is_clean() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::HealthCheck => {
            setup_logging(&cli.verbosity, &cli.log_format, None)?;
            let log_dir = config.migration.log_dir.clone();
            let orchestrator = Orchestrator::connect(config, log_dir).await?;
            let result = orchestrator.health_check().await;
            orchestrator.close().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MySQL): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &MigrationReport) {
    let status_msg = if report.schema_only {
        "Schema mirroring completed!"
    } else {
        "Migration completed!"
    };
    println!("\n{}", status_msg);
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!("  Tables: {}", report.tables_total);
    if !report.schema_only {
        println!(
            "  Chunks: {}/{} succeeded",
            report.chunks_succeeded, report.chunks_total
        );
        println!("  Rows: {}", report.rows_copied);
    }
    for chunk in &report.failed_chunks {
        println!("  Failed chunk: {}[{}]: {}", chunk.table, chunk.index, chunk.error);
    }
    for table in &report.skipped_tables {
        println!("  Skipped table: {}: {}", table.table, table.reason);
    }
    println!("  Logs: {}", report.run_dir.display());
}

/// Console logs go to stderr so `--output-json` keeps stdout clean. When a
/// run directory is given, a plain-text copy is written to `run.log`.
fn setup_logging(verbosity: &str, format: &str, run_dir: Option<&Path>) -> Result<(), MigrateError> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let file_layer = match run_dir {
        Some(dir) => {
            let file = File::create(dir.join(RUN_LOG))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if format == "json" {
        registry
            .with(fmt::layer().json().with_target(false).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Exit status for a run stopped by a signal.
const EXIT_CANCELLED: i32 = 130;

/// Setup signal handlers for shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
/// A second signal of either kind exits immediately.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    loop {
                        stream.recv().await;
                        if token.is_cancelled() {
                            eprintln!("\nReceived {} again. Exiting now.", name);
                            std::process::exit(EXIT_CANCELLED);
                        }
                        eprintln!("\nReceived {}. Shutting down (repeat to force)...", name);
                        token.cancel();
                    }
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if token.is_cancelled() {
                eprintln!("\nReceived Ctrl-C again. Exiting now.");
                std::process::exit(EXIT_CANCELLED);
            }
            eprintln!("\nReceived Ctrl-C. Shutting down (repeat to force)...");
            token.cancel();
        }
    });

    cancel_token
}
