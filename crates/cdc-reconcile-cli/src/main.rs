//! cdc-reconcile CLI - consistency checks for CDC-replicated databases.

use cdc_reconcile::observe::{
    ConfigCredentials, DirectoryRepairSink, JsonFileReport, RepairSink, ReportSink,
};
use cdc_reconcile::{
    jobs_from_config, open_store, CheckpointStore, Config, IncrementalTracker, ReconcileError,
    ReconcileMode, RunReport, Scheduler,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code when at least one table did not match.
const EXIT_MISMATCH: u8 = 1;
/// Exit code when a backend is unreachable.
const EXIT_UNHEALTHY: u8 = 4;
/// Exit code when the run was interrupted.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "cdc-reconcile")]
#[command(about = "Verify that a CDC-replicated target matches its source")]
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

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Full,
    Incremental,
}

impl From<ModeArg> for ReconcileMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => ReconcileMode::Full,
            ModeArg::Incremental => ReconcileMode::Incremental,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the configured tables
    Run {
        /// Override the configured mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Ignore stored checkpoints and rebuild them (incremental mode)
        #[arg(long)]
        resync: bool,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Only reconcile these tables (schema.table, repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Write one repair SQL file per mismatched table into this directory
        #[arg(long)]
        repair_dir: Option<PathBuf>,

        /// Write the JSON run report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Test database connections
    HealthCheck,

    /// Inspect or reset incremental checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List stored checkpoints
    List,

    /// Delete checkpoints so the next incremental run starts over
    Reset {
        /// Tables to reset (schema.table, repeatable)
        #[arg(long = "table", required_unless_present = "all")]
        tables: Vec<String>,

        /// Reset every stored checkpoint
        #[arg(long)]
        all: bool,
    },
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

async fn run() -> Result<ExitCode, ReconcileError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            mode,
            resync,
            workers,
            tables,
            repair_dir,
            report: report_file,
        } => {
            let mut config = config;
            if let Some(mode) = mode {
                config.reconcile.mode = mode.into();
            }
            if let Some(w) = workers {
                config.reconcile.workers = Some(w);
            }
            config.validate()?;
            let config = config.with_auto_tuning();

            let cancel_token = setup_signal_handler();
            let report = run_reconcile(&config, resync, &tables, cancel_token).await?;

            if let Some(dir) = repair_dir {
                write_repairs(&report, DirectoryRepairSink::new(dir)?)?;
            }
            if let Some(path) = report_file {
                JsonFileReport::new(path).publish(&report)?;
            }
            print_report(&report, cli.output_json)?;

            Ok(if report.cancelled {
                ExitCode::from(EXIT_CANCELLED)
            } else if report.all_matched() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_MISMATCH)
            })
        }

        Commands::HealthCheck => {
            let scheduler = Scheduler::from_config(&config, &ConfigCredentials, None).await?;
            let health = scheduler.health_check().await;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                for endpoint in [&health.source, &health.target] {
                    match &endpoint.error {
                        None => println!(
                            "{}: OK ({} ms, pool {}/{})",
                            endpoint.backend,
                            endpoint.latency_ms,
                            endpoint.stats.size,
                            endpoint.stats.max_size
                        ),
                        Some(error) => println!("{}: FAILED - {}", endpoint.backend, error),
                    }
                }
            }
            Ok(if health.healthy() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_UNHEALTHY)
            })
        }

        Commands::Checkpoints { action } => {
            let store = open_store(&config, &ConfigCredentials).await?;
            match action {
                CheckpointAction::List => {
                    let checkpoints = store.list().await?;
                    if cli.output_json {
                        println!("{}", serde_json::to_string_pretty(&checkpoints)?);
                    } else if checkpoints.is_empty() {
                        println!("No checkpoints stored ({} store)", store.store_type());
                    } else {
                        for cp in &checkpoints {
                            let watermark = cp
                                .watermark
                                .as_ref()
                                .map(|w| w.to_string())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "{}  watermark={}  checksum={}  updated={}",
                                cp.table,
                                watermark,
                                cp.checksum,
                                cp.updated_at.to_rfc3339()
                            );
                        }
                    }
                }
                CheckpointAction::Reset { tables, all } => {
                    let tracker = IncrementalTracker::new(store.clone());
                    let targets = if all {
                        store.list().await?.into_iter().map(|cp| cp.table).collect()
                    } else {
                        tables
                    };
                    let mut removed = 0;
                    for table in &targets {
                        if tracker.reset(table).await? {
                            removed += 1;
                        } else {
                            println!("{}: no checkpoint", table);
                        }
                    }
                    println!("Reset {} checkpoint(s)", removed);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_reconcile(
    config: &Config,
    resync: bool,
    only: &[String],
    cancel_token: CancellationToken,
) -> Result<RunReport, ReconcileError> {
    let mut jobs = jobs_from_config(config, resync);
    if !only.is_empty() {
        let wanted: Vec<String> = only.iter().map(|t| t.to_lowercase()).collect();
        jobs.retain(|job| {
            let name = job.spec.source_ref(&config.source.schema).to_string().to_lowercase();
            wanted.contains(&name)
        });
        if jobs.is_empty() {
            return Err(ReconcileError::Config(format!(
                "none of the requested tables are configured: {}",
                only.join(", ")
            )));
        }
    }

    // checkpoints are only read in incremental mode
    let tracker = if jobs.iter().any(|job| job.mode == ReconcileMode::Incremental) {
        let store = open_store(config, &ConfigCredentials).await?;
        Some(Arc::new(IncrementalTracker::new(store)))
    } else {
        None
    };

    let scheduler = Scheduler::from_config(config, &ConfigCredentials, tracker)
        .await?
        .with_cancellation(cancel_token);
    let report = scheduler
        .run(jobs, config.reconcile.get_workers())
        .await
        .with_config_hash(config.hash());
    Ok(report)
}

fn write_repairs(report: &RunReport, sink: DirectoryRepairSink) -> Result<(), ReconcileError> {
    let scripts = report
        .entries
        .iter()
        .filter_map(|entry| entry.outcome.as_ref())
        .filter_map(|outcome| outcome.repair.as_ref());
    for script in scripts {
        sink.accept(script)?;
    }
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> Result<(), ReconcileError> {
    if json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    let status_msg = if report.cancelled {
        "Reconciliation cancelled"
    } else {
        "Reconciliation completed!"
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", report.run_id);
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!(
        "  Tables: {} matched, {} mismatched, {} failed, {} cancelled (of {})",
        report.totals.matched,
        report.totals.mismatched,
        report.totals.failed,
        report.totals.cancelled,
        report.totals.tables
    );
    println!("  Discrepancies: {}", report.totals.discrepancies);
    for entry in &report.entries {
        if let Some(outcome) = &entry.outcome {
            if !outcome.matched() {
                let c = &outcome.comparison;
                println!(
                    "  MISMATCH {}: source={} target={}{}",
                    entry.table,
                    c.source_count,
                    c.target_count,
                    if outcome.truncated { " (discrepancy list truncated)" } else { "" }
                );
            }
        }
    }
    for entry in report.failures() {
        if let Some(error) = &entry.error {
            println!("  FAILED {}: {} - {}", entry.table, error.operation, error.message);
        }
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

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
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// In-flight tables finish; tables not yet started are reported as cancelled.
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
                    stream.recv().await;
                    eprintln!("\nReceived {}. Finishing in-flight tables...", name);
                    token.cancel();
                });
            }
            Err(e) => eprintln!("Could not install {} handler: {}", name, e),
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
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing in-flight tables...");
            token.cancel();
        }
    });

    cancel_token
}
