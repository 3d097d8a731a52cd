//! mssql-bulk-sync CLI - incremental SQL Server table sync.

use clap::{Parser, Subcommand};
use mssql_bulk_sync::auth::{ManagedIdentityTokenProvider, TokenCache};
use mssql_bulk_sync::orchestrator::{describe_job, MssqlConnector};
use mssql_bulk_sync::{
    consume, ChannelQueue, Dispatcher, EnqueueOutcome, JobRun, Orchestrator, Schedule, SyncError,
    SyncJobResult, SyncJobsConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-bulk-sync")]
#[command(about = "Incremental SQL Server table sync driven by change tracking")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "sync.yaml")]
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
    /// Load and validate the configuration
    Validate,

    /// List configured areas
    Areas,

    /// List job ids in an area
    Ids {
        area: String,
    },

    /// Show a job's resolved configuration
    Show {
        area: String,
        id: String,
    },

    /// Inspect a job's source and target databases
    Schema {
        area: String,
        id: String,
    },

    /// Run one job now
    Run {
        area: String,
        id: String,

        /// Truncate and fully reload every table
        #[arg(long)]
        seed: bool,
    },

    /// Run every job on a named schedule
    Schedule {
        /// custom, midnight, noon, every_five_minutes or every_hour
        name: Schedule,

        /// Treat this firing as late (runs nothing)
        #[arg(long)]
        past_due: bool,
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

    let config = Arc::new(SyncJobsConfig::load(&cli.config)?);
    info!("Loaded configuration from {:?}", cli.config);

    match &cli.command {
        Commands::Validate => {
            println!("Configuration is valid ({} jobs)", config.jobs.len());
        }

        Commands::Areas => {
            let areas = config.list_areas();
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&areas)?);
            } else {
                for area in areas {
                    println!("{}", area);
                }
            }
        }

        Commands::Ids { area } => {
            let ids = config.list_ids(area);
            if ids.is_empty() {
                return Err(not_found(area, None));
            }
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&ids)?);
            } else {
                for id in ids {
                    println!("{}", id);
                }
            }
        }

        Commands::Show { area, id } => {
            let job = config
                .find_job(area, id)
                .ok_or_else(|| not_found(area, Some(id)))?;
            println!("{}", serde_json::to_string_pretty(&job.describe(id))?);
        }

        Commands::Schema { area, id } => {
            let dispatcher = Dispatcher::new(config.clone(), Arc::new(token_cache(&config)));
            let job = dispatcher
                .resolve(area, id, false)
                .await?
                .ok_or_else(|| not_found(area, Some(id)))?;
            let snapshot = describe_job(&MssqlConnector::new(&config.settings), &job).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        Commands::Run { area, id, seed } => {
            let cancel = setup_signal_handler()?;
            let dispatcher = Dispatcher::new(config.clone(), Arc::new(token_cache(&config)));
            let orchestrator = Orchestrator::new(&config.settings).with_cancellation(cancel);

            let (queue, mut jobs) = ChannelQueue::channel(1);
            if let EnqueueOutcome::NotFound = dispatcher.enqueue(area, id, *seed, &queue).await? {
                return Err(not_found(area, Some(id)));
            }
            drop(queue);

            while let Some(job) = jobs.recv().await {
                if let Some(run) = consume(&orchestrator, &job).await? {
                    finish(run, cli.output_json)?;
                }
            }
        }

        Commands::Schedule { name, past_due } => {
            let cancel = setup_signal_handler()?;
            let dispatcher = Dispatcher::new(config.clone(), Arc::new(token_cache(&config)));
            let orchestrator = Orchestrator::new(&config.settings).with_cancellation(cancel.clone());

            let (queue, mut jobs) = ChannelQueue::channel(config.jobs.len());
            let queued = dispatcher.dispatch_schedule(*name, *past_due, &queue).await?;
            drop(queue);
            info!("Schedule {} queued {} job(s)", name, queued);

            let mut first_error = None;
            while let Some(job) = jobs.recv().await {
                if cancel.is_cancelled() {
                    first_error.get_or_insert(SyncError::Cancelled);
                    break;
                }
                let outcome = match consume(&orchestrator, &job).await {
                    Ok(Some(run)) => finish(run, cli.output_json),
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    error!("Job {} failed: {}", job.id, e);
                    first_error.get_or_insert(e);
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }
    }

    Ok(())
}

fn not_found(area: &str, id: Option<&str>) -> SyncError {
    match id {
        Some(id) => SyncError::Config(format!("job '{}' not found in area '{}'", id, area)),
        None => SyncError::Config(format!("area '{}' not found", area)),
    }
}

fn token_cache(config: &SyncJobsConfig) -> TokenCache<ManagedIdentityTokenProvider> {
    TokenCache::from_settings(ManagedIdentityTokenProvider::from_env(), &config.settings)
}

/// Print a finished run, then fail if any table failed.
fn finish(run: JobRun, output_json: bool) -> Result<(), SyncError> {
    if output_json {
        println!("{}", serde_json::to_string_pretty(&run.result)?);
    } else {
        print_summary(&run.result);
    }
    run.into_result().map(|_| ())
}

fn print_summary(result: &SyncJobResult) {
    let elapsed = result.finished_at - result.started_at;
    println!(
        "\nJob {} ({}{}) finished in {:.2}s",
        result.job_id,
        result.schedule,
        if result.seed { ", seed" } else { "" },
        elapsed.num_milliseconds() as f64 / 1000.0
    );
    for table in &result.tables {
        println!(
            "  {:<40} {:<9} copied: {}, merged: {}, deleted: {}{}",
            table.target,
            table.status.to_string(),
            table.rows_copied,
            table.rows_merged,
            table.rows_deleted,
            table
                .error
                .as_deref()
                .map(|e| format!("\n    Error: {}", e))
                .unwrap_or_default()
        );
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Cancel between tables on SIGINT (Ctrl-C) or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT. Stopping after the current table..."),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM. Stopping after the current table..."),
        }
        token.cancel();
    });

    Ok(cancel_token)
}

/// Windows only gets Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current table...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
