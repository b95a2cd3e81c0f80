use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobscout_core::JobRecord;
use jobscout_dedup::DuplicateDetector;
use jobscout_http::{ApiClient, ApiClientConfig};
use jobscout_sync::{build_pipeline, report_recent_runs, run_sync_once_from_env, SyncConfig};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobscout")]
#[command(about = "Job Scout: scrape job boards, drop duplicates, sync to the job API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and exit.
    Sync {
        #[arg(long)]
        json: bool,
    },
    /// Run syncs on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Classify every job in a JSON array file and print the verdicts.
    Dedup {
        file: PathBuf,
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Check configuration and API reachability.
    Health {
        #[arg(long)]
        json: bool,
    },
    /// Summarize the most recent runs as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let summary = run_sync_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} sources={}/{} found={} unique={} duplicates={} api={} reports={}",
                    summary.run_id,
                    summary.sources_successful(),
                    summary.sources.len(),
                    summary.total_jobs_found,
                    summary.unique_jobs,
                    summary.duplicates_removed,
                    summary.api_sync,
                    summary.reports_dir
                );
            }
        }
        Commands::Schedule => schedule().await?,
        Commands::Dedup { file, threshold } => dedup_file(&file, threshold)?,
        Commands::Health { json } => return health(json).await,
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            println!("{}", report_recent_runs(runs, Some(config.workspace_root))?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn schedule() -> Result<()> {
    let config = SyncConfig::from_env();
    let cron = config.sync_cron.clone();
    let pipeline = Arc::new(build_pipeline(config)?);
    let Some(mut scheduler) = pipeline.maybe_build_scheduler().await? else {
        bail!("scheduler disabled; set JOBSCOUT_SCHEDULER_ENABLED=true");
    };
    scheduler.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down scheduler");
    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

fn dedup_file(path: &Path, threshold: Option<f64>) -> Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let jobs: Vec<JobRecord> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let mut detector = match threshold {
        Some(threshold) => DuplicateDetector::with_threshold(threshold),
        None => DuplicateDetector::new(),
    };
    let verdicts: Vec<_> = jobs
        .iter()
        .enumerate()
        .map(|(index, job)| {
            let verdict = detector.add_job(job);
            json!({
                "index": index,
                "title": job.title,
                "company": job.company,
                "is_duplicate": verdict.is_duplicate(),
                "reason": verdict.reason(),
                "match": verdict.duplicate_match(),
            })
        })
        .collect();

    let report = json!({ "verdicts": verdicts, "stats": detector.get_stats() });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn health(as_json: bool) -> Result<ExitCode> {
    let config = SyncConfig::from_env();
    let api = match &config.api_key {
        Some(key) => {
            let mut api_config = ApiClientConfig::new(&config.api_url, key);
            api_config.user_agent = config.user_agent.clone();
            Some(ApiClient::new(api_config).context("building api client")?)
        }
        None => None,
    };
    let response = match &api {
        Some(api) => Some(api.health_check().await),
        None => None,
    };
    let healthy = response.as_ref().is_some_and(|r| r.success);

    if as_json {
        let report = json!({
            "healthy": healthy,
            "environment": {
                "api_url": config.api_url,
                "api_key_configured": config.api_key.is_some(),
                "workspace_root": config.workspace_root.display().to_string(),
            },
            "api": response,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("api url: {}", config.api_url);
        println!(
            "api key: {}",
            if config.api_key.is_some() { "configured" } else { "missing (set JOBSCOUT_API_KEY)" }
        );
        match &response {
            Some(r) if r.success => println!("api health: ok ({})", r.status_code),
            Some(r) => println!(
                "api health: failed ({}): {}",
                r.status_code,
                r.error.as_deref().unwrap_or("unknown error")
            ),
            None => println!("api health: not checked"),
        }
    }

    Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
