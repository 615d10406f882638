mod airtable;
mod engine;
mod jira;
mod scheduler;
mod source;
mod store;
#[cfg(test)]
mod testing;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mirror_common::error::{MirrorError, MirrorResult};
use mirror_config::{init_tracing, AppConfig};
use tokio_util::sync::CancellationToken;

use crate::engine::{RunStatus, RunSummary, SyncOrchestrator};
use crate::jira::client::{JiraClient, JiraClientConfig};
use crate::scheduler::Scheduler;

/// Mirror Jira issues into an Airtable or Postgres table.
#[derive(Debug, Parser)]
#[command(name = "issuemirror", version, about)]
struct Args {
    /// Keep running and sync on a fixed interval instead of once.
    #[arg(long, env = "SYNC_SCHEDULE")]
    schedule: bool,

    /// Override the configured sync interval, in minutes.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    interval_minutes: Option<u64>,

    /// Print every run summary to stdout as one JSON line.
    #[arg(long)]
    summary_json: bool,

    /// Validate configuration and the field mapping against the destination, then exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing("info");
    tracing::info!(service = "issuemirror", "starting");

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(args, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "issuemirror failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, config: AppConfig) -> MirrorResult<ExitCode> {
    let jira = JiraClient::new(JiraClientConfig::from_source(
        &config.source,
        config.sync.http_timeout,
    ))
    .map_err(|e| MirrorError::ConfigurationInvalid(format!("jira client: {e}")))?;
    let store = store::connect_destination(&config).await?;

    let mut settings = config.sync.clone();
    if let Some(minutes) = args.interval_minutes {
        settings.interval = Duration::from_secs(minutes * 60);
    }
    let interval = settings.interval;

    tracing::info!(
        destination = config.destination.kind(),
        table = config.destination.table(),
        batch_size = settings.batch_size,
        "sync configured"
    );

    let orchestrator = Arc::new(SyncOrchestrator::new(
        Arc::new(jira),
        store,
        config.mapping.clone(),
        settings,
        config.source.base_query(),
        config.destination.table(),
    ));

    if args.check {
        let (catalog, mapping) = orchestrator.preflight().await?;
        tracing::info!(
            columns = catalog.names().len(),
            mapped = mapping.entries().count(),
            "configuration is valid"
        );
        return Ok(ExitCode::SUCCESS);
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested, finishing current batch");
                shutdown.cancel();
            }
        }
    });

    let json = args.summary_json;
    if args.schedule {
        Scheduler::new(orchestrator, interval)
            .run(shutdown, |summary| emit(&summary, json))
            .await;
        tracing::info!("shutting down");
        return Ok(ExitCode::SUCCESS);
    }

    let summary = orchestrator.run_cycle(&shutdown).await;
    emit(&summary, json);
    Ok(exit_code(&summary))
}

fn emit(summary: &RunSummary, json: bool) {
    if !json {
        return;
    }
    match serde_json::to_string(summary) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize run summary"),
    }
}

/// 0 on success, 2 when some records failed, 1 when the cycle did not complete.
fn exit_code(summary: &RunSummary) -> ExitCode {
    match summary.status {
        RunStatus::Succeeded | RunStatus::Skipped => ExitCode::SUCCESS,
        RunStatus::CompletedWithFailures => ExitCode::from(2),
        RunStatus::Failed | RunStatus::Cancelled => ExitCode::FAILURE,
    }
}
