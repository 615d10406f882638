use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::{RunSummary, SyncOrchestrator};

/// Runs a cycle on every tick until shut down.
///
/// Each cycle runs in its own task so a slow cycle does not delay the clock; a tick
/// that lands while a cycle is still running yields a skipped summary.
pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    every: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, every: Duration) -> Self {
        Self {
            orchestrator,
            every,
        }
    }

    /// Tick until `shutdown` fires, then wait for the running cycle to stop.
    ///
    /// `report` sees every summary in completion order.
    pub async fn run<F>(&self, shutdown: CancellationToken, mut report: F)
    where
        F: FnMut(RunSummary),
    {
        tracing::info!(interval_secs = self.every.as_secs(), "scheduler started");

        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let token = shutdown.child_token();
                    cycles.spawn(async move { orchestrator.run_cycle(&token).await });
                }
                Some(done) = cycles.join_next() => match done {
                    Ok(summary) => report(summary),
                    Err(e) => tracing::error!(error = %e, "sync cycle task panicked"),
                },
            }
        }

        tracing::info!(running = cycles.len(), "scheduler stopping");
        while let Some(done) = cycles.join_next().await {
            match done {
                Ok(summary) => report(summary),
                Err(e) => tracing::error!(error = %e, "sync cycle task panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunStatus;
    use crate::testing::{issue, FakeSource, MemoryDestination};
    use chrono::{TimeZone, Utc};
    use mirror_config::{FieldMapping, SyncSettings};
    use mirror_db::destination::models::{ColumnInfo, ColumnKind};

    fn orchestrator(source: Arc<FakeSource>) -> Arc<SyncOrchestrator> {
        let mapping = FieldMapping::from_json(
            r#"{"key": "fldKey", "summary": "fldSummary", "description": "fldDesc",
                "status": "fldStatus", "created": "fldCreated", "updated": "fldUpdated"}"#,
        )
        .unwrap();
        let columns = ["fldKey", "fldSummary", "fldDesc", "fldStatus", "fldCreated", "fldUpdated"]
            .into_iter()
            .map(|id| ColumnInfo::new(id, id, ColumnKind::Text))
            .collect();
        let store = Arc::new(MemoryDestination::new().with_columns(columns));
        Arc::new(SyncOrchestrator::new(
            source,
            store,
            mapping,
            SyncSettings::default(),
            "",
            "Issues",
        ))
    }

    fn one_issue() -> Arc<FakeSource> {
        Arc::new(FakeSource::new(vec![issue(
            "PROJ-1",
            Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap(),
        )]))
    }

    #[tokio::test(start_paused = true)]
    async fn runs_a_cycle_per_tick_until_shutdown() {
        let source = one_issue();
        let scheduler = Scheduler::new(orchestrator(source.clone()), Duration::from_secs(60));
        let shutdown = CancellationToken::new();

        let stopper = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(150)).await;
                shutdown.cancel();
            })
        };

        let mut summaries = Vec::new();
        scheduler.run(shutdown, |s| summaries.push(s)).await;
        stopper.await.unwrap();

        // Ticks at 0s, 60s and 120s.
        assert_eq!(summaries.len(), 3);
        assert!(summaries.iter().all(|s| s.status == RunStatus::Succeeded));
        assert_eq!(summaries[0].created, 1);
        assert_eq!(summaries[2].fetched, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cycle_skips_overlapping_tick_and_is_cancelled_on_shutdown() {
        let source = one_issue();
        source.set_delay(Duration::from_secs(90));
        let scheduler = Scheduler::new(orchestrator(source.clone()), Duration::from_secs(60));
        let shutdown = CancellationToken::new();

        let stopper = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(150)).await;
                shutdown.cancel();
            })
        };

        let mut summaries = Vec::new();
        scheduler.run(shutdown, |s| summaries.push(s)).await;
        stopper.await.unwrap();

        let statuses: Vec<RunStatus> = summaries.iter().map(|s| s.status).collect();
        // 0s: runs until 90s. 60s: skipped. 120s: still fetching at shutdown.
        assert_eq!(
            statuses,
            [RunStatus::Skipped, RunStatus::Succeeded, RunStatus::Cancelled]
        );
        assert_eq!(source.search_calls(), 2);
    }
}
