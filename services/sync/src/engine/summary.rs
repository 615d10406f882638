use chrono::{DateTime, Utc};
use mirror_common::error::MirrorError;
use mirror_common::time::Timestamp;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    FetchingWatermark,
    FetchingChanges,
    Processing,
    Upserting,
    Summarizing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// The cycle finished but some records were not written.
    CompletedWithFailures,
    Failed,
    Cancelled,
    /// Another cycle for the same table was still running.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub key: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferredLink {
    pub key: String,
    pub parent: String,
}

/// What one cycle did. Every invocation yields one, including skipped and failed ones.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub table: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub since: Option<Timestamp>,
    pub next_watermark: Option<Timestamp>,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: Vec<FailureDetail>,
    /// Children whose parent link is still missing at the end of the cycle.
    pub deferred_parent_links: Vec<DeferredLink>,
    pub states: Vec<CycleState>,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn start(table: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            table: table.to_owned(),
            status: RunStatus::Succeeded,
            started_at: now,
            finished_at: now,
            elapsed_ms: 0,
            since: None,
            next_watermark: None,
            fetched: 0,
            created: 0,
            updated: 0,
            failed: Vec::new(),
            deferred_parent_links: Vec::new(),
            states: vec![CycleState::Idle],
            error: None,
        }
    }

    pub fn skipped(table: &str) -> Self {
        let mut summary = Self::start(table);
        summary.status = RunStatus::Skipped;
        summary
    }

    pub fn transition(&mut self, state: CycleState) {
        if self.states.last() != Some(&state) {
            tracing::debug!(run_id = %self.run_id, state = ?state, "cycle state");
            self.states.push(state);
        }
    }

    pub fn record_failure(&mut self, key: &str, err: &MirrorError) {
        tracing::warn!(run_id = %self.run_id, key, kind = err.kind(), error = %err, "record failed");
        self.failed.push(FailureDetail {
            key: key.to_owned(),
            kind: err.kind().to_owned(),
            message: err.to_string(),
        });
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.updated
    }

    /// Close the summary with the cycle's outcome.
    pub fn finish(&mut self, outcome: Result<(), MirrorError>) {
        self.status = match &outcome {
            Ok(()) if self.failed.is_empty() => RunStatus::Succeeded,
            Ok(()) => RunStatus::CompletedWithFailures,
            Err(MirrorError::Cancelled) => RunStatus::Cancelled,
            Err(_) => RunStatus::Failed,
        };
        match outcome {
            Ok(()) => self.transition(CycleState::Summarizing),
            Err(e) => {
                self.transition(CycleState::Failed);
                self.error = Some(e.to_string());
            }
        }
        self.transition(CycleState::Idle);

        self.finished_at = Utc::now();
        self.elapsed_ms = (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
    }

    pub fn log(&self) {
        match self.status {
            RunStatus::Failed | RunStatus::Cancelled => tracing::error!(
                run_id = %self.run_id,
                table = %self.table,
                status = ?self.status,
                fetched = self.fetched,
                created = self.created,
                updated = self.updated,
                failed = self.failed.len(),
                error = self.error.as_deref().unwrap_or_default(),
                "sync cycle did not complete"
            ),
            _ => tracing::info!(
                run_id = %self.run_id,
                table = %self.table,
                status = ?self.status,
                fetched = self.fetched,
                succeeded = self.succeeded(),
                created = self.created,
                updated = self.updated,
                failed = self.failed.len(),
                deferred_links = self.deferred_parent_links.len(),
                elapsed_ms = self.elapsed_ms,
                "sync cycle finished"
            ),
        }
    }
}
