use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use mirror_common::error::{MirrorError, MirrorResult};
use mirror_common::retry::{retry_with_backoff, RetryError};
use mirror_common::time::Timestamp;
use mirror_config::{FieldMapping, SourceField, SyncSettings};
use mirror_db::destination::models::{ColumnRef, DestinationRecord, FieldValue, ResumeMarker};
use mirror_db::destination::repositories::DestinationStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::catalog::ColumnCatalog;
use super::fetcher::ChangeSetFetcher;
use super::mapper::{map_record, MapContext, ParentLink};
use super::reconciler::Reconciler;
use super::summary::{CycleState, DeferredLink, RunSummary};
use super::upsert::{RecordIndex, UpsertEngine, UpsertReport};
use super::watermark::WatermarkTracker;
use crate::source::{IssueSource, SourceRecord};

/// State carried from one cycle to the next within this process.
///
/// The destination keeps the durable copy of the resume point; this one covers
/// cycles whose destination was unreachable when the point had to be saved.
#[derive(Debug, Default)]
struct CycleMemory {
    resume: Option<ResumeMarker>,
}

/// Compute the lower bound for a change query.
fn start_point(
    watermark: Option<Timestamp>,
    resume: Option<ResumeMarker>,
    lookback: Option<chrono::Duration>,
    now: Timestamp,
) -> Option<Timestamp> {
    let fresh = || lookback.map(|window| now - window);
    match (watermark, resume) {
        (_, Some(ResumeMarker::Beginning)) => fresh(),
        (Some(w), Some(ResumeMarker::After(floor))) => Some(w.min(floor)),
        (None, Some(ResumeMarker::After(floor))) => Some(floor),
        (Some(w), None) => Some(w),
        (None, None) => fresh(),
    }
}

/// Per-record errors that a later cycle may succeed on without the record changing.
fn holds_resume_floor(err: &MirrorError) -> bool {
    !matches!(
        err,
        MirrorError::RequiredFieldMissing { .. } | MirrorError::Rejected(_)
    )
}

fn column_ref(mapping: &FieldMapping, field: &SourceField) -> Option<ColumnRef> {
    mapping
        .column(field)
        .map(|target| ColumnRef::new(&target.id, target.label()))
}

fn earliest(a: Option<ResumeMarker>, b: Option<ResumeMarker>) -> Option<ResumeMarker> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.earliest(b)),
        (a, b) => a.or(b),
    }
}

fn destination_unavailable(err: RetryError<MirrorError>) -> MirrorError {
    match err.into_error() {
        unavailable @ MirrorError::DestinationUnavailable(_) => unavailable,
        other => MirrorError::DestinationUnavailable(other.to_string()),
    }
}

fn check_cancelled(cancel: &CancellationToken) -> MirrorResult<()> {
    if cancel.is_cancelled() {
        return Err(MirrorError::Cancelled);
    }
    Ok(())
}

/// Sequences one sync cycle against a single destination table.
pub struct SyncOrchestrator {
    source: Arc<dyn IssueSource>,
    store: Arc<dyn DestinationStore>,
    mapping: FieldMapping,
    settings: SyncSettings,
    base_filter: String,
    table: String,
    memory: Mutex<CycleMemory>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn IssueSource>,
        store: Arc<dyn DestinationStore>,
        mapping: FieldMapping,
        settings: SyncSettings,
        base_filter: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            mapping,
            settings,
            base_filter: base_filter.into(),
            table: table.into(),
            memory: Mutex::new(CycleMemory::default()),
        }
    }

    /// Run one cycle. Overlapping calls return a `Skipped` summary without doing anything.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> RunSummary {
        let Ok(mut memory) = self.memory.try_lock() else {
            tracing::warn!(table = %self.table, "previous cycle still running, skipping");
            let summary = RunSummary::skipped(&self.table);
            summary.log();
            return summary;
        };

        let mut summary = RunSummary::start(&self.table);
        tracing::info!(run_id = %summary.run_id, table = %self.table, "sync cycle started");

        let mut cycle = Cycle::default();
        let outcome = self
            .execute(&mut summary, &mut cycle, memory.resume, cancel)
            .await;

        memory.resume = match &outcome {
            Err(_) => cycle.fetch_from.or(memory.resume),
            Ok(()) => cycle
                .earliest_retryable_failure
                .map(|t| ResumeMarker::After(t - chrono::Duration::milliseconds(1))),
        };
        if let Some(point) = memory.resume {
            tracing::info!(resume = ?point, "next cycle will re-fetch from resume point");
        }
        if cycle.stored_resume.is_some_and(|stored| stored != memory.resume) {
            self.save_resume(memory.resume).await;
        }

        summary.next_watermark = cycle.watermark.max(cycle.max_committed);
        summary.finish(outcome);
        summary.log();
        summary
    }

    async fn execute(
        &self,
        summary: &mut RunSummary,
        cycle: &mut Cycle,
        remembered: Option<ResumeMarker>,
        cancel: &CancellationToken,
    ) -> MirrorResult<()> {
        check_cancelled(cancel)?;
        summary.transition(CycleState::FetchingWatermark);

        let (catalog, mapping) = self.preflight().await?;
        let key_column = column_ref(&mapping, &SourceField::Key).ok_or_else(|| {
            MirrorError::ConfigurationInvalid("issue key is not mapped".to_owned())
        })?;

        let tracker = WatermarkTracker::new(
            self.store.clone(),
            column_ref(&mapping, &SourceField::Updated),
            self.settings.retry.clone(),
        );
        cycle.watermark = tracker.get_watermark().await?;

        let stored = self.load_resume().await?;
        cycle.stored_resume = Some(stored);
        let resume = earliest(remembered, stored);

        let since = start_point(cycle.watermark, resume, self.settings.lookback, Utc::now());
        cycle.fetch_from = Some(since.map_or(ResumeMarker::Beginning, ResumeMarker::After));
        summary.since = since;
        tracing::info!(watermark = ?cycle.watermark, since = ?since, "fetching changes");

        summary.transition(CycleState::FetchingChanges);
        let fetcher = ChangeSetFetcher::new(
            self.source.clone(),
            self.settings.retry.clone(),
            self.settings.page_size,
        )
        .with_max_results(self.settings.max_results)
        .with_comments(mapping.needs_comments());

        let mut pass = Pass {
            engine: UpsertEngine::new(
                self.store.clone(),
                self.settings.retry.clone(),
                key_column,
                self.settings.batch_size,
            ),
            reconciler: Reconciler::new(self.store.clone(), self.settings.retry.clone(), &catalog),
            mapping,
            catalog,
            summary,
            cycle,
        };

        let mut changes = fetcher.fetch_changes(since, &self.base_filter);
        let mut pending: Vec<SourceRecord> = Vec::new();

        while let Some(item) = changes.next().await {
            let record = item?;
            pass.summary.fetched += 1;

            // Parents must be committed before a child can link to them.
            let parent_pending = record
                .parent_key
                .as_ref()
                .is_some_and(|parent| pending.iter().any(|r| &r.key == parent));
            if parent_pending {
                pass.flush(std::mem::take(&mut pending)).await?;
                check_cancelled(cancel)?;
                pass.summary.transition(CycleState::FetchingChanges);
            }

            pending.push(record);
            if pending.len() >= self.settings.batch_size {
                pass.flush(std::mem::take(&mut pending)).await?;
                check_cancelled(cancel)?;
                pass.summary.transition(CycleState::FetchingChanges);
            }
        }

        pass.flush(pending).await?;
        check_cancelled(cancel)?;

        if let Some(limit) = self.settings.max_results {
            if pass.summary.fetched >= limit {
                tracing::warn!(limit, "max results reached, remaining changes wait for a later cycle");
            }
        }

        pass.resolve_deferred().await
    }

    /// Read the destination columns and check the mapping against them.
    ///
    /// Fails with `ConfigurationInvalid` listing every bad mapping and the available columns.
    pub async fn preflight(&self) -> MirrorResult<(ColumnCatalog, FieldMapping)> {
        let catalog = self.load_catalog().await?;
        let mapping = self.mapping.resolve_against(&catalog.names())?;
        Ok((catalog, mapping))
    }

    async fn load_catalog(&self) -> MirrorResult<ColumnCatalog> {
        let columns = retry_with_backoff(&self.settings.retry, "destination.list_columns", || {
            self.store.list_columns()
        })
        .await
        .map_err(destination_unavailable)?;
        Ok(ColumnCatalog::new(columns))
    }

    async fn load_resume(&self) -> MirrorResult<Option<ResumeMarker>> {
        retry_with_backoff(&self.settings.retry, "destination.load_resume_marker", || {
            self.store.load_resume_marker()
        })
        .await
        .map_err(destination_unavailable)
    }

    /// Persist the resume point. On failure it survives only in this process.
    async fn save_resume(&self, marker: Option<ResumeMarker>) {
        let saved = retry_with_backoff(&self.settings.retry, "destination.store_resume_marker", || {
            self.store.store_resume_marker(marker)
        })
        .await;
        match saved {
            Ok(()) => tracing::debug!(resume = ?marker, "resume point saved"),
            Err(e) => tracing::warn!(
                resume = ?marker,
                error = %e.into_error(),
                "could not save resume point, keeping it in memory"
            ),
        }
    }
}

/// Per-cycle bookkeeping that outlives a failed pass.
#[derive(Debug, Default)]
struct Cycle {
    watermark: Option<Timestamp>,
    fetch_from: Option<ResumeMarker>,
    /// The destination's resume marker as read at the start, once read.
    stored_resume: Option<Option<ResumeMarker>>,
    max_committed: Option<Timestamp>,
    earliest_retryable_failure: Option<Timestamp>,
    /// Source key → destination record id, for rows written this cycle.
    committed: HashMap<String, String>,
    deferred: Vec<DeferredWrite>,
}

#[derive(Debug)]
struct DeferredWrite {
    record: DestinationRecord,
    parent: String,
    updated: Option<Timestamp>,
}

/// One pass over a change set with the catalog and mapping it was validated against.
struct Pass<'a> {
    engine: UpsertEngine,
    reconciler: Reconciler,
    mapping: FieldMapping,
    catalog: ColumnCatalog,
    summary: &'a mut RunSummary,
    cycle: &'a mut Cycle,
}

impl Pass<'_> {
    async fn flush(&mut self, records: Vec<SourceRecord>) -> MirrorResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.summary.transition(CycleState::Processing);

        let updated: HashMap<String, Option<Timestamp>> = records
            .iter()
            .map(|r| (r.key.clone(), r.updated()))
            .collect();

        let mut keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
        for parent in records.iter().filter_map(|r| r.parent_key.as_ref()) {
            if !self.cycle.committed.contains_key(parent) && !keys.contains(parent) {
                keys.push(parent.clone());
            }
        }

        let index = match self.engine.resolve_existing(&keys).await {
            Ok(index) => index,
            Err(e) if e.is_cycle_fatal() => return Err(e),
            Err(e) => {
                for record in &records {
                    self.fail(&record.key, record.updated(), &e);
                }
                return Ok(());
            }
        };

        let mut ready = Vec::with_capacity(records.len());
        for record in &records {
            if let Some(reason) = &record.comments_error {
                let err = MirrorError::Transient(format!("comments unavailable: {reason}"));
                self.fail(&record.key, record.updated(), &err);
                continue;
            }

            let ctx = MapContext {
                previous: index.get(&record.key),
                parent: self.parent_link(record, &index),
                catalog: &self.catalog,
            };
            let mapped = match map_record(record, &self.mapping, &ctx) {
                Ok(mapped) => mapped,
                Err(e) => {
                    self.fail(&record.key, record.updated(), &e);
                    continue;
                }
            };

            if let Err(e) = self.reconciler.reconcile_record(&mapped.record).await {
                if e.is_cycle_fatal() {
                    return Err(e);
                }
                self.fail(&record.key, record.updated(), &e);
                continue;
            }

            if let Some(parent) = mapped.deferred_parent {
                self.cycle.deferred.push(DeferredWrite {
                    record: mapped.record.clone(),
                    parent,
                    updated: record.updated(),
                });
            }
            ready.push(mapped.record);
        }

        if ready.is_empty() {
            return Ok(());
        }

        self.summary.transition(CycleState::Upserting);
        let writes = self.engine.plan(ready, &index);
        let report = self.engine.commit(writes).await?;
        self.apply(report, &updated);
        Ok(())
    }

    fn parent_link(&self, record: &SourceRecord, index: &RecordIndex) -> ParentLink {
        let Some(parent) = record.parent_key.as_ref() else {
            return ParentLink::NotApplicable;
        };
        self.cycle
            .committed
            .get(parent)
            .cloned()
            .or_else(|| index.get(parent).map(|row| row.record_id.clone()))
            .map_or(ParentLink::Unresolved, ParentLink::Resolved)
    }

    fn apply(&mut self, report: UpsertReport, updated: &HashMap<String, Option<Timestamp>>) {
        self.summary.created += report.created();
        self.summary.updated += report.updated();

        for committed in report.committed {
            if let Some(Some(ts)) = updated.get(&committed.key) {
                self.cycle.max_committed = self.cycle.max_committed.max(Some(*ts));
            }
            self.cycle.committed.insert(committed.key, committed.record_id);
        }
        for (key, err) in report.failed {
            let ts = updated.get(&key).copied().flatten();
            self.fail(&key, ts, &err);
        }
    }

    fn fail(&mut self, key: &str, updated: Option<Timestamp>, err: &MirrorError) {
        self.summary.record_failure(key, err);
        if holds_resume_floor(err) {
            if let Some(ts) = updated {
                let earliest = &mut self.cycle.earliest_retryable_failure;
                *earliest = Some(earliest.map_or(ts, |e| e.min(ts)));
            }
        }
    }

    /// Rewrite children whose parent was committed later in the same cycle.
    async fn resolve_deferred(&mut self) -> MirrorResult<()> {
        let deferred: Vec<DeferredWrite> = std::mem::take(&mut self.cycle.deferred)
            .into_iter()
            .filter(|d| self.cycle.committed.contains_key(&d.record.key))
            .collect();
        if deferred.is_empty() {
            return Ok(());
        }
        let Some(parent_column) = self.mapping.column_id(&SourceField::Parent).map(str::to_owned)
        else {
            return Ok(());
        };

        let outside: Vec<String> = deferred
            .iter()
            .map(|d| d.parent.clone())
            .filter(|p| !self.cycle.committed.contains_key(p))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let index = match self.engine.resolve_existing(&outside).await {
            Ok(index) => index,
            Err(e) if e.is_cycle_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "could not look up deferred parents");
                RecordIndex::new()
            }
        };

        let mut relinked = Vec::new();
        let mut pending_links: HashMap<String, (String, Option<Timestamp>)> = HashMap::new();
        for d in deferred {
            let parent_id = self
                .cycle
                .committed
                .get(&d.parent)
                .cloned()
                .or_else(|| index.get(&d.parent).map(|row| row.record_id.clone()));

            match parent_id {
                Some(id) => {
                    let mut record = d.record;
                    record
                        .fields
                        .insert(parent_column.clone(), FieldValue::Links(vec![id]));
                    pending_links.insert(record.key.clone(), (d.parent, d.updated));
                    relinked.push(record);
                }
                None => {
                    tracing::warn!(key = %d.record.key, parent = %d.parent, "parent link left unresolved");
                    self.summary.deferred_parent_links.push(DeferredLink {
                        key: d.record.key,
                        parent: d.parent,
                    });
                }
            }
        }

        if relinked.is_empty() {
            return Ok(());
        }

        self.summary.transition(CycleState::Upserting);
        tracing::info!(links = relinked.len(), "writing deferred parent links");
        let report = self.engine.upsert(relinked).await?;

        for (key, err) in report.failed {
            let (parent, updated) = pending_links.remove(&key).unwrap_or_default();
            self.fail(&key, updated, &err);
            self.summary
                .deferred_parent_links
                .push(DeferredLink { key, parent });
        }
        Ok(())
    }
}
