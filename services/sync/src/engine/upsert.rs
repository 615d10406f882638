use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mirror_common::error::{MirrorError, MirrorResult};
use mirror_common::retry::{retry_with_backoff, RetryPolicy};
use mirror_db::destination::models::{
    ColumnRef, DestinationRecord, PendingWrite, RecordFilter, RowStatus, StoredRecord, UpsertBatch,
};
use mirror_db::destination::repositories::DestinationStore;

/// Rows currently stored in the destination, by source key.
pub type RecordIndex = HashMap<String, StoredRecord>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub key: String,
    pub record_id: String,
    pub created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertReport {
    pub committed: Vec<Committed>,
    pub failed: Vec<(String, MirrorError)>,
}

impl UpsertReport {
    pub fn created(&self) -> usize {
        self.committed.iter().filter(|c| c.created).count()
    }

    pub fn updated(&self) -> usize {
        self.committed.iter().filter(|c| !c.created).count()
    }

    fn merge(&mut self, other: UpsertReport) {
        self.committed.extend(other.committed);
        self.failed.extend(other.failed);
    }
}

/// Sole writer to the destination table.
pub struct UpsertEngine {
    store: Arc<dyn DestinationStore>,
    retry: RetryPolicy,
    key_column: ColumnRef,
    batch_size: usize,
}

impl UpsertEngine {
    pub fn new(
        store: Arc<dyn DestinationStore>,
        retry: RetryPolicy,
        key_column: ColumnRef,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            retry,
            key_column,
            batch_size: batch_size.max(1),
        }
    }

    /// Look up the stored rows for `keys`. Unknown keys are simply absent.
    pub async fn resolve_existing(&self, keys: &[String]) -> MirrorResult<RecordIndex> {
        if keys.is_empty() {
            return Ok(RecordIndex::new());
        }

        let filter = RecordFilter::ByKeys {
            column: self.key_column.clone(),
            keys: keys.to_vec(),
        };
        let rows = retry_with_backoff(&self.retry, "destination.list_records", || {
            self.store.list_records(&filter)
        })
        .await
        .map_err(|e| e.into_error())?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let key = row.text(&self.key_column.id)?.to_owned();
                Some((key, row))
            })
            .collect())
    }

    /// Pair each record with its stored row id, if any.
    pub fn plan(&self, records: Vec<DestinationRecord>, index: &RecordIndex) -> Vec<PendingWrite> {
        records
            .into_iter()
            .map(|record| PendingWrite {
                existing_id: index.get(&record.key).map(|r| r.record_id.clone()),
                record,
            })
            .collect()
    }

    /// Write `writes` in batches of the configured size.
    ///
    /// A failed batch fails only its own records. `Err` is reserved for a destination
    /// that can no longer be reached; batches committed before it stay committed.
    pub async fn commit(&self, writes: Vec<PendingWrite>) -> MirrorResult<UpsertReport> {
        let mut report = UpsertReport::default();
        for chunk in writes.chunks(self.batch_size) {
            report.merge(self.commit_batch(chunk).await?);
        }
        Ok(report)
    }

    /// Resolve, then write. Convenience for callers that have no index yet.
    pub async fn upsert(&self, records: Vec<DestinationRecord>) -> MirrorResult<UpsertReport> {
        let keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
        let index = self.resolve_existing(&keys).await?;
        let writes = self.plan(records, &index);
        self.commit(writes).await
    }

    async fn commit_batch(&self, writes: &[PendingWrite]) -> MirrorResult<UpsertReport> {
        let batch = UpsertBatch {
            key_column: self.key_column.id.clone(),
            writes: writes.to_vec(),
        };

        let outcomes = match retry_with_backoff(&self.retry, "destination.upsert_batch", || {
            self.store.upsert_batch(&batch)
        })
        .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                let err = e.into_error();
                if err.is_cycle_fatal() {
                    return Err(err);
                }
                tracing::warn!(records = writes.len(), error = %err, "upsert batch failed");
                return Ok(UpsertReport {
                    committed: Vec::new(),
                    failed: writes
                        .iter()
                        .map(|w| (w.record.key.clone(), err.clone()))
                        .collect(),
                });
            }
        };

        let mut report = UpsertReport::default();
        let mut seen = HashSet::new();
        for outcome in outcomes {
            seen.insert(outcome.key.clone());
            match outcome.status {
                RowStatus::Created { record_id } => report.committed.push(Committed {
                    key: outcome.key,
                    record_id,
                    created: true,
                }),
                RowStatus::Updated { record_id } => report.committed.push(Committed {
                    key: outcome.key,
                    record_id,
                    created: false,
                }),
                RowStatus::Rejected { reason } => {
                    report.failed.push((outcome.key, MirrorError::Rejected(reason)))
                }
            }
        }

        for write in writes.iter().filter(|w| !seen.contains(&w.record.key)) {
            report.failed.push((
                write.record.key.clone(),
                MirrorError::Rejected("destination returned no outcome for record".to_owned()),
            ));
        }

        tracing::debug!(
            created = report.created(),
            updated = report.updated(),
            failed = report.failed.len(),
            "upsert batch committed"
        );
        Ok(report)
    }
}
