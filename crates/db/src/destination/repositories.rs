use async_trait::async_trait;

use crate::destination::models::{
    ColumnInfo, RecordFilter, ResumeMarker, RowOutcome, StoredRecord, UpsertBatch,
};
use mirror_common::error::MirrorResult;

/// Tabular store the mirror writes into.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Read rows matching `filter`.
    async fn list_records(&self, filter: &RecordFilter) -> MirrorResult<Vec<StoredRecord>>;

    /// Create or overwrite every write in the batch, keyed on `batch.key_column`.
    ///
    /// Per-row problems come back as `RowStatus::Rejected`; an `Err` means the
    /// whole request failed and nothing can be assumed about its rows.
    async fn upsert_batch(&self, batch: &UpsertBatch) -> MirrorResult<Vec<RowOutcome>>;

    /// Allowed values of an enumerated column.
    async fn get_schema(&self, column: &str) -> MirrorResult<Vec<String>>;

    /// Replace the allowed values of an enumerated column.
    async fn update_schema(&self, column: &str, allowed: &[String]) -> MirrorResult<()>;

    /// Every column of the table, used for pre-flight validation.
    async fn list_columns(&self) -> MirrorResult<Vec<ColumnInfo>>;

    /// The marker left by the last incomplete cycle, if any.
    async fn load_resume_marker(&self) -> MirrorResult<Option<ResumeMarker>>;

    /// Record where the next cycle must start, or clear it with `None`.
    async fn store_resume_marker(&self, marker: Option<ResumeMarker>) -> MirrorResult<()>;
}
