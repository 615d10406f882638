use std::sync::Arc;

use mirror_common::error::{MirrorError, MirrorResult};
use mirror_common::retry::{retry_with_backoff, RetryPolicy};
use mirror_common::time::Timestamp;
use mirror_db::destination::models::{ColumnRef, RecordFilter};
use mirror_db::destination::repositories::DestinationStore;

/// Rows inspected when reading the watermark, so one malformed value does not hide it.
const SCAN_LIMIT: usize = 5;

/// Reads the newest committed `updated` value back from the destination.
pub struct WatermarkTracker {
    store: Arc<dyn DestinationStore>,
    column: Option<ColumnRef>,
    retry: RetryPolicy,
}

impl WatermarkTracker {
    /// `column` is the destination column holding the source `updated` value.
    pub fn new(store: Arc<dyn DestinationStore>, column: Option<ColumnRef>, retry: RetryPolicy) -> Self {
        Self {
            store,
            column,
            retry,
        }
    }

    /// `None` when the destination is empty or the column is unmapped.
    pub async fn get_watermark(&self) -> MirrorResult<Option<Timestamp>> {
        let Some(column) = self.column.as_ref() else {
            return Ok(None);
        };

        let filter = RecordFilter::NewestBy {
            column: column.clone(),
            limit: SCAN_LIMIT,
        };
        let rows = retry_with_backoff(&self.retry, "destination.watermark", || {
            self.store.list_records(&filter)
        })
        .await
        .map_err(|e| match e.into_inner() {
            MirrorError::DestinationUnavailable(msg) => MirrorError::DestinationUnavailable(msg),
            other => MirrorError::DestinationUnavailable(other.to_string()),
        })?;

        let watermark = rows.iter().filter_map(|r| r.timestamp(&column.id)).max();
        tracing::debug!(watermark = ?watermark, "watermark read");
        Ok(watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDestination;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5)).without_jitter()
    }

    fn updated_column() -> Option<ColumnRef> {
        Some(ColumnRef::new("fldUpdated", "Last Updated"))
    }

    #[tokio::test]
    async fn empty_destination_has_no_watermark() {
        let store = Arc::new(MemoryDestination::new());
        let tracker = WatermarkTracker::new(store, updated_column(), policy());
        assert_eq!(tracker.get_watermark().await.unwrap(), None);
    }

    #[tokio::test]
    async fn unmapped_column_has_no_watermark() {
        let store = Arc::new(MemoryDestination::new());
        store.seed("PROJ-1", &[("fldUpdated", "2026-02-20T15:00:00.000Z")]);
        let tracker = WatermarkTracker::new(store, None, policy());
        assert_eq!(tracker.get_watermark().await.unwrap(), None);
    }

    #[tokio::test]
    async fn returns_utc_maximum_across_offsets() {
        let store = Arc::new(MemoryDestination::new());
        store.seed("PROJ-1", &[("fldUpdated", "2026-02-10T10:00:00.000Z")]);
        // 17:00 at +0200 is 15:00Z, earlier than 11:00 at -0500 (16:00Z).
        store.seed("PROJ-2", &[("fldUpdated", "2026-02-20T17:00:00.000+0200")]);
        store.seed("PROJ-3", &[("fldUpdated", "2026-02-20T11:00:00.000-0500")]);
        store.seed("PROJ-4", &[("fldUpdated", "not a date")]);
        let tracker = WatermarkTracker::new(store, updated_column(), policy());

        assert_eq!(
            tracker.get_watermark().await.unwrap(),
            Some(Utc.with_ymd_and_hms(2026, 2, 20, 16, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn unreachable_destination_is_unavailable() {
        let store = Arc::new(MemoryDestination::new());
        store.set_unavailable(true);
        let tracker = WatermarkTracker::new(store, updated_column(), policy());

        let err = tracker.get_watermark().await.unwrap_err();
        assert!(matches!(err, MirrorError::DestinationUnavailable(_)), "got: {err:?}");
    }
}
