use std::collections::HashMap;
use std::sync::Arc;

use mirror_common::error::{MirrorError, MirrorResult};
use mirror_common::retry::{retry_with_backoff, RetryPolicy};
use mirror_db::destination::models::DestinationRecord;
use mirror_db::destination::repositories::DestinationStore;

use super::catalog::ColumnCatalog;

/// Append `value` to `allowed` unless it is already present.
pub fn reconcile_allowed(allowed: &[String], value: &str) -> Vec<String> {
    let mut next = allowed.to_vec();
    if !next.iter().any(|v| v == value) {
        next.push(value.to_owned());
    }
    next
}

/// Keeps the allowed value sets of enumerated columns in step with incoming data.
///
/// The registry only grows. Values are added to the destination schema before the
/// write that carries them.
pub struct Reconciler {
    store: Arc<dyn DestinationStore>,
    retry: RetryPolicy,
    registry: HashMap<String, Vec<String>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DestinationStore>, retry: RetryPolicy, catalog: &ColumnCatalog) -> Self {
        let registry = catalog
            .enumerated()
            .map(|c| (c.id.clone(), c.choices.clone()))
            .collect();
        Self {
            store,
            retry,
            registry,
        }
    }

    pub fn allowed(&self, column: &str) -> Option<&[String]> {
        self.registry.get(column).map(Vec::as_slice)
    }

    /// Make sure every value in `values` is allowed in `column`.
    ///
    /// Non-enumerated columns are left alone.
    pub async fn reconcile(&mut self, column: &str, values: &[&str]) -> MirrorResult<()> {
        let Some(known) = self.allowed(column) else {
            return Ok(());
        };
        if values.iter().all(|v| known.iter().any(|k| k == v)) {
            return Ok(());
        }

        // Another writer may have added choices since the catalog was read.
        let current = retry_with_backoff(&self.retry, "destination.get_schema", || {
            self.store.get_schema(column)
        })
        .await
        .map_err(|e| schema_failure(column, e.into_error()))?;

        let mut allowed = known.to_vec();
        for value in &current {
            allowed = reconcile_allowed(&allowed, value);
        }
        let known_len = allowed.len();
        for value in values {
            allowed = reconcile_allowed(&allowed, value);
        }

        if allowed.len() > known_len {
            retry_with_backoff(&self.retry, "destination.update_schema", || {
                self.store.update_schema(column, &allowed)
            })
            .await
            .map_err(|e| schema_failure(column, e.into_error()))?;
            tracing::info!(column, added = ?&allowed[known_len..], "registered new enumerated values");
        }

        self.registry.insert(column.to_owned(), allowed);
        Ok(())
    }

    /// Reconcile every enumerated value a record is about to write.
    pub async fn reconcile_record(&mut self, record: &DestinationRecord) -> MirrorResult<()> {
        for (column, value) in &record.fields {
            let values = value.choice_values();
            if values.is_empty() {
                continue;
            }
            self.reconcile(column, &values).await?;
        }
        Ok(())
    }
}

/// Unreachable destinations still end the cycle; anything else stays with the record.
fn schema_failure(column: &str, err: MirrorError) -> MirrorError {
    if err.is_cycle_fatal() || matches!(err, MirrorError::SchemaUpdateFailed { .. }) {
        return err;
    }
    MirrorError::SchemaUpdateFailed {
        column: column.to_owned(),
        reason: err.to_string(),
    }
}
