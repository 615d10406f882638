//! In-memory collaborators for engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mirror_common::error::{MirrorError, MirrorResult};
use mirror_common::time::{truncate_to_minute, Timestamp};
use mirror_db::destination::models::{
    ColumnInfo, RecordFilter, ResumeMarker, RowOutcome, StoredRecord, UpsertBatch,
};
use mirror_db::destination::repositories::DestinationStore;
use serde_json::Value;

use crate::source::{ChangeQuery, Comment, IssueSource, RawValue, SearchPage, SourceRecord};

/// Column the seeded rows carry their source key in.
pub const KEY_COLUMN: &str = "fldKey";

/// An open issue with every required field set, created and updated at `updated`.
pub fn issue(key: &str, updated: Timestamp) -> SourceRecord {
    let fields = BTreeMap::from([
        ("summary".to_owned(), RawValue::Text(format!("Summary of {key}"))),
        ("description".to_owned(), RawValue::Text(String::new())),
        ("status".to_owned(), RawValue::Text("Open".to_owned())),
        ("created".to_owned(), RawValue::Timestamp(updated)),
        ("updated".to_owned(), RawValue::Timestamp(updated)),
    ]);
    SourceRecord {
        key: key.to_owned(),
        fields,
        parent_key: None,
        status_changed_at: None,
        latest_comment: None,
        comments_error: None,
    }
}

// ── Source ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct SourceState {
    /// In creation order.
    records: Vec<SourceRecord>,
    comments: HashMap<String, Vec<Comment>>,
    searches: Vec<ChangeQuery>,
    transient_failures: u32,
    fail_from_page: Option<usize>,
    failing_comments: HashSet<String>,
    delay: Duration,
}

/// Issue source over a fixed list, paginated with offset tokens.
///
/// Time bounds are applied at minute precision like the real query language.
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<Mutex<SourceState>>,
}

impl FakeSource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        let source = Self::default();
        source.state.lock().unwrap().records = records;
        source
    }

    /// Replace the record with the same key, or append it as the newest issue.
    pub fn put(&self, record: SourceRecord) {
        let mut state = self.state.lock().unwrap();
        match state.records.iter_mut().find(|r| r.key == record.key) {
            Some(existing) => *existing = record,
            None => state.records.push(record),
        }
    }

    pub fn add_comment(&self, key: &str, body: &str, created: Timestamp) {
        self.state
            .lock()
            .unwrap()
            .comments
            .entry(key.to_owned())
            .or_default()
            .push(Comment {
                body: body.to_owned(),
                author: Some("Sam".to_owned()),
                created,
                updated: created,
            });
    }

    pub fn fail_next_searches(&self, n: u32) {
        self.state.lock().unwrap().transient_failures = n;
    }

    /// Every request for page `page` (0-based) or later fails transiently.
    pub fn fail_from_page(&self, page: usize) {
        self.state.lock().unwrap().fail_from_page = Some(page);
    }

    /// Comment requests for `key` fail transiently until healed.
    pub fn fail_comments_for(&self, key: &str) {
        self.state.lock().unwrap().failing_comments.insert(key.to_owned());
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.transient_failures = 0;
        state.fail_from_page = None;
        state.failing_comments.clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn search_calls(&self) -> usize {
        self.state.lock().unwrap().searches.len()
    }
}

#[async_trait]
impl IssueSource for FakeSource {
    async fn search(
        &self,
        query: &ChangeQuery,
        page_token: Option<&str>,
        page_size: u32,
    ) -> MirrorResult<SearchPage> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.searches.push(query.clone());
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let page_size = page_size.max(1) as usize;
        let page = offset / page_size;

        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(MirrorError::Transient("search returned 503".into()));
        }
        if state.fail_from_page.is_some_and(|from| page >= from) {
            return Err(MirrorError::Transient("search returned 503".into()));
        }

        let bound = query.since.as_ref().map(truncate_to_minute);
        let matching: Vec<&SourceRecord> = state
            .records
            .iter()
            .filter(|r| match (bound, r.updated()) {
                (Some(bound), Some(updated)) => updated >= bound,
                _ => true,
            })
            .collect();

        let records: Vec<SourceRecord> = matching
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|r| (*r).clone())
            .collect();
        let next = offset + records.len();
        let next_page_token = (next < matching.len()).then(|| next.to_string());

        Ok(SearchPage {
            records,
            next_page_token,
        })
    }

    async fn get_comments(&self, key: &str) -> MirrorResult<Vec<Comment>> {
        let state = self.state.lock().unwrap();
        if state.failing_comments.contains(key) {
            return Err(MirrorError::Transient("comments returned 503".into()));
        }
        Ok(state.comments.get(key).cloned().unwrap_or_default())
    }
}

// ── Destination ────────────────────────────────────────────────────────

#[derive(Default)]
struct DestinationState {
    rows: BTreeMap<String, StoredRecord>,
    columns: Vec<ColumnInfo>,
    next_id: u64,
    unavailable: bool,
    transient_upserts: u32,
    failing_batches: HashSet<String>,
    rejected_keys: HashSet<String>,
    reject_schema_updates: bool,
    schema_updates: usize,
    upsert_calls: Vec<Vec<String>>,
    resume: Option<ResumeMarker>,
}

impl DestinationState {
    fn check_available(&self) -> MirrorResult<()> {
        if self.unavailable {
            return Err(MirrorError::DestinationUnavailable("connection refused".into()));
        }
        Ok(())
    }

    fn column_mut(&mut self, id: &str) -> MirrorResult<&mut ColumnInfo> {
        self.columns
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| MirrorError::Rejected(format!("unknown column {id}")))
    }

    fn invalid_choice(&self, fields: &serde_json::Map<String, Value>) -> Option<String> {
        self.columns
            .iter()
            .filter(|c| c.is_enumerated())
            .find_map(|c| {
                let values: Vec<&str> = match fields.get(&c.id)? {
                    Value::String(s) => vec![s.as_str()],
                    Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                    _ => Vec::new(),
                };
                values
                    .into_iter()
                    .find(|v| !c.choices.iter().any(|choice| choice == v))
                    .map(|v| format!("insufficient permissions to create new select option \"{v}\""))
            })
    }
}

/// Destination table held in memory. Keys are unique; upserts overwrite whole rows.
#[derive(Clone, Default)]
pub struct MemoryDestination {
    state: Arc<Mutex<DestinationState>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(self, columns: Vec<ColumnInfo>) -> Self {
        self.state.lock().unwrap().columns = columns;
        self
    }

    pub fn seed(&self, key: &str, fields: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let mut map = serde_json::Map::new();
        map.insert(KEY_COLUMN.to_owned(), Value::String(key.to_owned()));
        for (column, value) in fields {
            map.insert((*column).to_owned(), Value::String((*value).to_owned()));
        }
        let record_id = format!("rec{}", state.next_id);
        state.rows.insert(
            key.to_owned(),
            StoredRecord {
                record_id,
                fields: map,
            },
        );
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn fail_next_upserts(&self, n: u32) {
        self.state.lock().unwrap().transient_upserts = n;
    }

    /// Any upsert request containing `key` fails transiently until healed.
    pub fn fail_batches_with(&self, key: &str) {
        self.state.lock().unwrap().failing_batches.insert(key.to_owned());
    }

    pub fn reject_key(&self, key: &str) {
        self.state.lock().unwrap().rejected_keys.insert(key.to_owned());
    }

    pub fn reject_schema_updates(&self, reject: bool) {
        self.state.lock().unwrap().reject_schema_updates = reject;
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.unavailable = false;
        state.transient_upserts = 0;
        state.failing_batches.clear();
    }

    pub fn set_choices(&self, column: &str, choices: &[&str]) {
        let mut state = self.state.lock().unwrap();
        if let Ok(c) = state.column_mut(column) {
            c.choices = choices.iter().map(|s| (*s).to_owned()).collect();
        }
    }

    pub fn columns(&self) -> Vec<ColumnInfo> {
        self.state.lock().unwrap().columns.clone()
    }

    pub fn choices(&self, column: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .columns
            .iter()
            .find(|c| c.id == column)
            .map(|c| c.choices.clone())
            .unwrap_or_default()
    }

    pub fn schema_updates(&self) -> usize {
        self.state.lock().unwrap().schema_updates
    }

    /// Keys of every upsert request that reached the table, in order.
    pub fn upsert_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().upsert_calls.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    pub fn record(&self, key: &str) -> Option<StoredRecord> {
        self.state.lock().unwrap().rows.get(key).cloned()
    }

    pub fn resume_marker(&self) -> Option<ResumeMarker> {
        self.state.lock().unwrap().resume
    }

    pub fn field(&self, key: &str, column: &str) -> Option<String> {
        self.record(key)
            .and_then(|r| r.text(column).map(str::to_owned))
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    async fn list_records(&self, filter: &RecordFilter) -> MirrorResult<Vec<StoredRecord>> {
        let state = self.state.lock().unwrap();
        state.check_available()?;

        match filter {
            RecordFilter::ByKeys { column, keys } => Ok(state
                .rows
                .values()
                .filter(|r| r.text(&column.id).is_some_and(|k| keys.iter().any(|key| key == k)))
                .cloned()
                .collect()),
            RecordFilter::NewestBy { column, limit } => {
                let mut rows: Vec<StoredRecord> = state
                    .rows
                    .values()
                    .filter(|r| r.text(&column.id).is_some_and(|v| !v.is_empty()))
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| b.text(&column.id).cmp(&a.text(&column.id)));
                rows.truncate(*limit);
                Ok(rows)
            }
        }
    }

    async fn upsert_batch(&self, batch: &UpsertBatch) -> MirrorResult<Vec<RowOutcome>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.check_available()?;

        if state.transient_upserts > 0 {
            state.transient_upserts -= 1;
            return Err(MirrorError::Transient("upsert returned 503".into()));
        }
        if batch
            .writes
            .iter()
            .any(|w| state.failing_batches.contains(&w.record.key))
        {
            return Err(MirrorError::Transient("upsert timed out".into()));
        }

        state
            .upsert_calls
            .push(batch.writes.iter().map(|w| w.record.key.clone()).collect());

        let mut outcomes = Vec::with_capacity(batch.writes.len());
        for write in &batch.writes {
            let key = write.record.key.clone();
            if state.rejected_keys.contains(&key) {
                outcomes.push(RowOutcome::rejected(key, "INVALID_VALUE_FOR_COLUMN"));
                continue;
            }

            let mut fields = write.record.fields_json();
            fields.insert(batch.key_column.clone(), Value::String(key.clone()));
            if let Some(reason) = state.invalid_choice(&fields) {
                outcomes.push(RowOutcome::rejected(key, reason));
                continue;
            }

            match state.rows.get_mut(&key) {
                Some(row) => {
                    row.fields = fields;
                    outcomes.push(RowOutcome::updated(key, row.record_id.clone()));
                }
                None => {
                    state.next_id += 1;
                    let record_id = format!("rec{}", state.next_id);
                    state.rows.insert(
                        key.clone(),
                        StoredRecord {
                            record_id: record_id.clone(),
                            fields,
                        },
                    );
                    outcomes.push(RowOutcome::created(key, record_id));
                }
            }
        }
        Ok(outcomes)
    }

    async fn get_schema(&self, column: &str) -> MirrorResult<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.check_available()?;
        Ok(state.column_mut(column)?.choices.clone())
    }

    async fn update_schema(&self, column: &str, allowed: &[String]) -> MirrorResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_available()?;
        if state.reject_schema_updates {
            return Err(MirrorError::Rejected("INVALID_PERMISSIONS".into()));
        }
        state.column_mut(column)?.choices = allowed.to_vec();
        state.schema_updates += 1;
        Ok(())
    }

    async fn list_columns(&self) -> MirrorResult<Vec<ColumnInfo>> {
        let state = self.state.lock().unwrap();
        state.check_available()?;
        Ok(state.columns.clone())
    }

    async fn load_resume_marker(&self) -> MirrorResult<Option<ResumeMarker>> {
        let state = self.state.lock().unwrap();
        state.check_available()?;
        Ok(state.resume)
    }

    async fn store_resume_marker(&self, marker: Option<ResumeMarker>) -> MirrorResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_available()?;
        state.resume = marker;
        Ok(())
    }
}
