use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use mirror_common::error::{MirrorError, MirrorResult};
use mirror_config::DestinationConfig;
use mirror_db::destination::models::{
    ColumnInfo, DestinationRecord, FieldValue, PendingWrite, RecordFilter,
    ResumeMarker, RowOutcome, RowStatus, StoredRecord, UpsertBatch,
};
use mirror_db::destination::repositories::DestinationStore;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;

use super::models::{
    Choice, ErrorBody, ErrorEnvelope, FieldSchema, ListRecordsResponse, PerformUpsert, TableSchema,
    TablesResponse, UpsertRecord, UpsertRequest, UpsertResponse,
};

/// Airtable accepts at most ten records per write request.
const MAX_RECORDS_PER_REQUEST: usize = 10;
/// Keys per `filterByFormula`, keeping request URLs well under length limits.
const KEYS_PER_FORMULA: usize = 50;
const LIST_PAGE_SIZE: &str = "100";
/// Key of the row that holds the resume marker between runs.
pub const RESUME_MARKER_KEY: &str = "issuemirror:resume";

#[derive(Debug, Clone)]
pub struct AirtableClientConfig {
    pub api_url: String,
    pub api_key: String,
    pub base_id: String,
    pub table_name: String,
    pub timeout: Duration,
}

impl AirtableClientConfig {
    /// `None` unless the configured destination is Airtable.
    pub fn from_destination(destination: &DestinationConfig, timeout: Duration) -> Option<Self> {
        match destination {
            DestinationConfig::Airtable {
                api_key,
                base_id,
                table_name,
                api_url,
            } => Some(Self {
                api_url: api_url.trim_end_matches('/').to_owned(),
                api_key: api_key.clone(),
                base_id: base_id.clone(),
                table_name: table_name.clone(),
                timeout,
            }),
            DestinationConfig::Postgres { .. } => None,
        }
    }
}

/// Columns the resume marker row is written to.
#[derive(Debug, Clone)]
pub struct MarkerColumns {
    /// Id of the key column the upsert merges on.
    pub key: String,
    /// Column holding the marker instant; empty means from the beginning.
    pub updated: String,
}

#[derive(Clone)]
pub struct AirtableClient {
    client: Client,
    config: AirtableClientConfig,
    marker: Option<MarkerColumns>,
    /// Display name of the marker key column, needed for formulas.
    marker_key_name: OnceCell<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AirtableClientError {
    #[error("HTTP {status}: {body}")]
    HttpError { status: StatusCode, body: String },

    #[error("rate limited by airtable")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("table {0} not found in base")]
    TableNotFound(String),

    #[error("field {0} not found in table")]
    FieldNotFound(String),

    #[error("invalid api url: {0}")]
    InvalidUrl(String),
}

impl AirtableClientError {
    /// A schema change the token may not make, or Airtable refuses to apply.
    fn is_schema_refusal(&self) -> bool {
        matches!(
            self,
            Self::HttpError { status, .. }
                if matches!(
                    *status,
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY
                )
        )
    }

    fn is_unprocessable(&self) -> bool {
        matches!(self, Self::HttpError { status, .. } if *status == StatusCode::UNPROCESSABLE_ENTITY)
    }

    /// Airtable's error type and message, falling back to the raw body.
    fn reason(&self) -> String {
        match self {
            Self::HttpError { body, .. } => match serde_json::from_str::<ErrorEnvelope>(body) {
                Ok(envelope) => match envelope.error {
                    ErrorBody::Detailed { kind, message } if !message.is_empty() => {
                        format!("{kind}: {message}")
                    }
                    other => other.kind().to_owned(),
                },
                Err(_) => body.clone(),
            },
            other => other.to_string(),
        }
    }
}

impl From<AirtableClientError> for MirrorError {
    fn from(err: AirtableClientError) -> Self {
        match err {
            AirtableClientError::RateLimited { retry_after } => {
                MirrorError::RateLimited { retry_after }
            }
            AirtableClientError::HttpError { status, .. } if status.is_server_error() => {
                MirrorError::Transient(err.to_string())
            }
            AirtableClientError::HttpError { status, .. }
                if matches!(
                    status,
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
                ) =>
            {
                MirrorError::DestinationUnavailable(err.to_string())
            }
            AirtableClientError::HttpError { .. } | AirtableClientError::FieldNotFound(_) => {
                MirrorError::Rejected(err.reason())
            }
            AirtableClientError::RequestError(ref e) if e.is_timeout() || e.is_connect() => {
                MirrorError::Transient(err.to_string())
            }
            AirtableClientError::InvalidUrl(_) => MirrorError::ConfigurationInvalid(err.to_string()),
            other => MirrorError::DestinationUnavailable(other.to_string()),
        }
    }
}

impl AirtableClient {
    pub fn new(config: AirtableClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            marker: None,
            marker_key_name: OnceCell::new(),
        })
    }

    /// Keep the resume marker in a reserved row of the table.
    ///
    /// Without it the marker is not persisted and only lives in the running process.
    pub fn with_marker_columns(mut self, marker: MarkerColumns) -> Self {
        self.marker = Some(marker);
        self
    }

    /// For testing: create a client pointing at a specific base URL (e.g., wiremock).
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.api_url = base_url.to_string();
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, AirtableClientError> {
        let mut url = Url::parse(&self.config.api_url)
            .map_err(|e| AirtableClientError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| AirtableClientError::InvalidUrl(self.config.api_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn table_url(&self) -> Result<Url, AirtableClientError> {
        self.url(&["v0", &self.config.base_id, &self.config.table_name])
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, AirtableClientError> {
        let response = request.bearer_auth(&self.config.api_key).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AirtableClientError::RateLimited { retry_after });
        }

        let body = response.text().await.unwrap_or_default();
        Err(AirtableClientError::HttpError { status, body })
    }

    /// Every record matching the query, following `offset` pagination.
    async fn list_all(
        &self,
        params: &[(&str, String)],
    ) -> Result<Vec<StoredRecord>, AirtableClientError> {
        let url = self.table_url()?;
        let mut offset: Option<String> = None;
        let mut records = Vec::new();

        loop {
            let mut query: Vec<(&str, String)> = params.to_vec();
            query.push(("returnFieldsByFieldId", "true".to_owned()));
            if let Some(ref o) = offset {
                query.push(("offset", o.clone()));
            }

            let page: ListRecordsResponse =
                self.send(self.client.get(url.clone()).query(&query)).await?;
            records.extend(page.records.into_iter().map(StoredRecord::from));

            match page.offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(records)
    }

    async fn upsert_chunk(
        &self,
        key_column: &str,
        writes: &[PendingWrite],
    ) -> Result<Vec<RowOutcome>, AirtableClientError> {
        let request = UpsertRequest {
            perform_upsert: PerformUpsert {
                fields_to_merge_on: vec![key_column],
            },
            records: writes
                .iter()
                .map(|w| UpsertRecord {
                    fields: w.record.fields_json(),
                })
                .collect(),
            typecast: false,
            return_fields_by_field_id: true,
        };

        let response: UpsertResponse = self
            .send(self.client.patch(self.table_url()?).json(&request))
            .await?;

        let created: HashSet<&str> = response.created_records.iter().map(String::as_str).collect();
        Ok(writes
            .iter()
            .enumerate()
            .map(|(i, write)| match response.records.get(i) {
                Some(record) if created.contains(record.id.as_str()) => {
                    RowOutcome::created(&write.record.key, &record.id)
                }
                Some(record) => RowOutcome::updated(&write.record.key, &record.id),
                None => RowOutcome::rejected(&write.record.key, "record missing from upsert response"),
            })
            .collect())
    }

    async fn marker_key_name(&self, marker: &MarkerColumns) -> Result<&str, AirtableClientError> {
        self.marker_key_name
            .get_or_try_init(|| async {
                let table = self.table_schema().await?;
                Ok(Self::find_field(&table, &marker.key)?.name.clone())
            })
            .await
            .map(String::as_str)
    }

    async fn marker_rows(&self, marker: &MarkerColumns) -> Result<Vec<StoredRecord>, AirtableClientError> {
        let key_name = self.marker_key_name(marker).await?;
        let params = [(
            "filterByFormula",
            keys_formula(key_name, &[RESUME_MARKER_KEY.to_owned()]),
        )];
        self.list_all(&params).await
    }

    async fn table_schema(&self) -> Result<TableSchema, AirtableClientError> {
        let url = self.url(&["v0", "meta", "bases", &self.config.base_id, "tables"])?;
        let response: TablesResponse = self.send(self.client.get(url)).await?;
        response
            .tables
            .into_iter()
            .find(|t| t.name == self.config.table_name || t.id == self.config.table_name)
            .ok_or_else(|| AirtableClientError::TableNotFound(self.config.table_name.clone()))
    }

    fn find_field<'a>(table: &'a TableSchema, column: &str) -> Result<&'a FieldSchema, AirtableClientError> {
        table
            .fields
            .iter()
            .find(|f| f.id == column || f.name == column)
            .ok_or_else(|| AirtableClientError::FieldNotFound(column.to_owned()))
    }
}

/// Refused schema changes fail the record that needed them, not the cycle.
fn schema_error(column: &str, err: AirtableClientError) -> MirrorError {
    if err.is_schema_refusal() {
        MirrorError::SchemaUpdateFailed {
            column: column.to_owned(),
            reason: err.reason(),
        }
    } else {
        err.into()
    }
}

/// Quote a value for an Airtable formula string literal.
fn formula_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn keys_formula(column_name: &str, keys: &[String]) -> String {
    let clauses: Vec<String> = keys
        .iter()
        .map(|k| format!("{{{column_name}}} = {}", formula_literal(k)))
        .collect();
    if clauses.len() == 1 {
        clauses.into_iter().next().unwrap_or_default()
    } else {
        format!("OR({})", clauses.join(", "))
    }
}

#[async_trait]
impl DestinationStore for AirtableClient {
    async fn list_records(&self, filter: &RecordFilter) -> MirrorResult<Vec<StoredRecord>> {
        match filter {
            RecordFilter::ByKeys { column, keys } => {
                let mut records = Vec::new();
                for chunk in keys.chunks(KEYS_PER_FORMULA) {
                    let params = [
                        ("filterByFormula", keys_formula(&column.name, chunk)),
                        ("pageSize", LIST_PAGE_SIZE.to_owned()),
                    ];
                    records.extend(self.list_all(&params).await?);
                }
                Ok(records)
            }
            RecordFilter::NewestBy { column, limit } => {
                let not_empty = format!("NOT({{{}}} = '')", column.name);
                let formula = match &self.marker {
                    Some(marker) => {
                        let key_name = self.marker_key_name(marker).await?;
                        format!(
                            "AND({not_empty}, {{{key_name}}} != {})",
                            formula_literal(RESUME_MARKER_KEY)
                        )
                    }
                    None => not_empty,
                };
                let params = [
                    ("sort[0][field]", column.id.clone()),
                    ("sort[0][direction]", "desc".to_owned()),
                    ("maxRecords", limit.to_string()),
                    ("filterByFormula", formula),
                ];
                Ok(self.list_all(&params).await?)
            }
        }
    }

    async fn upsert_batch(&self, batch: &UpsertBatch) -> MirrorResult<Vec<RowOutcome>> {
        let mut outcomes = Vec::with_capacity(batch.writes.len());

        for chunk in batch.writes.chunks(MAX_RECORDS_PER_REQUEST) {
            match self.upsert_chunk(&batch.key_column, chunk).await {
                Ok(chunk_outcomes) => outcomes.extend(chunk_outcomes),
                Err(e) if e.is_unprocessable() && chunk.len() > 1 => {
                    // Re-issue one by one to isolate the rejected record.
                    tracing::debug!(records = chunk.len(), error = %e, "splitting rejected upsert request");
                    for write in chunk {
                        match self.upsert_chunk(&batch.key_column, std::slice::from_ref(write)).await {
                            Ok(single) => outcomes.extend(single),
                            Err(e) if e.is_unprocessable() => {
                                outcomes.push(RowOutcome::rejected(&write.record.key, e.reason()))
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                Err(e) if e.is_unprocessable() => {
                    for write in chunk {
                        outcomes.push(RowOutcome::rejected(&write.record.key, e.reason()));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(outcomes)
    }

    async fn get_schema(&self, column: &str) -> MirrorResult<Vec<String>> {
        let table = self
            .table_schema()
            .await
            .map_err(|e| schema_error(column, e))?;
        Ok(Self::find_field(&table, column)?.choice_names())
    }

    async fn update_schema(&self, column: &str, allowed: &[String]) -> MirrorResult<()> {
        let table = self.table_schema().await?;
        let field = Self::find_field(&table, column)?;
        let existing = field.options.clone().unwrap_or_default().choices;

        // Existing choices keep their ids so Airtable does not recreate them.
        let choices: Vec<Choice> = allowed
            .iter()
            .map(|name| Choice {
                id: existing.iter().find(|c| &c.name == name).and_then(|c| c.id.clone()),
                name: name.clone(),
            })
            .collect();

        let url = self.url(&[
            "v0",
            "meta",
            "bases",
            &self.config.base_id,
            "tables",
            &table.id,
            "fields",
            &field.id,
        ])?;
        let body = serde_json::json!({ "options": { "choices": choices } });
        let _: serde_json::Value = self
            .send(self.client.patch(url).json(&body))
            .await
            .map_err(|e| schema_error(column, e))?;

        tracing::debug!(column, choices = allowed.len(), "airtable select options updated");
        Ok(())
    }

    async fn list_columns(&self) -> MirrorResult<Vec<ColumnInfo>> {
        let table = self.table_schema().await?;
        Ok(table.fields.iter().map(FieldSchema::to_column).collect())
    }

    async fn load_resume_marker(&self) -> MirrorResult<Option<ResumeMarker>> {
        let Some(marker) = self.marker.as_ref() else {
            return Ok(None);
        };
        let rows = self.marker_rows(marker).await?;
        Ok(rows.first().map(|row| {
            row.timestamp(&marker.updated)
                .map_or(ResumeMarker::Beginning, ResumeMarker::After)
        }))
    }

    async fn store_resume_marker(&self, resume: Option<ResumeMarker>) -> MirrorResult<()> {
        let Some(marker) = self.marker.as_ref() else {
            tracing::debug!("no marker columns configured, resume point kept in memory");
            return Ok(());
        };

        let Some(resume) = resume else {
            let ids: Vec<(&str, String)> = self
                .marker_rows(marker)
                .await?
                .into_iter()
                .map(|row| ("records[]", row.record_id))
                .collect();
            if ids.is_empty() {
                return Ok(());
            }
            let _: serde_json::Value = self
                .send(self.client.delete(self.table_url()?).query(&ids))
                .await?;
            return Ok(());
        };

        let mut record = DestinationRecord::new(RESUME_MARKER_KEY);
        record.fields.insert(
            marker.key.clone(),
            FieldValue::Text(RESUME_MARKER_KEY.to_owned()),
        );
        record.fields.insert(
            marker.updated.clone(),
            match resume {
                ResumeMarker::Beginning => FieldValue::Null,
                ResumeMarker::After(ts) => FieldValue::Timestamp(ts),
            },
        );
        let write = PendingWrite {
            record,
            existing_id: None,
        };
        let outcomes = self.upsert_chunk(&marker.key, std::slice::from_ref(&write)).await?;
        match outcomes.first().map(|o| &o.status) {
            Some(RowStatus::Rejected { reason }) => Err(MirrorError::Rejected(reason.clone())),
            _ => Ok(()),
        }
    }
}
