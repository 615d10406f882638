use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::destination::models::{
    ColumnInfo, ColumnKind, RecordFilter, ResumeMarker, RowOutcome, StoredRecord, UpsertBatch,
};
use crate::destination::repositories::DestinationStore;
use mirror_common::error::{MirrorError, MirrorResult};

/// Destination table stored as JSONB rows in Postgres.
///
/// Several logical tables share `mirror_records`, told apart by `table_name`.
/// Column metadata, including the allowed values of select columns, lives in
/// `mirror_columns`. A cycle that did not finish leaves its resume point in
/// `mirror_state`.
#[derive(Clone)]
pub struct PgDestinationStore {
    pool: PgPool,
    table: String,
}

impl PgDestinationStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Create the backing tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> MirrorResult<()> {
        sqlx::query(
            "create table if not exists mirror_records (
               id uuid primary key,
               table_name text not null,
               record_key text not null,
               fields jsonb not null default '{}'::jsonb,
               created_at timestamptz not null default now(),
               updated_at timestamptz not null default now(),
               unique (table_name, record_key)
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        sqlx::query(
            "create table if not exists mirror_columns (
               table_name text not null,
               column_id text not null,
               column_name text not null,
               kind text not null,
               choices text[] not null default '{}',
               primary key (table_name, column_id)
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        // A row with a null `resume_after` means re-fetch from the beginning.
        sqlx::query(
            "create table if not exists mirror_state (
               table_name text primary key,
               resume_after timestamptz,
               recorded_at timestamptz not null default now()
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    /// Register a column. An existing definition, including its choices, is kept.
    pub async fn define_column(&self, column: &ColumnInfo) -> MirrorResult<()> {
        sqlx::query(
            "insert into mirror_columns (table_name, column_id, column_name, kind, choices)
             values ($1, $2, $3, $4, $5)
             on conflict (table_name, column_id) do nothing",
        )
        .bind(&self.table)
        .bind(&column.id)
        .bind(&column.name)
        .bind(column.kind.as_str())
        .bind(&column.choices)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    pub async fn ensure_columns(&self, columns: &[ColumnInfo]) -> MirrorResult<()> {
        for column in columns {
            self.define_column(column).await?;
        }
        tracing::debug!(table = %self.table, count = columns.len(), "destination columns ensured");
        Ok(())
    }

    fn map_record(row: sqlx::postgres::PgRow) -> MirrorResult<StoredRecord> {
        let id: Uuid = row.try_get("id").map_err(db_error)?;
        let fields: serde_json::Value = row.try_get("fields").map_err(db_error)?;
        Ok(StoredRecord {
            record_id: id.to_string(),
            fields: match fields {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
        })
    }

    fn map_column(row: sqlx::postgres::PgRow) -> MirrorResult<ColumnInfo> {
        let kind: String = row.try_get("kind").map_err(db_error)?;
        Ok(ColumnInfo {
            id: row.try_get("column_id").map_err(db_error)?,
            name: row.try_get("column_name").map_err(db_error)?,
            kind: ColumnKind::parse(&kind),
            choices: row.try_get("choices").map_err(db_error)?,
        })
    }

    /// First value in the record that is not an allowed choice of its column.
    fn invalid_choice(
        fields: &serde_json::Map<String, serde_json::Value>,
        enumerated: &HashMap<String, ColumnInfo>,
    ) -> Option<String> {
        fields.iter().find_map(|(column_id, value)| {
            let column = enumerated.get(column_id)?;
            let values: Vec<&str> = match value {
                serde_json::Value::String(s) if !s.is_empty() => vec![s.as_str()],
                serde_json::Value::Array(items) => {
                    items.iter().filter_map(|v| v.as_str()).collect()
                }
                _ => Vec::new(),
            };
            values
                .into_iter()
                .find(|v| !column.choices.iter().any(|c| c == v))
                .map(|v| format!("`{v}` is not an allowed choice for column {}", column.name))
        })
    }
}

#[async_trait]
impl DestinationStore for PgDestinationStore {
    async fn list_records(&self, filter: &RecordFilter) -> MirrorResult<Vec<StoredRecord>> {
        let rows = match filter {
            RecordFilter::ByKeys { column, keys } => {
                if keys.is_empty() {
                    return Ok(Vec::new());
                }
                sqlx::query(
                    "select id, fields from mirror_records
                     where table_name = $1 and fields->>$2 = any($3)",
                )
                .bind(&self.table)
                .bind(&column.id)
                .bind(keys)
                .fetch_all(&self.pool)
                .await
            }
            RecordFilter::NewestBy { column, limit } => {
                // Canonical timestamps are fixed width, so text order is time order.
                sqlx::query(
                    "select id, fields from mirror_records
                     where table_name = $1 and fields->>$2 is not null
                     order by fields->>$2 desc
                     limit $3",
                )
                .bind(&self.table)
                .bind(&column.id)
                .bind(*limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(unavailable)?;

        rows.into_iter().map(Self::map_record).collect()
    }

    async fn upsert_batch(&self, batch: &UpsertBatch) -> MirrorResult<Vec<RowOutcome>> {
        let enumerated: HashMap<String, ColumnInfo> = self
            .list_columns()
            .await?
            .into_iter()
            .filter(ColumnInfo::is_enumerated)
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut outcomes = Vec::with_capacity(batch.writes.len());
        for write in &batch.writes {
            let key = &write.record.key;
            let fields = write.record.fields_json();

            if let Some(reason) = Self::invalid_choice(&fields, &enumerated) {
                outcomes.push(RowOutcome::rejected(key.clone(), reason));
                continue;
            }

            let result = sqlx::query(
                "insert into mirror_records (id, table_name, record_key, fields, updated_at)
                 values ($1, $2, $3, $4, $5)
                 on conflict (table_name, record_key)
                 do update set fields = excluded.fields, updated_at = excluded.updated_at
                 returning id, (xmax = 0) as inserted",
            )
            .bind(Uuid::new_v4())
            .bind(&self.table)
            .bind(key)
            .bind(serde_json::Value::Object(fields))
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => {
                    let id: Uuid = row.try_get("id").map_err(db_error)?;
                    let inserted: bool = row.try_get("inserted").map_err(db_error)?;
                    outcomes.push(if inserted {
                        RowOutcome::created(key.clone(), id.to_string())
                    } else {
                        RowOutcome::updated(key.clone(), id.to_string())
                    });
                }
                Err(e) if is_connection_error(&e) => {
                    return Err(MirrorError::Transient(e.to_string()));
                }
                Err(e) => outcomes.push(RowOutcome::rejected(key.clone(), e.to_string())),
            }
        }

        Ok(outcomes)
    }

    async fn get_schema(&self, column: &str) -> MirrorResult<Vec<String>> {
        let row = sqlx::query(
            "select choices from mirror_columns where table_name = $1 and column_id = $2",
        )
        .bind(&self.table)
        .bind(column)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(r) => r.try_get("choices").map_err(db_error),
            None => Err(MirrorError::Database(format!(
                "column {column} is not defined for table {}",
                self.table
            ))),
        }
    }

    async fn update_schema(&self, column: &str, allowed: &[String]) -> MirrorResult<()> {
        let result = sqlx::query(
            "update mirror_columns set choices = $3
             where table_name = $1 and column_id = $2",
        )
        .bind(&self.table)
        .bind(column)
        .bind(allowed)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(MirrorError::SchemaUpdateFailed {
                column: column.to_owned(),
                reason: "column is not defined".to_owned(),
            });
        }
        Ok(())
    }

    async fn list_columns(&self) -> MirrorResult<Vec<ColumnInfo>> {
        let rows = sqlx::query(
            "select column_id, column_name, kind, choices from mirror_columns
             where table_name = $1
             order by column_id",
        )
        .bind(&self.table)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.into_iter().map(Self::map_column).collect()
    }

    async fn load_resume_marker(&self) -> MirrorResult<Option<ResumeMarker>> {
        let row = sqlx::query("select resume_after from mirror_state where table_name = $1")
            .bind(&self.table)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let after: Option<DateTime<Utc>> = row.try_get("resume_after").map_err(db_error)?;
        Ok(Some(after.map_or(ResumeMarker::Beginning, ResumeMarker::After)))
    }

    async fn store_resume_marker(&self, marker: Option<ResumeMarker>) -> MirrorResult<()> {
        let result = match marker {
            None => {
                sqlx::query("delete from mirror_state where table_name = $1")
                    .bind(&self.table)
                    .execute(&self.pool)
                    .await
            }
            Some(marker) => {
                let after = match marker {
                    ResumeMarker::Beginning => None,
                    ResumeMarker::After(ts) => Some(ts),
                };
                sqlx::query(
                    "insert into mirror_state (table_name, resume_after, recorded_at)
                     values ($1, $2, now())
                     on conflict (table_name)
                     do update set resume_after = excluded.resume_after, recorded_at = now()",
                )
                .bind(&self.table)
                .bind(after)
                .execute(&self.pool)
                .await
            }
        };
        result.map_err(db_error)?;
        Ok(())
    }
}

fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

fn db_error(e: sqlx::Error) -> MirrorError {
    if is_connection_error(&e) {
        MirrorError::Transient(e.to_string())
    } else {
        MirrorError::Database(e.to_string())
    }
}

/// Reads that gate a whole cycle report an unreachable database as unavailable.
fn unavailable(e: sqlx::Error) -> MirrorError {
    if is_connection_error(&e) {
        MirrorError::DestinationUnavailable(e.to_string())
    } else {
        MirrorError::Database(e.to_string())
    }
}
