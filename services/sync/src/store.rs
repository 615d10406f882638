use std::sync::Arc;

use mirror_common::error::{MirrorError, MirrorResult};
use mirror_config::{AppConfig, DestinationConfig, FieldMapping, SourceField};
use mirror_db::destination::models::{ColumnInfo, ColumnKind};
use mirror_db::destination::pg_repository::PgDestinationStore;
use mirror_db::destination::repositories::DestinationStore;

use crate::airtable::client::{AirtableClient, AirtableClientConfig, MarkerColumns};

/// Build the configured destination, bootstrapping the Postgres schema when needed.
pub async fn connect_destination(config: &AppConfig) -> MirrorResult<Arc<dyn DestinationStore>> {
    match &config.destination {
        DestinationConfig::Airtable { .. } => {
            let client_config =
                AirtableClientConfig::from_destination(&config.destination, config.sync.http_timeout)
                    .ok_or_else(|| {
                        MirrorError::ConfigurationInvalid("airtable destination expected".into())
                    })?;
            let mut client = AirtableClient::new(client_config)
                .map_err(|e| MirrorError::ConfigurationInvalid(e.to_string()))?;
            match marker_columns(&config.mapping) {
                Some(marker) => client = client.with_marker_columns(marker),
                None => tracing::warn!("key or updated column unmapped, resume point is not persisted"),
            }
            Ok(Arc::new(client))
        }
        DestinationConfig::Postgres {
            database_url,
            table,
        } => {
            let pool = mirror_db::create_pool(database_url).await?;
            let store = PgDestinationStore::new(pool, table.clone());
            store.ensure_schema().await?;
            store.ensure_columns(&postgres_columns(&config.mapping)).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Where the Airtable resume marker row keeps its key and instant.
fn marker_columns(mapping: &FieldMapping) -> Option<MarkerColumns> {
    Some(MarkerColumns {
        key: mapping.column_id(&SourceField::Key)?.to_owned(),
        updated: mapping.column_id(&SourceField::Updated)?.to_owned(),
    })
}

/// Column definitions for a Postgres table derived from the mapping.
pub fn postgres_columns(mapping: &FieldMapping) -> Vec<ColumnInfo> {
    mapping
        .entries()
        .map(|(field, target)| {
            let kind = match field {
                SourceField::Status => ColumnKind::SingleSelect,
                SourceField::Parent => ColumnKind::LinkedRecords,
                SourceField::Created
                | SourceField::Updated
                | SourceField::ResolutionDate
                | SourceField::CommentUpdated
                | SourceField::StatusUpdated => ColumnKind::DateTime,
                _ => ColumnKind::Text,
            };
            ColumnInfo::new(&target.id, target.label(), kind)
        })
        .collect()
}
