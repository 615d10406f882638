use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MirrorError {
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("destination unavailable: {0}")]
    DestinationUnavailable(String),

    #[error("source fetch failed: {0}")]
    SourceFetchFailed(String),

    #[error("required field `{field}` missing on {key}")]
    RequiredFieldMissing { key: String, field: String },

    #[error("schema update failed for column {column}: {reason}")]
    SchemaUpdateFailed { column: String, reason: String },

    #[error("record rejected: {0}")]
    Rejected(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("database error: {0}")]
    Database(String),

    #[error("cycle cancelled")]
    Cancelled,
}

impl MirrorError {
    /// Stable snake_case name used in run summaries and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigurationInvalid(_) => "configuration_invalid",
            Self::DestinationUnavailable(_) => "destination_unavailable",
            Self::SourceFetchFailed(_) => "source_fetch_failed",
            Self::RequiredFieldMissing { .. } => "required_field_missing",
            Self::SchemaUpdateFailed { .. } => "schema_update_failed",
            Self::Rejected(_) => "rejected",
            Self::Transient(_) => "transient",
            Self::RateLimited { .. } => "rate_limited",
            Self::Database(_) => "database",
            Self::Cancelled => "cancelled",
        }
    }

    /// Network hiccups and rate limits that are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Errors that end the whole cycle rather than a single record.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationInvalid(_)
                | Self::DestinationUnavailable(_)
                | Self::SourceFetchFailed(_)
                | Self::Cancelled
        )
    }
}

pub type MirrorResult<T> = Result<T, MirrorError>;
