use std::collections::BTreeMap;

use mirror_common::time::{canonical, parse_timestamp, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A transformed value ready to be written to a destination column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Timestamp(Timestamp),
    /// Record ids of linked rows in the same table.
    Links(Vec<String>),
    List(Vec<String>),
    /// Clears a column the source no longer fills.
    Null,
}

impl FieldValue {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Timestamp(ts) => Value::String(canonical(ts)),
            Self::Links(ids) | Self::List(ids) => {
                Value::Array(ids.iter().cloned().map(Value::String).collect())
            }
            Self::Null => Value::Null,
        }
    }

    /// Values that must be present in an enumerated column's allowed set.
    pub fn choice_values(&self) -> Vec<&str> {
        match self {
            Self::Text(s) if !s.is_empty() => vec![s.as_str()],
            Self::List(items) => items.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

/// One flat row keyed by the source identifier. Field keys are column ids.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationRecord {
    pub key: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl DestinationRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn fields_json(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(column, value)| (column.clone(), value.to_json()))
            .collect()
    }
}

/// A row as currently held by the destination, fields keyed by column id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record_id: String,
    pub fields: Map<String, Value>,
}

impl StoredRecord {
    pub fn text(&self, column: &str) -> Option<&str> {
        match self.fields.get(column)? {
            Value::String(s) => Some(s.as_str()),
            Value::Array(items) => items.first().and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn timestamp(&self, column: &str) -> Option<Timestamp> {
        self.text(column).and_then(parse_timestamp)
    }
}

/// A column addressed by id, with the display name some backends need for queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub id: String,
    pub name: String,
}

impl ColumnRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordFilter {
    /// Rows whose `column` holds one of `keys`.
    ByKeys { column: ColumnRef, keys: Vec<String> },
    /// The `limit` rows with the greatest value in `column`, descending.
    NewestBy { column: ColumnRef, limit: usize },
}

/// Where a cycle that did not finish cleanly left off.
///
/// The next cycle fetches from here even when the watermark has moved past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMarker {
    /// Re-fetch without a lower time bound.
    Beginning,
    /// Re-fetch everything updated after this instant.
    After(Timestamp),
}

impl ResumeMarker {
    /// Whichever of the two re-fetches more.
    pub fn earliest(self, other: Self) -> Self {
        match (self, other) {
            (Self::After(a), Self::After(b)) => Self::After(a.min(b)),
            _ => Self::Beginning,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub record: DestinationRecord,
    pub existing_id: Option<String>,
}

/// One combined create/update request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertBatch {
    pub key_column: String,
    pub writes: Vec<PendingWrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowStatus {
    Created { record_id: String },
    Updated { record_id: String },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOutcome {
    pub key: String,
    pub status: RowStatus,
}

impl RowOutcome {
    pub fn created(key: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: RowStatus::Created {
                record_id: record_id.into(),
            },
        }
    }

    pub fn updated(key: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: RowStatus::Updated {
                record_id: record_id.into(),
            },
        }
    }

    pub fn rejected(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: RowStatus::Rejected {
                reason: reason.into(),
            },
        }
    }

    pub fn record_id(&self) -> Option<&str> {
        match &self.status {
            RowStatus::Created { record_id } | RowStatus::Updated { record_id } => {
                Some(record_id)
            }
            RowStatus::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Number,
    DateTime,
    SingleSelect,
    MultipleSelects,
    LinkedRecords,
    Other,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::DateTime => "date_time",
            Self::SingleSelect => "single_select",
            Self::MultipleSelects => "multiple_selects",
            Self::LinkedRecords => "linked_records",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "text" => Self::Text,
            "number" => Self::Number,
            "date_time" => Self::DateTime,
            "single_select" => Self::SingleSelect,
            "multiple_selects" => Self::MultipleSelects,
            "linked_records" => Self::LinkedRecords,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub id: String,
    pub name: String,
    pub kind: ColumnKind,
    pub choices: Vec<String>,
}

impl ColumnInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            choices: Vec::new(),
        }
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    /// Whether writes are constrained to an allowed value set.
    pub fn is_enumerated(&self) -> bool {
        matches!(self.kind, ColumnKind::SingleSelect | ColumnKind::MultipleSelects)
    }

    pub fn accepts_list(&self) -> bool {
        matches!(
            self.kind,
            ColumnKind::MultipleSelects | ColumnKind::LinkedRecords
        )
    }
}
