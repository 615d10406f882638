use mirror_db::destination::models::{ColumnInfo, ColumnKind, StoredRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct AirtableRecord {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl From<AirtableRecord> for StoredRecord {
    fn from(record: AirtableRecord) -> Self {
        StoredRecord {
            record_id: record.id,
            fields: record.fields,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListRecordsResponse {
    #[serde(default)]
    pub records: Vec<AirtableRecord>,
    pub offset: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest<'a> {
    pub perform_upsert: PerformUpsert<'a>,
    pub records: Vec<UpsertRecord>,
    pub typecast: bool,
    pub return_fields_by_field_id: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformUpsert<'a> {
    pub fields_to_merge_on: Vec<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertRecord {
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResponse {
    #[serde(default)]
    pub records: Vec<AirtableRecord>,
    #[serde(default)]
    pub created_records: Vec<String>,
    #[serde(default)]
    pub updated_records: Vec<String>,
}

/// Response of `GET /v0/meta/bases/{base}/tables`.
#[derive(Debug, Clone, Deserialize)]
pub struct TablesResponse {
    #[serde(default)]
    pub tables: Vec<TableSchema>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSchema {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSchema {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub options: Option<FieldOptions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldOptions {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
}

/// Error envelope Airtable returns with 4xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorBody {
    Detailed {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        message: String,
    },
    Code(String),
}

impl ErrorBody {
    pub fn kind(&self) -> &str {
        match self {
            Self::Detailed { kind, .. } => kind,
            Self::Code(code) => code,
        }
    }
}

impl FieldSchema {
    pub fn kind(&self) -> ColumnKind {
        match self.field_type.as_str() {
            "singleLineText" | "multilineText" | "richText" | "email" | "url"
            | "phoneNumber" => ColumnKind::Text,
            "number" | "currency" | "percent" | "duration" | "rating" => ColumnKind::Number,
            "date" | "dateTime" | "createdTime" | "lastModifiedTime" => ColumnKind::DateTime,
            "singleSelect" => ColumnKind::SingleSelect,
            "multipleSelects" => ColumnKind::MultipleSelects,
            "multipleRecordLinks" => ColumnKind::LinkedRecords,
            _ => ColumnKind::Other,
        }
    }

    pub fn choice_names(&self) -> Vec<String> {
        self.options
            .as_ref()
            .map(|o| o.choices.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn to_column(&self) -> ColumnInfo {
        ColumnInfo::new(&self.id, &self.name, self.kind()).with_choices(self.choice_names())
    }
}
