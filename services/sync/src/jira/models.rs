use std::collections::BTreeMap;

use mirror_common::time::{parse_timestamp, Timestamp};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::source::{Comment, RawValue, SourceRecord};

/// Fields whose string values are timestamps.
const DATE_FIELDS: [&str; 4] = ["created", "updated", "resolutiondate", "statuscategorychangedate"];

/// Response of `GET /rest/api/2/search/jql`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraSearchResponse {
    #[serde(default)]
    pub issues: Vec<JiraIssue>,
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub is_last: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraIssue {
    pub key: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub changelog: Option<JiraChangelog>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JiraChangelog {
    #[serde(default)]
    pub histories: Vec<JiraChangelogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraChangelogEntry {
    pub created: String,
    #[serde(default)]
    pub items: Vec<JiraChangelogItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraChangelogItem {
    pub field: String,
    pub from_string: Option<String>,
    pub to_string: Option<String>,
}

/// Response of `GET /rest/api/2/issue/{key}/comment`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraCommentPage {
    #[serde(default)]
    pub start_at: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub comments: Vec<JiraComment>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraComment {
    #[serde(default)]
    pub body: String,
    pub author: Option<JiraUserRef>,
    pub created: String,
    pub updated: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraUserRef {
    pub display_name: Option<String>,
    pub account_id: Option<String>,
}

impl JiraComment {
    /// `None` when the comment carries no parseable creation time.
    pub fn into_comment(self) -> Option<Comment> {
        let created = parse_timestamp(&self.created)?;
        let updated = self
            .updated
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(created);
        Some(Comment {
            body: self.body,
            author: self
                .author
                .and_then(|a| a.display_name.or(a.account_id)),
            created,
            updated,
        })
    }
}

impl JiraIssue {
    /// Time of the most recent status transition in the changelog.
    pub fn status_changed_at(&self) -> Option<Timestamp> {
        self.changelog
            .as_ref()?
            .histories
            .iter()
            .filter(|h| h.items.iter().any(|i| i.field.eq_ignore_ascii_case("status")))
            .filter_map(|h| parse_timestamp(&h.created))
            .max()
    }

    pub fn parent_key(&self) -> Option<String> {
        self.fields
            .get("parent")?
            .get("key")?
            .as_str()
            .map(str::to_owned)
    }

    pub fn into_source_record(self) -> SourceRecord {
        let status_changed_at = self.status_changed_at();
        let parent_key = self.parent_key();

        let mut fields: BTreeMap<String, RawValue> = self
            .fields
            .iter()
            .filter_map(|(name, value)| flatten_field(name, value).map(|v| (name.clone(), v)))
            .collect();

        // An empty description arrives as null but is still a present value.
        fields
            .entry("description".to_owned())
            .or_insert_with(|| RawValue::Text(String::new()));

        SourceRecord {
            key: self.key,
            fields,
            parent_key,
            status_changed_at,
            latest_comment: None,
            comments_error: None,
        }
    }
}

fn flatten_field(name: &str, value: &Value) -> Option<RawValue> {
    if DATE_FIELDS.contains(&name) {
        if let Some(ts) = value.as_str().and_then(parse_timestamp) {
            return Some(RawValue::Timestamp(ts));
        }
    }
    flatten_value(value)
}

/// Reduce a JSON field value to a flat scalar or list.
///
/// Objects collapse to their `key`, `value`, `name` or `displayName`, in that order.
pub fn flatten_value(value: &Value) -> Option<RawValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(RawValue::Text(b.to_string())),
        Value::Number(n) => n.as_f64().map(RawValue::Number),
        Value::String(s) => Some(RawValue::Text(s.clone())),
        Value::Object(obj) => object_text(obj).map(RawValue::Text),
        Value::Array(items) => Some(RawValue::List(
            items.iter().filter_map(scalar_text).collect(),
        )),
    }
}

fn object_text(obj: &Map<String, Value>) -> Option<String> {
    ["key", "value", "name", "displayName"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_owned)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(obj) => object_text(obj),
        _ => None,
    }
}
