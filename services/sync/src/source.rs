use std::collections::BTreeMap;

use async_trait::async_trait;
use mirror_common::error::MirrorResult;
use mirror_common::time::Timestamp;

/// A field value as delivered by the source, already flattened.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Text(String),
    Number(f64),
    Timestamp(Timestamp),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub body: String,
    pub author: Option<String>,
    pub created: Timestamp,
    pub updated: Timestamp,
}

/// One issue as fetched in a cycle. Field keys are source field names.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub key: String,
    pub fields: BTreeMap<String, RawValue>,
    pub parent_key: Option<String>,
    /// When the status last changed, from the issue changelog.
    pub status_changed_at: Option<Timestamp>,
    pub latest_comment: Option<Comment>,
    /// Set when comments were wanted but could not be fetched.
    pub comments_error: Option<String>,
}

impl SourceRecord {
    pub fn updated(&self) -> Option<Timestamp> {
        match self.fields.get("updated") {
            Some(RawValue::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(RawValue::Text(s)) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeQuery {
    pub base_filter: String,
    /// Only issues modified after this instant. `None` means no time bound.
    pub since: Option<Timestamp>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub records: Vec<SourceRecord>,
    pub next_page_token: Option<String>,
}

/// Issue tracker the mirror reads from.
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// One page of issues matching `query`, ordered by creation time ascending.
    async fn search(
        &self,
        query: &ChangeQuery,
        page_token: Option<&str>,
        page_size: u32,
    ) -> MirrorResult<SearchPage>;

    /// All comments on an issue, oldest first.
    async fn get_comments(&self, key: &str) -> MirrorResult<Vec<Comment>>;
}
