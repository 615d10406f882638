use std::collections::{BTreeMap, HashMap, HashSet};

use mirror_common::error::{MirrorError, MirrorResult};
use serde::Deserialize;

/// A source-side field name as it appears in the mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceField {
    Key,
    Summary,
    Description,
    Status,
    Created,
    Updated,
    IssueType,
    Assignee,
    Reporter,
    Parent,
    ResolutionDate,
    LatestComment,
    CommentAuthor,
    CommentUpdated,
    StatusUpdated,
    Other(String),
}

impl SourceField {
    pub const REQUIRED: [SourceField; 6] = [
        SourceField::Key,
        SourceField::Status,
        SourceField::Summary,
        SourceField::Description,
        SourceField::Created,
        SourceField::Updated,
    ];

    pub fn parse(name: &str) -> Self {
        match name {
            "key" => Self::Key,
            "summary" => Self::Summary,
            "description" => Self::Description,
            "status" => Self::Status,
            "created" => Self::Created,
            "updated" => Self::Updated,
            "issuetype" => Self::IssueType,
            "assignee" => Self::Assignee,
            "reporter" => Self::Reporter,
            "parent" => Self::Parent,
            "resolutiondate" => Self::ResolutionDate,
            "latest_comment" => Self::LatestComment,
            "comment_author" => Self::CommentAuthor,
            "comment_updated" => Self::CommentUpdated,
            "status_updated" => Self::StatusUpdated,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Key => "key",
            Self::Summary => "summary",
            Self::Description => "description",
            Self::Status => "status",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::IssueType => "issuetype",
            Self::Assignee => "assignee",
            Self::Reporter => "reporter",
            Self::Parent => "parent",
            Self::ResolutionDate => "resolutiondate",
            Self::LatestComment => "latest_comment",
            Self::CommentAuthor => "comment_author",
            Self::CommentUpdated => "comment_updated",
            Self::StatusUpdated => "status_updated",
            Self::Other(name) => name,
        }
    }

    pub fn is_required(&self) -> bool {
        Self::REQUIRED.contains(self)
    }

    pub fn is_comment_field(&self) -> bool {
        matches!(
            self,
            Self::LatestComment | Self::CommentAuthor | Self::CommentUpdated
        )
    }
}

/// Destination column a source field is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnTarget {
    pub id: String,
    pub name: Option<String>,
}

impl ColumnTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }

    /// Display name when known, otherwise the id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Accepts both `"field": "fldXXX"` and
/// `"field": {"column": "fldXXX", "name": "Status"}` (`airtable_field_id` is an alias).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MappingValue {
    Column(String),
    Detailed {
        #[serde(alias = "airtable_field_id")]
        column: String,
        #[serde(default, alias = "airtable_field_name")]
        name: Option<String>,
    },
}

/// Validated source-field → destination-column mapping.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    entries: Vec<(SourceField, ColumnTarget)>,
}

impl FieldMapping {
    pub fn new(entries: Vec<(SourceField, ColumnTarget)>) -> MirrorResult<Self> {
        let mapping = Self { entries };
        mapping.validate()?;
        Ok(mapping)
    }

    /// Parse the JSON mapping object. Keys starting with `_` are treated as comments.
    pub fn from_json(raw: &str) -> MirrorResult<Self> {
        let parsed: BTreeMap<String, MappingValue> = serde_json::from_str(raw).map_err(|e| {
            MirrorError::ConfigurationInvalid(format!("invalid JSON in field mapping: {e}"))
        })?;

        let entries = parsed
            .into_iter()
            .filter(|(field, _)| !field.starts_with('_'))
            .map(|(field, value)| {
                let target = match value {
                    MappingValue::Column(id) => ColumnTarget::new(id.trim()),
                    MappingValue::Detailed { column, name } => ColumnTarget {
                        id: column.trim().to_string(),
                        name: name.filter(|n| !n.trim().is_empty()),
                    },
                };
                (SourceField::parse(field.trim()), target)
            })
            .collect();

        Self::new(entries)
    }

    fn validate(&self) -> MirrorResult<()> {
        let mut problems = Vec::new();

        for required in SourceField::REQUIRED.iter() {
            if self.column(required).is_none() {
                problems.push(format!("required field `{}` is not mapped", required.as_str()));
            }
        }

        let mut seen_fields = HashSet::new();
        let mut seen_columns = HashSet::new();
        for (field, target) in &self.entries {
            if target.id.is_empty() {
                problems.push(format!("field `{}` maps to an empty column id", field.as_str()));
            }
            if !seen_fields.insert(field) {
                problems.push(format!("field `{}` is mapped twice", field.as_str()));
            }
            if !target.id.is_empty() && !seen_columns.insert(target.id.as_str()) {
                problems.push(format!("column `{}` is the target of more than one field", target.id));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MirrorError::ConfigurationInvalid(problems.join("; ")))
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&SourceField, &ColumnTarget)> {
        self.entries.iter().map(|(field, target)| (field, target))
    }

    pub fn column(&self, field: &SourceField) -> Option<&ColumnTarget> {
        self.entries
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, target)| target)
    }

    pub fn column_id(&self, field: &SourceField) -> Option<&str> {
        self.column(field).map(|t| t.id.as_str())
    }

    pub fn needs_comments(&self) -> bool {
        self.entries.iter().any(|(f, _)| f.is_comment_field())
    }

    /// Check every mapped column against the destination's `id → name` listing and
    /// fill in display names the configuration left out.
    pub fn resolve_against(&self, columns: &HashMap<String, String>) -> MirrorResult<Self> {
        let invalid: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, target)| !columns.contains_key(&target.id))
            .map(|(field, target)| format!("{} -> {}", field.as_str(), target.label()))
            .collect();

        if !invalid.is_empty() {
            let mut available: Vec<String> = columns
                .iter()
                .map(|(id, name)| format!("{name} ({id})"))
                .collect();
            available.sort();
            return Err(MirrorError::ConfigurationInvalid(format!(
                "the following field mappings are invalid: {}; available columns: {}",
                invalid.join(", "),
                available.join(", ")
            )));
        }

        let entries = self
            .entries
            .iter()
            .map(|(field, target)| {
                let name = target
                    .name
                    .clone()
                    .or_else(|| columns.get(&target.id).cloned());
                (
                    field.clone(),
                    ColumnTarget {
                        id: target.id.clone(),
                        name,
                    },
                )
            })
            .collect();

        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "key": "fldKey",
        "summary": "fldSummary",
        "description": "fldDescription",
        "status": {"column": "fldStatus", "name": "Status"},
        "created": "fldCreated",
        "updated": {"airtable_field_id": "fldUpdated", "airtable_field_name": "Last Updated"},
        "parent": "fldParent",
        "customfield_10016": "fldPoints",
        "_note": "ignored"
    }"#;

    #[test]
    fn parses_plain_and_detailed_entries() {
        let mapping = FieldMapping::from_json(FULL).unwrap();
        assert_eq!(mapping.column_id(&SourceField::Key), Some("fldKey"));
        let status = mapping.column(&SourceField::Status).unwrap();
        assert_eq!(status.label(), "Status");
        let updated = mapping.column(&SourceField::Updated).unwrap();
        assert_eq!(updated.id, "fldUpdated");
        assert_eq!(updated.label(), "Last Updated");
        assert_eq!(
            mapping.column_id(&SourceField::Other("customfield_10016".into())),
            Some("fldPoints")
        );
        assert!(mapping.column(&SourceField::Other("_note".into())).is_none());
    }

    #[test]
    fn missing_required_field_is_configuration_invalid() {
        let err = FieldMapping::from_json(
            r#"{"key": "a", "summary": "b", "description": "c", "created": "d", "updated": "e"}"#,
        )
        .unwrap_err();
        match err {
            MirrorError::ConfigurationInvalid(msg) => {
                assert!(msg.contains("`status`"), "got: {msg}")
            }
            other => panic!("expected ConfigurationInvalid, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_column_targets_rejected() {
        let err = FieldMapping::from_json(
            r#"{"key": "a", "summary": "a", "description": "c", "status": "s",
                "created": "d", "updated": "e"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than one field"), "got: {err}");
    }

    #[test]
    fn invalid_json_is_reported() {
        let err = FieldMapping::from_json("{not json").unwrap_err();
        assert!(err.to_string().contains("invalid JSON"), "got: {err}");
    }

    #[test]
    fn comment_fields_trigger_comment_fetch() {
        let mut raw: serde_json::Value = serde_json::from_str(FULL).unwrap();
        assert!(!FieldMapping::from_json(&raw.to_string()).unwrap().needs_comments());
        raw["latest_comment"] = serde_json::json!("fldComment");
        assert!(FieldMapping::from_json(&raw.to_string()).unwrap().needs_comments());
    }

    #[test]
    fn resolve_fills_names_and_reports_unknown_columns() {
        let mapping = FieldMapping::from_json(FULL).unwrap();
        let mut columns: HashMap<String, String> = [
            ("fldKey", "JIRA Key"),
            ("fldSummary", "Summary"),
            ("fldDescription", "Description"),
            ("fldStatus", "Status"),
            ("fldCreated", "Date Created"),
            ("fldUpdated", "Last Updated"),
            ("fldParent", "Parent"),
        ]
        .into_iter()
        .map(|(id, name)| (id.to_string(), name.to_string()))
        .collect();

        let err = mapping.resolve_against(&columns).unwrap_err();
        assert!(err.to_string().contains("customfield_10016 -> fldPoints"), "got: {err}");

        columns.insert("fldPoints".into(), "Story Points".into());
        let resolved = mapping.resolve_against(&columns).unwrap();
        assert_eq!(resolved.column(&SourceField::Key).unwrap().label(), "JIRA Key");
        assert_eq!(resolved.column(&SourceField::Status).unwrap().label(), "Status");
    }

    #[test]
    fn required_set_matches_field_flags() {
        assert!(SourceField::Description.is_required());
        assert!(!SourceField::Parent.is_required());
        assert_eq!(SourceField::parse("resolutiondate"), SourceField::ResolutionDate);
        assert_eq!(SourceField::parse("labels").as_str(), "labels");
    }
}
