use mirror_common::error::{MirrorError, MirrorResult};
use mirror_config::{ColumnTarget, FieldMapping, SourceField};
use mirror_db::destination::models::{ColumnKind, DestinationRecord, FieldValue, StoredRecord};

use super::catalog::ColumnCatalog;
use crate::source::{RawValue, SourceRecord};

/// How the parent link column should be filled for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentLink {
    /// The record has no parent.
    NotApplicable,
    /// Destination record id of the already-synced parent.
    Resolved(String),
    /// The parent has not been written to the destination yet.
    Unresolved,
}

pub struct MapContext<'a> {
    /// The row currently stored for this key, if any.
    pub previous: Option<&'a StoredRecord>,
    pub parent: ParentLink,
    pub catalog: &'a ColumnCatalog,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub record: DestinationRecord,
    /// Parent key whose link was left out because the parent is not synced yet.
    pub deferred_parent: Option<String>,
}

/// Transform one source record into a destination row.
///
/// Pure: everything it needs from the destination arrives through `ctx`.
pub fn map_record(
    source: &SourceRecord,
    mapping: &FieldMapping,
    ctx: &MapContext<'_>,
) -> MirrorResult<MappedRecord> {
    let mut record = DestinationRecord::new(&source.key);
    let mut deferred_parent = None;

    for (field, target) in mapping.entries() {
        let value = match field {
            SourceField::Key => Some(FieldValue::Text(source.key.clone()))
                .filter(|_| !source.key.trim().is_empty()),
            SourceField::Parent => {
                let (value, deferred) = parent_value(source, target, ctx);
                deferred_parent = deferred;
                value
            }
            SourceField::LatestComment => source
                .latest_comment
                .as_ref()
                .map(|c| FieldValue::Text(c.body.clone())),
            SourceField::CommentAuthor => source
                .latest_comment
                .as_ref()
                .and_then(|c| c.author.clone())
                .map(FieldValue::Text),
            SourceField::CommentUpdated => source
                .latest_comment
                .as_ref()
                .map(|c| FieldValue::Timestamp(c.updated)),
            SourceField::StatusUpdated => status_updated(source, mapping, target, ctx),
            other => source
                .fields
                .get(other.as_str())
                .map(|raw| convert(raw, target, ctx.catalog)),
        };

        match value {
            Some(v) => {
                record.fields.insert(target.id.clone(), v);
            }
            None if field.is_required() => {
                return Err(MirrorError::RequiredFieldMissing {
                    key: source.key.clone(),
                    field: field.as_str().to_owned(),
                });
            }
            // Rows are overwritten, not merged: an emptied field clears its column.
            None => {
                record.fields.insert(target.id.clone(), FieldValue::Null);
            }
        }
    }

    Ok(MappedRecord {
        record,
        deferred_parent,
    })
}

fn convert(raw: &RawValue, target: &ColumnTarget, catalog: &ColumnCatalog) -> FieldValue {
    match raw {
        RawValue::Text(s) => FieldValue::Text(s.clone()),
        RawValue::Number(n) => FieldValue::Number(*n),
        RawValue::Timestamp(ts) => FieldValue::Timestamp(*ts),
        RawValue::List(items) if catalog.accepts_list(&target.id) => FieldValue::List(items.clone()),
        RawValue::List(items) => FieldValue::Text(items.join(", ")),
    }
}

fn parent_value(
    source: &SourceRecord,
    target: &ColumnTarget,
    ctx: &MapContext<'_>,
) -> (Option<FieldValue>, Option<String>) {
    let Some(parent_key) = source.parent_key.as_ref() else {
        return (None, None);
    };

    // A plain text column just stores the parent's key.
    if matches!(ctx.catalog.kind(&target.id), Some(ColumnKind::Text)) {
        return (Some(FieldValue::Text(parent_key.clone())), None);
    }

    match &ctx.parent {
        ParentLink::Resolved(record_id) => (Some(FieldValue::Links(vec![record_id.clone()])), None),
        ParentLink::Unresolved => {
            tracing::warn!(
                key = %source.key,
                parent = %parent_key,
                "parent not synced yet, deferring link"
            );
            (None, Some(parent_key.clone()))
        }
        ParentLink::NotApplicable => (None, None),
    }
}

/// Keep the stored status-change time while the status is unchanged; otherwise use the
/// latest status transition, falling back to `updated`.
fn status_updated(
    source: &SourceRecord,
    mapping: &FieldMapping,
    target: &ColumnTarget,
    ctx: &MapContext<'_>,
) -> Option<FieldValue> {
    let current_status = source.text(SourceField::Status.as_str());

    if let (Some(previous), Some(status_column)) =
        (ctx.previous, mapping.column_id(&SourceField::Status))
    {
        if previous.text(status_column) == current_status {
            if let Some(kept) = previous.timestamp(&target.id) {
                return Some(FieldValue::Timestamp(kept));
            }
        }
    }

    source
        .status_changed_at
        .or_else(|| source.updated())
        .map(FieldValue::Timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Comment;
    use chrono::{TimeZone, Utc};
    use mirror_common::time::Timestamp;
    use mirror_db::destination::models::ColumnInfo;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ts(day: u32, hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 2, day, hour, 0, 0).unwrap()
    }

    fn mapping() -> FieldMapping {
        FieldMapping::from_json(
            r#"{
                "key": "fldKey", "summary": "fldSummary", "description": "fldDesc",
                "status": "fldStatus", "created": "fldCreated", "updated": "fldUpdated",
                "parent": "fldParent", "labels": "fldLabels", "components": "fldComponents",
                "latest_comment": "fldComment", "comment_author": "fldCommentAuthor",
                "comment_updated": "fldCommentUpdated", "status_updated": "fldStatusUpdated",
                "customfield_10016": "fldPoints"
            }"#,
        )
        .unwrap()
    }

    fn catalog() -> ColumnCatalog {
        ColumnCatalog::new(vec![
            ColumnInfo::new("fldParent", "Parent", ColumnKind::LinkedRecords),
            ColumnInfo::new("fldLabels", "Labels", ColumnKind::MultipleSelects),
            ColumnInfo::new("fldComponents", "Components", ColumnKind::Text),
            ColumnInfo::new("fldStatus", "Status", ColumnKind::SingleSelect),
        ])
    }

    fn source(key: &str) -> SourceRecord {
        let fields = BTreeMap::from([
            ("summary".to_owned(), RawValue::Text("Fix login".into())),
            ("description".to_owned(), RawValue::Text(String::new())),
            ("status".to_owned(), RawValue::Text("In Progress".into())),
            ("created".to_owned(), RawValue::Timestamp(ts(10, 10))),
            ("updated".to_owned(), RawValue::Timestamp(ts(20, 15))),
            (
                "labels".to_owned(),
                RawValue::List(vec!["backend".into(), "auth".into()]),
            ),
            (
                "components".to_owned(),
                RawValue::List(vec!["api".into(), "web".into()]),
            ),
        ]);
        SourceRecord {
            key: key.to_owned(),
            fields,
            parent_key: None,
            status_changed_at: Some(ts(12, 9)),
            latest_comment: None,
            comments_error: None,
        }
    }

    fn ctx<'a>(catalog: &'a ColumnCatalog, previous: Option<&'a StoredRecord>) -> MapContext<'a> {
        MapContext {
            previous,
            parent: ParentLink::NotApplicable,
            catalog,
        }
    }

    #[test]
    fn maps_required_and_optional_fields() {
        let catalog = catalog();
        let mapped = map_record(&source("PROJ-1"), &mapping(), &ctx(&catalog, None)).unwrap();
        let fields = &mapped.record.fields;

        assert_eq!(mapped.record.key, "PROJ-1");
        assert_eq!(fields["fldKey"], FieldValue::Text("PROJ-1".into()));
        assert_eq!(fields["fldDesc"], FieldValue::Text(String::new()));
        assert_eq!(fields["fldUpdated"], FieldValue::Timestamp(ts(20, 15)));
        assert_eq!(
            fields["fldLabels"],
            FieldValue::List(vec!["backend".into(), "auth".into()])
        );
        assert_eq!(fields["fldComponents"], FieldValue::Text("api, web".into()));
        // Optional fields the issue does not carry clear their columns.
        assert_eq!(fields["fldPoints"], FieldValue::Null);
        assert_eq!(fields["fldParent"], FieldValue::Null);
        assert_eq!(fields["fldComment"], FieldValue::Null);
        assert!(mapped.deferred_parent.is_none());
    }

    #[test]
    fn missing_required_field_names_the_field() {
        let catalog = catalog();
        let mut record = source("PROJ-3");
        record.fields.remove("summary");

        let err = map_record(&record, &mapping(), &ctx(&catalog, None)).unwrap_err();
        match err {
            MirrorError::RequiredFieldMissing { key, field } => {
                assert_eq!(key, "PROJ-3");
                assert_eq!(field, "summary");
            }
            other => panic!("expected RequiredFieldMissing, got {other:?}"),
        }
    }

    #[test]
    fn resolved_parent_becomes_link() {
        let catalog = catalog();
        let mut record = source("PROJ-2");
        record.parent_key = Some("PROJ-1".into());
        let context = MapContext {
            parent: ParentLink::Resolved("recParent".into()),
            ..ctx(&catalog, None)
        };

        let mapped = map_record(&record, &mapping(), &context).unwrap();
        assert_eq!(
            mapped.record.fields["fldParent"],
            FieldValue::Links(vec!["recParent".into()])
        );
    }

    #[test]
    fn unresolved_parent_is_deferred_not_fatal() {
        let catalog = catalog();
        let mut record = source("PROJ-2");
        record.parent_key = Some("PROJ-1".into());
        let context = MapContext {
            parent: ParentLink::Unresolved,
            ..ctx(&catalog, None)
        };

        let mapped = map_record(&record, &mapping(), &context).unwrap();
        assert_eq!(mapped.record.fields["fldParent"], FieldValue::Null);
        assert_eq!(mapped.deferred_parent.as_deref(), Some("PROJ-1"));
    }

    #[test]
    fn parent_in_text_column_is_the_key() {
        let catalog = ColumnCatalog::new(vec![ColumnInfo::new(
            "fldParent",
            "Parent Key",
            ColumnKind::Text,
        )]);
        let mut record = source("PROJ-2");
        record.parent_key = Some("PROJ-1".into());
        let context = MapContext {
            parent: ParentLink::Unresolved,
            ..ctx(&catalog, None)
        };

        let mapped = map_record(&record, &mapping(), &context).unwrap();
        assert_eq!(mapped.record.fields["fldParent"], FieldValue::Text("PROJ-1".into()));
        assert!(mapped.deferred_parent.is_none());
    }

    #[test]
    fn latest_comment_fields() {
        let catalog = catalog();
        let mut record = source("PROJ-1");
        record.latest_comment = Some(Comment {
            body: "Deployed to staging".into(),
            author: Some("Sam".into()),
            created: ts(21, 8),
            updated: ts(21, 9),
        });

        let mapped = map_record(&record, &mapping(), &ctx(&catalog, None)).unwrap();
        let fields = &mapped.record.fields;
        assert_eq!(fields["fldComment"], FieldValue::Text("Deployed to staging".into()));
        assert_eq!(fields["fldCommentAuthor"], FieldValue::Text("Sam".into()));
        assert_eq!(fields["fldCommentUpdated"], FieldValue::Timestamp(ts(21, 9)));
    }

    #[test]
    fn status_timestamp_kept_while_status_unchanged() {
        let catalog = catalog();
        let previous = StoredRecord {
            record_id: "rec1".into(),
            fields: json!({
                "fldStatus": "In Progress",
                "fldStatusUpdated": "2026-02-11T07:00:00.000Z"
            })
            .as_object()
            .cloned()
            .unwrap(),
        };

        let mapped =
            map_record(&source("PROJ-1"), &mapping(), &ctx(&catalog, Some(&previous))).unwrap();
        assert_eq!(
            mapped.record.fields["fldStatusUpdated"],
            FieldValue::Timestamp(ts(11, 7))
        );
    }

    #[test]
    fn status_timestamp_follows_transition_when_status_changes() {
        let catalog = catalog();
        let previous = StoredRecord {
            record_id: "rec1".into(),
            fields: json!({
                "fldStatus": "Open",
                "fldStatusUpdated": "2026-02-11T07:00:00.000Z"
            })
            .as_object()
            .cloned()
            .unwrap(),
        };

        let mapped =
            map_record(&source("PROJ-1"), &mapping(), &ctx(&catalog, Some(&previous))).unwrap();
        assert_eq!(
            mapped.record.fields["fldStatusUpdated"],
            FieldValue::Timestamp(ts(12, 9))
        );

        let mut no_history = source("PROJ-1");
        no_history.status_changed_at = None;
        let mapped =
            map_record(&no_history, &mapping(), &ctx(&catalog, Some(&previous))).unwrap();
        assert_eq!(
            mapped.record.fields["fldStatusUpdated"],
            FieldValue::Timestamp(ts(20, 15))
        );
    }

    #[test]
    fn mapping_is_deterministic() {
        let catalog = catalog();
        let a = map_record(&source("PROJ-9"), &mapping(), &ctx(&catalog, None)).unwrap();
        let b = map_record(&source("PROJ-9"), &mapping(), &ctx(&catalog, None)).unwrap();
        assert_eq!(a, b);
    }
}
