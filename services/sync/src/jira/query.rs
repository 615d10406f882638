use chrono::Duration;
use mirror_common::time::{truncate_to_minute, Timestamp};

/// At least the largest UTC offset in use (UTC-12 to UTC+14).
const ZONE_SLACK_HOURS: i64 = 14;

/// Build the JQL for one change-set query.
///
/// Generates: `(project = "PROJ") AND updated >= "2026-02-14 20:42" ORDER BY created ASC`.
/// Jira reads the date literal in the API user's profile time zone and only resolves
/// minutes, so the bound is moved back by [`ZONE_SLACK_HOURS`] and truncated. Whatever
/// the zone, the query covers everything after `since`; callers drop issues at or before
/// `since` themselves.
pub fn build_change_jql(base_filter: &str, since: Option<Timestamp>) -> String {
    let base = base_filter.trim();
    let mut clauses = Vec::new();
    if !base.is_empty() {
        clauses.push(format!("({base})"));
    }
    if let Some(since) = since {
        clauses.push(format!(
            "updated >= \"{}\"",
            query_bound(since).format("%Y-%m-%d %H:%M")
        ));
    }
    if clauses.is_empty() {
        "ORDER BY created ASC".to_owned()
    } else {
        format!("{} ORDER BY created ASC", clauses.join(" AND "))
    }
}

/// Wall-clock value sent for `since`, early enough for any profile time zone.
fn query_bound(since: Timestamp) -> Timestamp {
    truncate_to_minute(&(since - Duration::hours(ZONE_SLACK_HOURS)))
}
