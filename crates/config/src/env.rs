use std::time::Duration;

use mirror_common::error::{MirrorError, MirrorResult};
use mirror_common::retry::RetryPolicy;

use crate::mapping::FieldMapping;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const DEFAULT_INTERVAL_MINUTES: u64 = 60;
pub const DEFAULT_AIRTABLE_API_URL: &str = "https://api.airtable.com";

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub server: String,
    pub username: String,
    pub api_token: String,
    pub project_key: Option<String>,
    pub jql_filter: Option<String>,
}

impl SourceConfig {
    /// Base filter for every change query: the explicit JQL filter when set,
    /// otherwise `project = "KEY"`.
    pub fn base_query(&self) -> String {
        match (&self.jql_filter, &self.project_key) {
            (Some(jql), _) => jql.clone(),
            (None, Some(key)) => format!("project = \"{}\"", escape_jql_value(key)),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DestinationConfig {
    Airtable {
        api_key: String,
        base_id: String,
        table_name: String,
        api_url: String,
    },
    Postgres {
        database_url: String,
        table: String,
    },
}

impl DestinationConfig {
    /// Name of the table the single-flight guard is scoped to.
    pub fn table(&self) -> &str {
        match self {
            Self::Airtable { table_name, .. } => table_name,
            Self::Postgres { table, .. } => table,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Airtable { .. } => "airtable",
            Self::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub page_size: u32,
    pub max_results: Option<usize>,
    pub interval: Duration,
    pub lookback: Option<chrono::Duration>,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            max_results: None,
            interval: Duration::from_secs(DEFAULT_INTERVAL_MINUTES * 60),
            lookback: None,
            retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub mapping: FieldMapping,
    pub sync: SyncSettings,
    pub log_level: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads required vars.
    pub fn from_env() -> MirrorResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// All missing required variables are collected into one error so an operator
    /// can fix them in a single pass.
    pub fn from_lookup<F>(lookup: F) -> MirrorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars::new(&lookup);

        let server = vars.required("JIRA_SERVER");
        let username = vars.required("JIRA_USERNAME");
        let api_token = vars.required("JIRA_API_TOKEN");
        let project_key = vars.optional("JIRA_PROJECT_KEY");
        let jql_filter = vars.optional("JIRA_JQL_FILTER");
        let raw_mapping = vars.required("JIRA_TO_AIRTABLE_FIELD_MAP");

        let destination_kind = vars
            .optional("DESTINATION")
            .unwrap_or_else(|| "airtable".to_owned())
            .to_ascii_lowercase();
        let destination = match destination_kind.as_str() {
            "airtable" => Some(DestinationConfig::Airtable {
                api_key: vars.required("AIRTABLE_API_KEY"),
                base_id: vars.required("AIRTABLE_BASE_ID"),
                table_name: vars.required("AIRTABLE_TABLE_NAME"),
                api_url: vars
                    .optional("AIRTABLE_API_URL")
                    .unwrap_or_else(|| DEFAULT_AIRTABLE_API_URL.to_owned()),
            }),
            "postgres" => Some(DestinationConfig::Postgres {
                database_url: vars.required("DATABASE_URL"),
                table: vars.required("DESTINATION_TABLE"),
            }),
            other => {
                vars.problem(format!(
                    "DESTINATION must be `airtable` or `postgres`, got `{other}`"
                ));
                None
            }
        };

        if project_key.is_none() && jql_filter.is_none() {
            vars.problem("either JIRA_PROJECT_KEY or JIRA_JQL_FILTER must be set".to_owned());
        }

        let batch_size = vars.parsed("BATCH_SIZE", DEFAULT_BATCH_SIZE);
        let page_size = vars.parsed("PAGE_SIZE", DEFAULT_PAGE_SIZE);
        let max_results = vars.parsed_optional::<usize>("MAX_RESULTS");
        let interval_minutes = vars.parsed("SYNC_INTERVAL_MINUTES", DEFAULT_INTERVAL_MINUTES);
        let lookback_days = vars.parsed_optional::<i64>("SYNC_LOOKBACK_DAYS");
        let max_retries = vars.parsed("MAX_RETRIES", 3u32);
        let base_delay_ms = vars.parsed("RETRY_BASE_DELAY_MS", 1000u64);
        let max_delay_secs = vars.parsed("RETRY_MAX_DELAY_SECS", 30u64);
        let timeout_secs = vars.parsed("HTTP_TIMEOUT_SECS", 30u64);

        if batch_size == 0 {
            vars.problem("BATCH_SIZE must be at least 1".to_owned());
        }
        if page_size == 0 {
            vars.problem("PAGE_SIZE must be at least 1".to_owned());
        }
        if interval_minutes == 0 {
            vars.problem("SYNC_INTERVAL_MINUTES must be at least 1".to_owned());
        }
        if matches!(lookback_days, Some(days) if days <= 0) {
            vars.problem("SYNC_LOOKBACK_DAYS must be positive".to_owned());
        }

        vars.finish()?;

        let mapping = FieldMapping::from_json(&raw_mapping)?;
        let destination = destination.ok_or_else(|| {
            MirrorError::ConfigurationInvalid("no destination configured".to_owned())
        })?;

        Ok(Self {
            source: SourceConfig {
                server: server.trim_end_matches('/').to_owned(),
                username,
                api_token,
                project_key,
                jql_filter,
            },
            destination,
            mapping,
            sync: SyncSettings {
                batch_size,
                page_size,
                max_results,
                interval: Duration::from_secs(interval_minutes * 60),
                lookback: lookback_days.map(chrono::Duration::days),
                retry: RetryPolicy::new(
                    max_retries,
                    Duration::from_millis(base_delay_ms),
                    Duration::from_secs(max_delay_secs),
                ),
                http_timeout: Duration::from_secs(timeout_secs),
            },
            log_level: vars.optional("LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
        })
    }
}

/// Escape a value for use inside a double-quoted JQL string.
pub fn escape_jql_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Collects every configuration problem instead of stopping at the first one.
struct Vars<'a, F> {
    lookup: &'a F,
    problems: std::cell::RefCell<Vec<String>>,
}

impl<'a, F> Vars<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(lookup: &'a F) -> Self {
        Self {
            lookup,
            problems: std::cell::RefCell::new(Vec::new()),
        }
    }

    /// Reads a variable, dropping a trailing `# comment` and surrounding whitespace.
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|raw| strip_inline_comment(&raw).to_owned())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> String {
        self.optional(key).unwrap_or_else(|| {
            self.problem(format!("{key} is required but not set"));
            String::new()
        })
    }

    fn parsed<T>(&self, key: &str, default: T) -> T
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.parsed_optional(key).unwrap_or(default)
    }

    fn parsed_optional<T>(&self, key: &str) -> Option<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.optional(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                self.problem(format!("invalid {key} `{raw}`: {e}"));
                None
            }
        }
    }

    fn problem(&self, message: String) {
        self.problems.borrow_mut().push(message);
    }

    fn finish(&self) -> MirrorResult<()> {
        let problems = self.problems.borrow();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(MirrorError::ConfigurationInvalid(problems.join("; ")))
        }
    }
}

fn strip_inline_comment(raw: &str) -> &str {
    // JSON values may legitimately contain '#', so only strip "<space>#".
    match raw.find(" #") {
        Some(idx) if !raw.trim_start().starts_with('{') => raw[..idx].trim(),
        _ => raw.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const MAPPING: &str = r#"{"key":"fldKey","summary":"fldSummary","description":"fldDesc",
        "status":"fldStatus","created":"fldCreated","updated":"fldUpdated"}"#;

    fn base_vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("JIRA_SERVER", "https://example.atlassian.net/".to_owned()),
            ("JIRA_USERNAME", "bot@example.com".to_owned()),
            ("JIRA_API_TOKEN", "secret".to_owned()),
            ("JIRA_PROJECT_KEY", "PROJ".to_owned()),
            ("JIRA_TO_AIRTABLE_FIELD_MAP", MAPPING.to_owned()),
            ("AIRTABLE_API_KEY", "pat123".to_owned()),
            ("AIRTABLE_BASE_ID", "appBase".to_owned()),
            ("AIRTABLE_TABLE_NAME", "Issues".to_owned()),
        ])
    }

    fn load(vars: &HashMap<&'static str, String>) -> MirrorResult<AppConfig> {
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        let cfg = load(&base_vars()).expect("should parse config");
        assert_eq!(cfg.source.server, "https://example.atlassian.net");
        assert_eq!(cfg.sync.batch_size, 50);
        assert_eq!(cfg.sync.page_size, 50);
        assert_eq!(cfg.sync.max_results, None);
        assert_eq!(cfg.sync.interval, Duration::from_secs(3600));
        assert_eq!(cfg.sync.retry.max_retries, 3);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.destination.kind(), "airtable");
        assert_eq!(cfg.destination.table(), "Issues");
        match &cfg.destination {
            DestinationConfig::Airtable { api_url, .. } => {
                assert_eq!(api_url, DEFAULT_AIRTABLE_API_URL)
            }
            other => panic!("unexpected destination {other:?}"),
        }
    }

    #[test]
    fn missing_vars_are_reported_together() {
        let mut vars = base_vars();
        vars.remove("JIRA_API_TOKEN");
        vars.remove("AIRTABLE_BASE_ID");
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("JIRA_API_TOKEN"), "got: {err}");
        assert!(err.contains("AIRTABLE_BASE_ID"), "got: {err}");
    }

    #[test]
    fn interval_tolerates_trailing_comment() {
        let mut vars = base_vars();
        vars.insert("SYNC_INTERVAL_MINUTES", "15  # every quarter hour".to_owned());
        let cfg = load(&vars).unwrap();
        assert_eq!(cfg.sync.interval, Duration::from_secs(15 * 60));
    }

    #[test]
    fn invalid_number_is_configuration_invalid() {
        let mut vars = base_vars();
        vars.insert("BATCH_SIZE", "lots".to_owned());
        let err = load(&vars).unwrap_err();
        assert!(matches!(err, MirrorError::ConfigurationInvalid(_)));
        assert!(err.to_string().contains("BATCH_SIZE"));
    }

    #[test]
    fn postgres_destination_requires_database_url() {
        let mut vars = base_vars();
        vars.insert("DESTINATION", "postgres".to_owned());
        vars.insert("DESTINATION_TABLE", "issues".to_owned());
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("DATABASE_URL"), "got: {err}");

        vars.insert("DATABASE_URL", "postgres://localhost/mirror".to_owned());
        let cfg = load(&vars).unwrap();
        assert_eq!(cfg.destination.kind(), "postgres");
        assert_eq!(cfg.destination.table(), "issues");
    }

    #[test]
    fn base_query_prefers_explicit_filter() {
        let mut vars = base_vars();
        let cfg = load(&vars).unwrap();
        assert_eq!(cfg.source.base_query(), "project = \"PROJ\"");

        vars.insert("JIRA_JQL_FILTER", "project = PROJ AND type = Bug".to_owned());
        let cfg = load(&vars).unwrap();
        assert_eq!(cfg.source.base_query(), "project = PROJ AND type = Bug");
    }

    #[test]
    fn project_key_is_escaped() {
        assert_eq!(escape_jql_value(r#"A"B\C"#), r#"A\"B\\C"#);
    }

    #[test]
    fn from_env_reads_process_environment() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");

        for (key, value) in base_vars() {
            env::set_var(key, value);
        }
        env::set_var("MAX_RESULTS", "200");

        let cfg = AppConfig::from_env().expect("should parse config");
        assert_eq!(cfg.sync.max_results, Some(200));

        for key in base_vars().keys() {
            env::remove_var(key);
        }
        env::remove_var("MAX_RESULTS");
    }
}
