use crate::error::ConfigError;
use crate::format::csv_delimiter;
use crate::record::Destination;
use crate::retry::RetryPolicy;
use crate::trigger::{
    BatchThresholds, DEFAULT_BATCH_INTERVAL, DEFAULT_BATCH_MAX_BYTES, DEFAULT_BATCH_MAX_ROWS,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_USERNAME: &str = "root";
pub const DEFAULT_LABEL_PREFIX: &str = "stream_load";
pub const DEFAULT_COLUMN_SEPARATOR: &str = ",";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER_MS: u64 = 100;
pub const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_MAX_RETRY_BACKOFF_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Option keys lifted out of `stream_load_props` into typed fields.
const FORMAT_PROP: &str = "format";
const COLUMN_SEPARATOR_PROP: &str = "column_separator";

// Environment variables read by [`SinkConfig::from_env`].

/// Comma-separated node list, e.g. `fe1:8030,fe2:8030`.
pub const STREAM_LOAD_NODE_URLS_ENV: &str = "STREAM_LOAD_NODE_URLS";
pub const STREAM_LOAD_USERNAME_ENV: &str = "STREAM_LOAD_USERNAME";
pub const STREAM_LOAD_PASSWORD_ENV: &str = "STREAM_LOAD_PASSWORD";
pub const STREAM_LOAD_DATABASE_ENV: &str = "STREAM_LOAD_DATABASE";
pub const STREAM_LOAD_TABLE_ENV: &str = "STREAM_LOAD_TABLE";
pub const STREAM_LOAD_LABEL_PREFIX_ENV: &str = "STREAM_LOAD_LABEL_PREFIX";
pub const STREAM_LOAD_WRITER_ID_ENV: &str = "STREAM_LOAD_WRITER_ID";
pub const STREAM_LOAD_FORMAT_ENV: &str = "STREAM_LOAD_FORMAT";
pub const STREAM_LOAD_COLUMN_SEPARATOR_ENV: &str = "STREAM_LOAD_COLUMN_SEPARATOR";
pub const STREAM_LOAD_BATCH_MAX_ROWS_ENV: &str = "STREAM_LOAD_BATCH_MAX_ROWS";
pub const STREAM_LOAD_BATCH_MAX_BYTES_ENV: &str = "STREAM_LOAD_BATCH_MAX_BYTES";
pub const STREAM_LOAD_BATCH_INTERVAL_MS_ENV: &str = "STREAM_LOAD_BATCH_INTERVAL_MS";
pub const STREAM_LOAD_MAX_RETRIES_ENV: &str = "STREAM_LOAD_MAX_RETRIES";
pub const STREAM_LOAD_RETRY_BACKOFF_MULTIPLIER_MS_ENV: &str = "STREAM_LOAD_RETRY_BACKOFF_MULTIPLIER_MS";
pub const STREAM_LOAD_MAX_RETRY_BACKOFF_MS_ENV: &str = "STREAM_LOAD_MAX_RETRY_BACKOFF_MS";
pub const STREAM_LOAD_TWO_PHASE_COMMIT_ENV: &str = "STREAM_LOAD_TWO_PHASE_COMMIT";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Wire format of a load payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum LoadFormat {
    #[default]
    Csv,
    Json,
}

impl LoadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadFormat::Csv => "csv",
            LoadFormat::Json => "json",
        }
    }
}

impl FromStr for LoadFormat {
    type Err = ConfigError;

    /// Case-insensitive; anything other than CSV or JSON is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(LoadFormat::Csv),
            "json" => Ok(LoadFormat::Json),
            _ => Err(ConfigError::UnknownFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for LoadFormat {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for LoadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

fn default_label_prefix() -> String {
    DEFAULT_LABEL_PREFIX.to_string()
}

fn default_column_separator() -> String {
    DEFAULT_COLUMN_SEPARATOR.to_string()
}

fn default_batch_max_rows() -> usize {
    DEFAULT_BATCH_MAX_ROWS
}

fn default_batch_max_bytes() -> u64 {
    DEFAULT_BATCH_MAX_BYTES
}

fn default_batch_interval_ms() -> u64 {
    DEFAULT_BATCH_INTERVAL.as_millis() as u64
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_backoff_multiplier_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MULTIPLIER_MS
}

fn default_retry_backoff_factor() -> f64 {
    DEFAULT_RETRY_BACKOFF_FACTOR
}

fn default_max_retry_backoff_ms() -> u64 {
    DEFAULT_MAX_RETRY_BACKOFF_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

/// Configuration of a stream-load sink.
///
/// Build it with [`SinkConfig::new`] and the `with_*` setters, deserialize
/// it with serde, or read it from the environment with
/// [`SinkConfig::from_env`]. It is checked once by
/// [`SinkConfig::validated`] when the controller opens and is read-only
/// afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SinkConfig {
    /// Frontend nodes, `host:port` or full `http(s)://host:port` URLs.
    #[serde(alias = "nodeUrls")]
    pub node_urls: Vec<String>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    pub table: String,
    #[serde(default = "default_label_prefix", alias = "labelPrefix")]
    pub label_prefix: String,
    /// Index of this writer among the parallel writers of one job. Part of
    /// every label, so writers opened at the same instant never collide.
    #[serde(default, alias = "subtaskIndex")]
    pub writer_id: u32,
    #[serde(default)]
    pub format: LoadFormat,
    /// Field separator for CSV loads. Ignored for JSON.
    #[serde(default = "default_column_separator")]
    pub column_separator: String,

    #[serde(default = "default_batch_max_rows")]
    pub batch_max_rows: usize,
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: u64,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// Retries after the first failed attempt. `0` disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_retry_backoff_multiplier_ms")]
    pub retry_backoff_multiplier_ms: u64,
    /// Growth of the delay between consecutive retries; `1.0` keeps it constant.
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    /// Load through prepared transactions committed by the engine.
    #[serde(default)]
    pub two_phase_commit: bool,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Extra load options forwarded verbatim to the transport.
    #[serde(default, alias = "doris.config")]
    pub stream_load_props: BTreeMap<String, String>,
}

impl SinkConfig {
    pub fn new(
        node_urls: Vec<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        SinkConfig {
            node_urls,
            username: default_username(),
            password: String::new(),
            database: database.into(),
            table: table.into(),
            label_prefix: default_label_prefix(),
            writer_id: 0,
            format: LoadFormat::default(),
            column_separator: default_column_separator(),
            batch_max_rows: DEFAULT_BATCH_MAX_ROWS,
            batch_max_bytes: DEFAULT_BATCH_MAX_BYTES,
            batch_interval_ms: default_batch_interval_ms(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_multiplier_ms: DEFAULT_RETRY_BACKOFF_MULTIPLIER_MS,
            retry_backoff_factor: DEFAULT_RETRY_BACKOFF_FACTOR,
            max_retry_backoff_ms: DEFAULT_MAX_RETRY_BACKOFF_MS,
            two_phase_commit: false,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            stream_load_props: BTreeMap::new(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.label_prefix = prefix.into();
        self
    }

    pub fn with_writer_id(mut self, writer_id: u32) -> Self {
        self.writer_id = writer_id;
        self
    }

    pub fn with_format(mut self, format: LoadFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_column_separator(mut self, separator: impl Into<String>) -> Self {
        self.column_separator = separator.into();
        self
    }

    pub fn with_batch_limits(mut self, max_rows: usize, max_bytes: u64, interval_ms: u64) -> Self {
        self.batch_max_rows = max_rows;
        self.batch_max_bytes = max_bytes;
        self.batch_interval_ms = interval_ms;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_multiplier_ms: u64, max_backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_multiplier_ms = backoff_multiplier_ms;
        self.max_retry_backoff_ms = max_backoff_ms;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.retry_backoff_factor = factor;
        self
    }

    pub fn with_two_phase_commit(mut self, enabled: bool) -> Self {
        self.two_phase_commit = enabled;
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.stream_load_props.insert(key.into(), value.into());
        self
    }

    /// Build a configuration from `STREAM_LOAD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup using the `STREAM_LOAD_*` names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let nodes = lookup(STREAM_LOAD_NODE_URLS_ENV).ok_or(ConfigError::Missing("node_urls"))?;
        let database = lookup(STREAM_LOAD_DATABASE_ENV).ok_or(ConfigError::Missing("database"))?;
        let table = lookup(STREAM_LOAD_TABLE_ENV).ok_or(ConfigError::Missing("table"))?;

        let node_urls = nodes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let mut config = SinkConfig::new(node_urls, database, table);

        if let Some(v) = lookup(STREAM_LOAD_USERNAME_ENV) {
            config.username = v;
        }
        if let Some(v) = lookup(STREAM_LOAD_PASSWORD_ENV) {
            config.password = v;
        }
        if let Some(v) = lookup(STREAM_LOAD_LABEL_PREFIX_ENV) {
            config.label_prefix = v;
        }
        if let Some(v) = parse_env(&lookup, STREAM_LOAD_WRITER_ID_ENV)? {
            config.writer_id = v;
        }
        if let Some(v) = lookup(STREAM_LOAD_FORMAT_ENV) {
            config.format = v.parse()?;
        }
        if let Some(v) = lookup(STREAM_LOAD_COLUMN_SEPARATOR_ENV) {
            config.column_separator = v;
        }
        if let Some(v) = parse_env(&lookup, STREAM_LOAD_BATCH_MAX_ROWS_ENV)? {
            config.batch_max_rows = v;
        }
        if let Some(v) = parse_env(&lookup, STREAM_LOAD_BATCH_MAX_BYTES_ENV)? {
            config.batch_max_bytes = v;
        }
        if let Some(v) = parse_env(&lookup, STREAM_LOAD_BATCH_INTERVAL_MS_ENV)? {
            config.batch_interval_ms = v;
        }
        if let Some(v) = parse_env(&lookup, STREAM_LOAD_MAX_RETRIES_ENV)? {
            config.max_retries = v;
        }
        if let Some(v) = parse_env(&lookup, STREAM_LOAD_RETRY_BACKOFF_MULTIPLIER_MS_ENV)? {
            config.retry_backoff_multiplier_ms = v;
        }
        if let Some(v) = parse_env(&lookup, STREAM_LOAD_MAX_RETRY_BACKOFF_MS_ENV)? {
            config.max_retry_backoff_ms = v;
        }
        if let Some(v) = parse_env(&lookup, STREAM_LOAD_TWO_PHASE_COMMIT_ENV)? {
            config.two_phase_commit = v;
        }
        Ok(config)
    }

    /// Normalize and check the configuration.
    ///
    /// Option keys are lower-cased, and `format` / `column_separator`
    /// entries in `stream_load_props` override the typed fields and are
    /// removed from the map so they are not sent twice.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        let mut props = BTreeMap::new();
        for (key, value) in std::mem::take(&mut self.stream_load_props) {
            props.insert(key.to_ascii_lowercase(), value);
        }
        if let Some(separator) = props.remove(COLUMN_SEPARATOR_PROP) {
            self.column_separator = separator;
        }
        if let Some(format) = props.remove(FORMAT_PROP) {
            self.format = format.parse()?;
        }
        self.stream_load_props = props;

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_urls.is_empty() || self.node_urls.iter().any(|u| u.trim().is_empty()) {
            return Err(ConfigError::Missing("node_urls"));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Missing("database"));
        }
        if self.table.trim().is_empty() {
            return Err(ConfigError::Missing("table"));
        }
        if self.label_prefix.is_empty() {
            return Err(ConfigError::Missing("label_prefix"));
        }
        if self.format == LoadFormat::Csv && csv_delimiter(&self.column_separator).is_none() {
            return Err(invalid(
                "column_separator",
                "must be a single byte or a \\xHH escape for CSV loads",
            ));
        }
        if self.batch_max_rows == 0 {
            return Err(invalid("batch_max_rows", "must be greater than zero"));
        }
        if self.batch_max_bytes == 0 {
            return Err(invalid("batch_max_bytes", "must be greater than zero"));
        }
        if self.batch_interval_ms == 0 {
            return Err(invalid("batch_interval_ms", "must be greater than zero"));
        }
        if !self.retry_backoff_factor.is_finite() || self.retry_backoff_factor < 1.0 {
            return Err(invalid("retry_backoff_factor", "must be a finite number >= 1.0"));
        }
        if self.max_retry_backoff_ms < self.retry_backoff_multiplier_ms {
            return Err(invalid(
                "max_retry_backoff_ms",
                "must not be smaller than retry_backoff_multiplier_ms",
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> BatchThresholds {
        BatchThresholds {
            max_rows: self.batch_max_rows,
            max_bytes: self.batch_max_bytes,
            max_interval: Duration::from_millis(self.batch_interval_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_backoff_multiplier_ms),
            factor: self.retry_backoff_factor,
            max_delay: Duration::from_millis(self.max_retry_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The database/table pair named by this configuration.
    pub fn default_destination(&self) -> Destination {
        Destination::new(&self.database, &self.table)
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

fn parse_env<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Env {
                key,
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> SinkConfig {
        SinkConfig::new(vec!["127.0.0.1:8030".into()], "db", "t")
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = base().validated().unwrap();
        assert_eq!(cfg.batch_max_rows, 1024);
        assert_eq!(cfg.batch_max_bytes, 5_242_880);
        assert_eq!(cfg.batch_interval_ms, 1000);
        assert_eq!(cfg.format, LoadFormat::Csv);
        assert_eq!(cfg.column_separator, ",");
        assert_eq!(cfg.thresholds(), BatchThresholds::default());
    }

    #[test]
    fn test_format_parsing_is_strict() {
        assert_eq!("JSON".parse::<LoadFormat>().unwrap(), LoadFormat::Json);
        assert_eq!(" csv ".parse::<LoadFormat>().unwrap(), LoadFormat::Csv);
        assert_eq!(
            "parquet".parse::<LoadFormat>(),
            Err(ConfigError::UnknownFormat("parquet".into()))
        );
    }

    #[test]
    fn test_props_are_lowercased_and_lifted() {
        let cfg = base()
            .with_prop("FORMAT", "json")
            .with_prop("Column_Separator", "\t")
            .with_prop("Strict_Mode", "true")
            .validated()
            .unwrap();
        assert_eq!(cfg.format, LoadFormat::Json);
        assert_eq!(cfg.column_separator, "\t");
        assert_eq!(cfg.stream_load_props.len(), 1);
        assert_eq!(cfg.stream_load_props.get("strict_mode").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_unknown_format_prop_fails() {
        let err = base().with_prop("format", "orc").validated().unwrap_err();
        assert_eq!(err, ConfigError::UnknownFormat("orc".into()));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert_eq!(
            SinkConfig::new(vec![], "db", "t").validate(),
            Err(ConfigError::Missing("node_urls"))
        );
        assert_eq!(
            SinkConfig::new(vec!["n:1".into()], "", "t").validate(),
            Err(ConfigError::Missing("database"))
        );
        assert!(matches!(
            base().with_batch_limits(0, 10, 10).validate(),
            Err(ConfigError::Invalid { key: "batch_max_rows", .. })
        ));
        assert!(matches!(
            base().with_backoff_factor(0.5).validate(),
            Err(ConfigError::Invalid { key: "retry_backoff_factor", .. })
        ));
        assert!(matches!(
            base().with_retries(3, 1000, 500).validate(),
            Err(ConfigError::Invalid { key: "max_retry_backoff_ms", .. })
        ));
        assert!(matches!(
            base().with_column_separator("||").validate(),
            Err(ConfigError::Invalid { key: "column_separator", .. })
        ));
        assert!(base().with_column_separator("\\x01").validate().is_ok());
        assert!(base()
            .with_format(LoadFormat::Json)
            .with_column_separator("||")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_deserialize_with_legacy_keys() {
        let cfg: SinkConfig = serde_json::from_value(serde_json::json!({
            "nodeUrls": ["fe:8030"],
            "database": "db",
            "table": "t",
            "labelPrefix": "job",
            "subtaskIndex": 3,
            "format": "Json",
            "max_retries": 5,
            "doris.config": {"strip_outer_array": "false"}
        }))
        .unwrap();
        assert_eq!(cfg.label_prefix, "job");
        assert_eq!(cfg.writer_id, 3);
        assert_eq!(cfg.format, LoadFormat::Json);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.batch_max_rows, 1024);
        assert_eq!(cfg.stream_load_props.len(), 1);
    }

    #[test]
    fn test_deserialize_rejects_unknown_format() {
        let res: Result<SinkConfig, _> = serde_json::from_value(serde_json::json!({
            "node_urls": ["fe:8030"],
            "database": "db",
            "table": "t",
            "format": "avro"
        }));
        assert!(res.is_err());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (STREAM_LOAD_NODE_URLS_ENV, "fe1:8030, fe2:8030"),
            (STREAM_LOAD_DATABASE_ENV, "db"),
            (STREAM_LOAD_TABLE_ENV, "events"),
            (STREAM_LOAD_FORMAT_ENV, "json"),
            (STREAM_LOAD_BATCH_MAX_ROWS_ENV, "10"),
            (STREAM_LOAD_MAX_RETRIES_ENV, "0"),
            (STREAM_LOAD_WRITER_ID_ENV, "2"),
        ]);
        let cfg = SinkConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.node_urls, vec!["fe1:8030".to_string(), "fe2:8030".to_string()]);
        assert_eq!(cfg.format, LoadFormat::Json);
        assert_eq!(cfg.batch_max_rows, 10);
        assert_eq!(cfg.max_retries, 0);
        assert_eq!(cfg.writer_id, 2);

        let bad: HashMap<&str, &str> = HashMap::from([
            (STREAM_LOAD_NODE_URLS_ENV, "fe1:8030"),
            (STREAM_LOAD_DATABASE_ENV, "db"),
            (STREAM_LOAD_TABLE_ENV, "events"),
            (STREAM_LOAD_BATCH_MAX_ROWS_ENV, "many"),
        ]);
        let err = SinkConfig::from_lookup(|k| bad.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: STREAM_LOAD_BATCH_MAX_ROWS_ENV, .. }));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = base().with_retries(3, 100, 500).retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_millis(500));
    }
}
