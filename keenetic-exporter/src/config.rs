//! Configuration for the Keenetic exporter.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Failed to load environment file: {0}")]
    Env(#[from] dotenvy::Error),
}

/// Load `KEY=value` lines from an environment file into the process
/// environment. Variables already set are left alone.
///
/// Returns `false` when the file does not exist.
pub fn load_env_file<P: AsRef<Path>>(path: P) -> Result<bool, ConfigError> {
    match dotenvy::from_path(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Router connection settings.
    #[serde(default)]
    pub router: RouterConfig,

    /// Cookie session persistence.
    #[serde(default)]
    pub session: SessionConfig,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Polling and series retention settings.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Metric filtering settings.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metric groups keyed by group name. One API call per group.
    #[serde(default)]
    pub groups: BTreeMap<String, MetricGroupConfig>,
}

/// Router admin API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Base URL of the admin API (default: "http://192.168.1.1").
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Skip the challenge/response handshake.
    #[serde(default)]
    pub skip_auth: bool,

    /// Per-request timeout in seconds (default: 10).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    "http://192.168.1.1".to_string()
}

fn default_timeout() -> u64 {
    10
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            username: String::new(),
            password: String::new(),
            skip_auth: false,
            timeout_secs: default_timeout(),
        }
    }
}

/// Where the cookie session is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session file path. `null` keeps the session in memory only.
    #[serde(default = "default_session_path")]
    pub path: Option<PathBuf>,
}

fn default_session_path() -> Option<PathBuf> {
    Some(PathBuf::from(".cookies.json"))
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path: default_session_path(),
        }
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:9991").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Default labels to add to all metrics.
    #[serde(default)]
    pub default_labels: HashMap<String, String>,

    /// Metric name prefix (default: "keenetic").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_listen() -> String {
    "0.0.0.0:9991".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "keenetic".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            default_labels: HashMap::new(),
            prefix: default_prefix(),
        }
    }
}

/// Polling cadence and series retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between collection cycles.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// How long to keep series without updates before expiring (seconds).
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,

    /// Maximum unique time series (memory protection).
    #[serde(default = "default_max_series")]
    pub max_series: usize,
}

fn default_interval() -> u64 {
    30
}

fn default_stale_timeout() -> u64 {
    300 // 5 minutes
}

fn default_max_series() -> usize {
    100_000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            stale_timeout_secs: default_stale_timeout(),
            max_series: default_max_series(),
        }
    }
}

/// Metric filtering configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Glob patterns for metric names to include (empty = all).
    #[serde(default)]
    pub include_metrics: Vec<String>,

    /// Glob patterns for metric names to exclude.
    #[serde(default)]
    pub exclude_metrics: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// One API call and the metrics read from its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricGroupConfig {
    /// RCI show command, e.g. `"ip hotspot"`.
    pub path: String,

    /// Query parameters sent with the request.
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,

    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
}

/// How a single metric is read from a group's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: MetricKind,

    #[serde(default)]
    pub help: String,

    /// Dotted path to the value, relative to the document or to each selected item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    /// Selector picking an array of items, one series per item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_selector: Option<String>,

    /// Dotted paths read from each selected item as labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    /// Derived value, e.g. `length(host[?active===true])`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculate: Option<String>,
}

/// Prometheus metric kind of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    /// Get the TYPE comment string for Prometheus exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

/// Query parameter value. Numbers are sent in their decimal form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = &self.router.endpoint;
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "Router endpoint must be an http(s) URL: {}",
                endpoint
            )));
        }

        if self.router.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        if self.polling.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "interval_secs must be > 0".to_string(),
            ));
        }

        if self.polling.stale_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "stale_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.polling.max_series == 0 {
            return Err(ConfigError::Validation(
                "max_series must be > 0".to_string(),
            ));
        }

        // Validate listen address format
        if self
            .prometheus
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        // Validate path starts with /
        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.prometheus.prefix.is_empty() {
            return Err(ConfigError::Validation(
                "Metric prefix must not be empty".to_string(),
            ));
        }

        for (group_name, group) in &self.groups {
            if group.metrics.iter().any(|m| m.name.is_empty()) {
                return Err(ConfigError::Validation(format!(
                    "Metric in group '{}' has an empty name",
                    group_name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = ExporterConfig::parse("{}").unwrap();

        assert_eq!(config.router.endpoint, "http://192.168.1.1");
        assert!(!config.router.skip_auth);
        assert_eq!(config.session.path, Some(PathBuf::from(".cookies.json")));
        assert_eq!(config.prometheus.listen, "0.0.0.0:9991");
        assert_eq!(config.prometheus.path, "/metrics");
        assert_eq!(config.prometheus.prefix, "keenetic");
        assert_eq!(config.polling.interval_secs, 30);
        assert_eq!(config.polling.max_series, 100_000);
        assert!(config.groups.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            router: {
                endpoint: "https://my.keenetic.net",
                username: "admin",
                password: "secret",
                timeout_secs: 5
            },
            session: { path: null },
            prometheus: {
                listen: "127.0.0.1:9100",
                prefix: "router",
                default_labels: { site: "home" }
            },
            polling: { interval_secs: 15 },
            filters: { exclude_metrics: ["*_debug"] },
            logging: { level: "debug", format: "json" },
            groups: {
                hotspot: {
                    path: "ip hotspot",
                    params: { detail: 1, name: "Home" },
                    metrics: [
                        {
                            name: "host_rxbytes",
                            type: "counter",
                            help: "Bytes received per host",
                            field: "rxbytes",
                            array_selector: "host[?active===true]",
                            labels: ["mac", "name"]
                        },
                        {
                            name: "active_hosts",
                            type: "gauge",
                            help: "Active hosts",
                            calculate: "length(host[?active===true])"
                        }
                    ]
                }
            }
        }"#;

        let config = ExporterConfig::parse(json).unwrap();

        assert_eq!(config.router.endpoint, "https://my.keenetic.net");
        assert_eq!(config.router.username, "admin");
        assert_eq!(config.router.timeout_secs, 5);
        assert_eq!(config.session.path, None);
        assert_eq!(config.prometheus.prefix, "router");
        assert_eq!(
            config.prometheus.default_labels.get("site"),
            Some(&"home".to_string())
        );
        assert_eq!(config.polling.interval_secs, 15);
        assert_eq!(config.filters.exclude_metrics, vec!["*_debug"]);
        assert_eq!(config.logging.format, LogFormat::Json);

        let group = &config.groups["hotspot"];
        assert_eq!(group.path, "ip hotspot");
        assert_eq!(group.params["detail"].to_string(), "1");
        assert_eq!(group.params["name"], ParamValue::Text("Home".to_string()));
        assert_eq!(group.metrics.len(), 2);

        let rx = &group.metrics[0];
        assert_eq!(rx.kind, MetricKind::Counter);
        assert_eq!(rx.field.as_deref(), Some("rxbytes"));
        assert_eq!(rx.array_selector.as_deref(), Some("host[?active===true]"));
        assert_eq!(rx.labels, vec!["mac", "name"]);

        let active = &group.metrics[1];
        assert_eq!(active.kind, MetricKind::Gauge);
        assert_eq!(
            active.calculate.as_deref(),
            Some("length(host[?active===true])")
        );
        assert!(active.labels.is_empty());
    }

    #[test]
    fn test_bundled_config_is_valid() {
        let config =
            ExporterConfig::parse(include_str!("../../config/metrics.json5")).unwrap();

        assert_eq!(config.session.path, Some(PathBuf::from(".cookies.json")));
        assert_eq!(
            config.groups.keys().collect::<Vec<_>>(),
            vec!["hotspot", "system", "wan"]
        );
        assert_eq!(config.groups["wan"].path, "interface stat");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json5");
        std::fs::write(&path, "{ polling: { interval_secs: 60 } } // trailing comment").unwrap();

        let config = ExporterConfig::load_from_file(&path).unwrap();
        assert_eq!(config.polling.interval_secs, 60);

        assert!(matches!(
            ExporterConfig::load_from_file(dir.path().join("missing.json5")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_load_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "KEENETIC_EXPORTER_TEST_HOST=http://10.0.0.1\n# comment\nKEENETIC_EXPORTER_TEST_USER=\"admin\"\n",
        )
        .unwrap();

        assert!(load_env_file(&path).unwrap());
        assert_eq!(
            std::env::var("KEENETIC_EXPORTER_TEST_HOST").as_deref(),
            Ok("http://10.0.0.1")
        );
        assert_eq!(
            std::env::var("KEENETIC_EXPORTER_TEST_USER").as_deref(),
            Ok("admin")
        );

        assert!(!load_env_file(dir.path().join("missing.env")).unwrap());
    }

    #[test]
    fn test_param_value_display() {
        assert_eq!(ParamValue::Integer(5).to_string(), "5");
        assert_eq!(ParamValue::Float(1.5).to_string(), "1.5");
        assert_eq!(ParamValue::Bool(true).to_string(), "true");
        assert_eq!(ParamValue::Text("a b".into()).to_string(), "a b");
    }

    #[test]
    fn test_validate_invalid_endpoint() {
        let result = ExporterConfig::parse(r#"{ router: { endpoint: "192.168.1.1" } }"#);
        assert!(result.unwrap_err().to_string().contains("http(s) URL"));
    }

    #[test]
    fn test_validate_invalid_listen() {
        let json = r#"{
            prometheus: { listen: "not-an-address" }
        }"#;

        let result = ExporterConfig::parse(json);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid listen address")
        );
    }

    #[test]
    fn test_validate_invalid_path() {
        let json = r#"{
            prometheus: { path: "no-leading-slash" }
        }"#;

        let result = ExporterConfig::parse(json);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("must start with /")
        );
    }

    #[test]
    fn test_validate_zero_interval() {
        let result = ExporterConfig::parse("{ polling: { interval_secs: 0 } }");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_empty_metric_name() {
        let json = r#"{
            groups: {
                system: { path: "system", metrics: [{ name: "", type: "gauge", field: "cpuload" }] }
            }
        }"#;

        let result = ExporterConfig::parse(json);
        assert!(result.unwrap_err().to_string().contains("empty name"));
    }

    #[test]
    fn test_unknown_metric_type_rejected() {
        let json = r#"{
            groups: {
                system: { path: "system", metrics: [{ name: "x", type: "histogram" }] }
            }
        }"#;

        assert!(matches!(
            ExporterConfig::parse(json),
            Err(ConfigError::Parse(_))
        ));
    }
}
