//! Series store that holds the latest samples and renders them for Prometheus.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::config::{FilterConfig, MetricKind, PollingConfig, PrometheusConfig};
use crate::extract::{CollectedMetric, MetricValues};
use crate::mapping::sanitize_label_name;
use crate::poller::CollectionReport;

/// A unique identifier for a metric time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    /// The full Prometheus metric name.
    pub name: String,
    /// Sorted label key-value pairs.
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    /// Build a key from a metric name and its sample labels.
    ///
    /// Label names are sanitized. Default labels never override sample labels,
    /// and on a name clash after sanitizing the first label wins.
    pub fn new(
        name: &str,
        labels: &[(String, String)],
        default_labels: &HashMap<String, String>,
    ) -> Self {
        let mut merged: Vec<(String, String)> =
            Vec::with_capacity(labels.len() + default_labels.len());

        let sample = labels.iter().map(|(k, v)| (sanitize_label_name(k), v));
        let defaults = default_labels
            .iter()
            .map(|(k, v)| (sanitize_label_name(k), v));

        for (key, value) in sample.chain(defaults) {
            if !merged.iter().any(|(k, _)| *k == key) {
                merged.push((key, value.clone()));
            }
        }
        merged.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            name: name.to_string(),
            labels: merged,
        }
    }

    /// Format labels for Prometheus exposition format.
    pub fn format_labels(&self) -> String {
        if self.labels.is_empty() {
            return String::new();
        }

        let parts: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
            .collect();

        format!("{{{}}}", parts.join(","))
    }
}

/// A stored sample with metadata.
#[derive(Debug, Clone)]
pub struct StoredMetric {
    pub key: SeriesKey,
    pub kind: MetricKind,
    pub help: String,
    pub value: f64,
    /// When this series was last updated.
    pub last_updated: Instant,
}

impl StoredMetric {
    /// Check if this series is stale based on the timeout.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_updated.elapsed() > timeout
    }
}

/// Include/exclude filter on full metric names.
pub struct MetricFilter {
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
}

impl MetricFilter {
    /// Create a filter from configuration. Invalid patterns are dropped with a warning.
    pub fn new(config: &FilterConfig) -> Self {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .filter_map(|p| match glob::Pattern::new(p) {
                    Ok(pattern) => Some(pattern),
                    Err(e) => {
                        warn!(pattern = %p, error = %e, "Ignoring invalid metric pattern");
                        None
                    }
                })
                .collect::<Vec<_>>()
        };

        Self {
            include: compile(config.include_metrics.as_slice()),
            exclude: compile(config.exclude_metrics.as_slice()),
        }
    }

    /// Check if a metric name passes the filter.
    pub fn should_include(&self, name: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(name)) {
            return false;
        }
        !self.exclude.iter().any(|p| p.matches(name))
    }
}

impl Default for MetricFilter {
    fn default() -> Self {
        Self::new(&FilterConfig::default())
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Completed collection cycles.
    pub polls_total: u64,
    /// Groups that failed to fetch or parse, across all cycles.
    pub poll_errors_total: u64,
    /// Cycles in which at least one group succeeded.
    pub successful_polls: u64,
    /// Whether the most recent cycle had no failed group.
    pub last_poll_success: bool,
    /// Samples offered to the store.
    pub samples_received: u64,
    /// Samples stored.
    pub samples_accepted: u64,
    /// Samples rejected by the metric filter.
    pub samples_filtered: u64,
    /// Samples rejected because max_series was reached.
    pub samples_dropped_max_series: u64,
    /// Number of stale series removed.
    pub stale_series_removed: u64,
}

/// Thread-safe store of the latest value of every series.
pub struct MetricStore {
    series: RwLock<HashMap<SeriesKey, StoredMetric>>,
    prometheus_config: PrometheusConfig,
    polling_config: PollingConfig,
    filter: MetricFilter,
    stats: RwLock<StoreStats>,
}

/// Shareable store handle.
pub type SharedStore = Arc<MetricStore>;

impl MetricStore {
    pub fn new(
        prometheus_config: PrometheusConfig,
        polling_config: PollingConfig,
        filter_config: FilterConfig,
    ) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            prometheus_config,
            polling_config,
            filter: MetricFilter::new(&filter_config),
            stats: RwLock::new(StoreStats::default()),
        }
    }

    /// Record every sample of a collected metric.
    pub fn record(&self, metric: &CollectedMetric) {
        let samples: Vec<(&[(String, String)], f64)> = match &metric.data.values {
            MetricValues::Single(value) => vec![(&[][..], *value)],
            MetricValues::Labeled(values) => values
                .iter()
                .map(|v| (v.labels.as_slice(), v.value))
                .collect(),
        };

        {
            let mut stats = self.stats.write();
            stats.samples_received += samples.len() as u64;
        }

        if !self.filter.should_include(&metric.name) {
            let mut stats = self.stats.write();
            stats.samples_filtered += samples.len() as u64;
            trace!(metric = %metric.name, "Metric filtered out");
            return;
        }

        let mut accepted = 0u64;
        let mut dropped = 0u64;
        {
            let mut series = self.series.write();
            let now = Instant::now();

            for (labels, value) in samples {
                let key = SeriesKey::new(
                    &metric.name,
                    labels,
                    &self.prometheus_config.default_labels,
                );

                // Check if we're at max capacity and this is a new series
                if !series.contains_key(&key) && series.len() >= self.polling_config.max_series {
                    dropped += 1;
                    continue;
                }

                series.insert(
                    key.clone(),
                    StoredMetric {
                        key,
                        kind: metric.data.kind,
                        help: metric.data.help.clone(),
                        value,
                        last_updated: now,
                    },
                );
                accepted += 1;
            }
        }

        if dropped > 0 {
            warn!(
                metric = %metric.name,
                dropped,
                max_series = self.polling_config.max_series,
                "Max series limit reached, dropping new series"
            );
        }

        let mut stats = self.stats.write();
        stats.samples_accepted += accepted;
        stats.samples_dropped_max_series += dropped;
    }

    /// Record the outcome of a collection cycle.
    pub fn record_cycle(&self, report: &CollectionReport) {
        for metric in &report.metrics {
            self.record(metric);
        }

        let mut stats = self.stats.write();
        stats.polls_total += 1;
        stats.poll_errors_total += report.groups_failed as u64;
        stats.last_poll_success = report.groups_failed == 0;
        if report.groups_ok > 0 {
            stats.successful_polls += 1;
        }
    }

    /// Whether any collection cycle has produced data yet.
    pub fn is_ready(&self) -> bool {
        self.stats.read().successful_polls > 0
    }

    /// Remove stale series.
    pub fn cleanup_stale(&self) -> usize {
        let timeout = Duration::from_secs(self.polling_config.stale_timeout_secs);
        let mut series = self.series.write();
        let before = series.len();

        series.retain(|_, m| !m.is_stale(timeout));

        let removed = before - series.len();

        if removed > 0 {
            debug!(
                removed,
                remaining = series.len(),
                "Cleaned up stale series"
            );
            let mut stats = self.stats.write();
            stats.stale_series_removed += removed as u64;
        }

        removed
    }

    /// Get the current number of stored series.
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }

    /// Render metrics in Prometheus exposition format.
    pub fn render(&self) -> String {
        let series = self.series.read();
        let mut output = Vec::with_capacity(series.len() * 100);

        // Group series by name for HELP/TYPE comments
        let mut by_name: HashMap<&str, Vec<&StoredMetric>> = HashMap::new();
        for metric in series.values() {
            by_name.entry(&metric.key.name).or_default().push(metric);
        }

        let mut names: Vec<_> = by_name.keys().copied().collect();
        names.sort_unstable();

        for name in names {
            let mut samples = by_name.remove(name).unwrap_or_default();
            let Some(first) = samples.first() else {
                continue;
            };

            if !first.help.is_empty() {
                writeln!(output, "# HELP {} {}", name, escape_help(&first.help)).ok();
            }
            writeln!(output, "# TYPE {} {}", name, first.kind.as_str()).ok();

            samples.sort_by(|a, b| a.key.labels.cmp(&b.key.labels));
            for metric in samples {
                writeln!(
                    output,
                    "{}{} {}",
                    metric.key.name,
                    metric.key.format_labels(),
                    format_value(metric.value)
                )
                .ok();
            }
        }

        // Exporter self metrics
        let stats = self.stats.read();
        let prefix = &self.prometheus_config.prefix;
        let self_metrics: [(&str, &str, String); 4] = [
            ("exporter_series_total", "gauge", series.len().to_string()),
            ("exporter_polls_total", "counter", stats.polls_total.to_string()),
            (
                "exporter_poll_errors_total",
                "counter",
                stats.poll_errors_total.to_string(),
            ),
            (
                "exporter_last_poll_success",
                "gauge",
                u8::from(stats.last_poll_success).to_string(),
            ),
        ];

        writeln!(output).ok();
        for (suffix, kind, value) in self_metrics {
            writeln!(output, "# TYPE {}_{} {}", prefix, suffix, kind).ok();
            writeln!(output, "{}_{} {}", prefix, suffix, value).ok();
        }

        String::from_utf8(output).unwrap_or_default()
    }
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape HELP text: only backslash and newline are special.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
