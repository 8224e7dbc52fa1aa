//! Periodic collection of all configured metric groups.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::client::KeeneticClient;
use crate::config::{MetricGroupConfig, ParamValue};
use crate::error::ClientError;
use crate::extract::{CollectedMetric, TransformRegistry, evaluate_group};
use crate::store::SharedStore;

/// Something that can fetch a group's JSON document.
pub trait MetricSource: Send + Sync {
    fn fetch_metric(
        &self,
        path: &str,
        params: &BTreeMap<String, ParamValue>,
    ) -> impl Future<Output = Result<Value, ClientError>> + Send;
}

impl MetricSource for KeeneticClient {
    fn fetch_metric(
        &self,
        path: &str,
        params: &BTreeMap<String, ParamValue>,
    ) -> impl Future<Output = Result<Value, ClientError>> + Send {
        KeeneticClient::fetch_metric(self, path, params)
    }
}

/// Result of one collection cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionReport {
    pub metrics: Vec<CollectedMetric>,
    /// Groups fetched and evaluated.
    pub groups_ok: usize,
    /// Groups whose fetch failed or whose payload was not an object.
    pub groups_failed: usize,
}

/// Fetch and evaluate every group, one after another.
///
/// A failing group is logged and skipped; it never affects the others.
pub async fn collect_metrics<S: MetricSource>(
    source: &S,
    groups: &BTreeMap<String, MetricGroupConfig>,
    transforms: &TransformRegistry,
    prefix: &str,
) -> CollectionReport {
    let mut report = CollectionReport::default();

    for (group_name, group) in groups {
        let doc = match source.fetch_metric(&group.path, &group.params).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(group = %group_name, path = %group.path, error = %e, "Error collecting metrics");
                report.groups_failed += 1;
                continue;
            }
        };

        if !doc.is_object() {
            warn!(group = %group_name, path = %group.path, "Invalid data format, expected an object");
            report.groups_failed += 1;
            continue;
        }

        let metrics = evaluate_group(prefix, group_name, group, &doc, transforms);
        debug!(group = %group_name, metrics = metrics.len(), "Collected group");
        report.metrics.extend(metrics);
        report.groups_ok += 1;
    }

    report
}

/// Polls the router on a fixed interval and feeds the store.
pub struct Poller<S> {
    source: S,
    groups: BTreeMap<String, MetricGroupConfig>,
    transforms: TransformRegistry,
    prefix: String,
    store: SharedStore,
    poll_interval: Duration,
}

impl<S: MetricSource> Poller<S> {
    pub fn new(
        source: S,
        groups: BTreeMap<String, MetricGroupConfig>,
        transforms: TransformRegistry,
        prefix: impl Into<String>,
        store: SharedStore,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            groups,
            transforms,
            prefix: prefix.into(),
            store,
            poll_interval,
        }
    }

    /// Run one collection cycle and record it.
    pub async fn poll_once(&self) -> CollectionReport {
        let report =
            collect_metrics(&self.source, &self.groups, &self.transforms, &self.prefix).await;
        self.store.record_cycle(&report);
        self.store.cleanup_stale();

        debug!(
            metrics = report.metrics.len(),
            groups_ok = report.groups_ok,
            groups_failed = report.groups_failed,
            "Collection cycle finished"
        );
        report
    }

    /// Poll until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            groups = self.groups.len(),
            interval_secs = self.poll_interval.as_secs(),
            "Starting poller"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Poller stopped");
    }
}
