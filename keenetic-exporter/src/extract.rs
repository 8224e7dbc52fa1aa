//! Turning a group's JSON response into metric values.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{MetricDefinition, MetricGroupConfig, MetricKind};
use crate::mapping::build_metric_name;
use crate::selector::{evaluate_array_selector, evaluate_calculation};

/// Walk a dotted path (`"memory.total"`) through nested objects.
///
/// Returns `None` as soon as a step is missing or lands on a non-object.
pub fn extract_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |node, key| node.as_object()?.get(key))
}

/// Render a JSON value as label text. Missing and null values become `""`.
pub fn label_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Read each label path from `item`. Label names are the paths themselves.
pub fn extract_labels(item: &Value, paths: &[String]) -> Vec<(String, String)> {
    paths
        .iter()
        .map(|path| (path.clone(), label_text(extract_value(item, path))))
        .collect()
}

/// Parse the leading base-10 integer of a string.
///
/// Leading whitespace and a sign are accepted; anything after the digits is
/// ignored. `"42abc"` is 42, `"abc"` is `None`.
pub fn parse_int_prefix(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let value: f64 = digits[..end].parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Default conversion of a raw value to a sample.
///
/// Numbers pass through, strings are read as integers, anything else is 0.
/// Strings without a leading integer are 0 too.
pub fn default_transform(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => parse_int_prefix(s).unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Reads the used amount from a `"used/total"` string such as `"84824/262144"`.
pub fn used_of_total(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::String(s)) => s
            .split('/')
            .next()
            .and_then(parse_int_prefix)
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Value conversion function.
pub type Transform = Arc<dyn Fn(Option<&Value>) -> f64 + Send + Sync>;

/// Per-field overrides of [`default_transform`], keyed by group path and field.
#[derive(Clone)]
pub struct TransformRegistry {
    transforms: HashMap<(String, String), Transform>,
}

impl TransformRegistry {
    /// A registry with no overrides.
    pub fn empty() -> Self {
        Self {
            transforms: HashMap::new(),
        }
    }

    /// Register an override for `field` in responses of `group_path`.
    pub fn register<F>(&mut self, group_path: &str, field: &str, transform: F)
    where
        F: Fn(Option<&Value>) -> f64 + Send + Sync + 'static,
    {
        self.transforms.insert(
            (group_path.to_string(), field.to_string()),
            Arc::new(transform),
        );
    }

    pub fn contains(&self, group_path: &str, field: &str) -> bool {
        self.transforms
            .contains_key(&(group_path.to_string(), field.to_string()))
    }

    /// Convert a raw value, using an override when one is registered.
    pub fn transform(&self, group_path: &str, field: &str, value: Option<&Value>) -> f64 {
        match self
            .transforms
            .get(&(group_path.to_string(), field.to_string()))
        {
            Some(transform) => transform(value),
            None => default_transform(value),
        }
    }
}

impl Default for TransformRegistry {
    /// The built-in overrides: `system.memory` is reported as used memory.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("system", "memory", used_of_total);
        registry
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self
            .transforms
            .keys()
            .map(|(path, field)| format!("{}.{}", path, field))
            .collect();
        keys.sort();
        f.debug_struct("TransformRegistry")
            .field("overrides", &keys)
            .finish()
    }
}

/// One labeled sample of an array metric.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledValue {
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Samples of a metric: a single value, or one value per selected item.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValues {
    Single(f64),
    Labeled(Vec<LabeledValue>),
}

/// Extracted metric ready for export.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricData {
    pub kind: MetricKind,
    pub help: String,
    pub values: MetricValues,
}

/// A named metric produced by a collection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedMetric {
    /// Full metric name, `{prefix}_{group}_{metric}`.
    pub name: String,
    pub data: MetricData,
}

/// Evaluate one definition against a group's response.
///
/// `array_selector` wins over `calculate`, which wins over `field`. Returns
/// `None` when the definition has none of them, or when the selector picks
/// items that are not all objects.
pub fn evaluate_definition(
    group_path: &str,
    definition: &MetricDefinition,
    doc: &Value,
    transforms: &TransformRegistry,
) -> Option<MetricData> {
    let values = if let Some(selector) = &definition.array_selector {
        let items = evaluate_array_selector(doc, selector);
        if !items.iter().all(|item| item.is_object()) {
            warn!(
                metric = %definition.name,
                selector = %selector,
                "Selector returned non-object items, skipping metric"
            );
            return None;
        }

        let values = items
            .into_iter()
            .map(|item| LabeledValue {
                labels: extract_labels(item, &definition.labels),
                value: match &definition.field {
                    Some(field) => {
                        transforms.transform(group_path, field, extract_value(item, field))
                    }
                    None => 0.0,
                },
            })
            .collect();
        MetricValues::Labeled(values)
    } else if let Some(expr) = &definition.calculate {
        MetricValues::Single(evaluate_calculation(doc, expr))
    } else if let Some(field) = &definition.field {
        MetricValues::Single(transforms.transform(group_path, field, extract_value(doc, field)))
    } else {
        debug!(metric = %definition.name, "Metric has no field, selector or calculation");
        return None;
    };

    Some(MetricData {
        kind: definition.kind,
        help: definition.help.clone(),
        values,
    })
}

/// Evaluate every definition of a group. Definitions are independent of
/// each other; a skipped one does not affect the rest.
pub fn evaluate_group(
    prefix: &str,
    group_name: &str,
    group: &MetricGroupConfig,
    doc: &Value,
    transforms: &TransformRegistry,
) -> Vec<CollectedMetric> {
    group
        .metrics
        .iter()
        .filter_map(|definition| {
            evaluate_definition(&group.path, definition, doc, transforms).map(|data| {
                CollectedMetric {
                    name: build_metric_name(prefix, group_name, &definition.name),
                    data,
                }
            })
        })
        .collect()
}
