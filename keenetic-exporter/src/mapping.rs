//! Prometheus naming rules for exported metrics.

/// Replace every run of characters rejected by `valid` with a single `_`
/// and drop trailing underscores.
fn squash_invalid(name: &str, valid: impl Fn(usize, char) -> bool) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.chars().enumerate() {
        if valid(i, c) {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_end_matches('_').len();
    out.truncate(trimmed);
    out
}

/// Sanitize a metric name to match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
///
/// Dots, dashes, spaces and other invalid characters become `_`. A leading
/// digit is kept behind an extra `_`.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = squash_invalid(name, |_, c| c.is_ascii_alphanumeric() || c == '_' || c == ':');

    if result.starts_with(|c: char| c.is_ascii_digit()) {
        result.insert(0, '_');
    }
    if result.is_empty() {
        result.push_str("unnamed");
    }
    result
}

/// Sanitize a label name to match `[a-zA-Z_][a-zA-Z0-9_]*`.
///
/// Label paths such as `link.speed` become `link_speed`. Names starting with
/// the reserved `__` get a `z` in front.
pub fn sanitize_label_name(name: &str) -> String {
    let mut result = squash_invalid(name, |i, c| {
        c == '_' || if i == 0 { c.is_ascii_alphabetic() } else { c.is_ascii_alphanumeric() }
    });

    if result.is_empty() {
        return "label".to_string();
    }
    if result.starts_with("__") {
        result.insert(0, 'z');
    }
    result
}

/// Build a full Prometheus metric name from components.
///
/// Format: `{prefix}_{group}_{metric}`
pub fn build_metric_name(prefix: &str, group: &str, metric: &str) -> String {
    let name = if prefix.is_empty() {
        format!("{}_{}", group, metric)
    } else {
        format!("{}_{}_{}", prefix, group, metric)
    };
    sanitize_metric_name(&name)
}
