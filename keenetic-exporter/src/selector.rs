//! Array selectors and calculated values.
//!
//! A selector names an array field of the response and optionally filters its
//! items on a single key:
//!
//! ```text
//! host                     every item of `host`
//! host[?ssid]              items that have an `ssid` key (any value, even null)
//! host[?active===true]     items whose `active` is the boolean true
//! host[?link===up]         items whose `link` is the string "up"
//! ```
//!
//! Only `true` and `false` are parsed; every other comparand is compared as a
//! string, so `id[?port===1]` never matches a numeric `port`.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid selector: {0:?}")]
pub struct SelectorError(pub String);

/// Parsed array selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub field: String,
    pub filter: Option<Filter>,
}

/// `[?condition]` or `[?condition===comparand]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub condition: String,
    pub comparand: Option<Comparand>,
}

/// Literal a filtered key is compared against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparand {
    Bool(bool),
    Text(String),
}

impl Comparand {
    fn parse(raw: &str) -> Self {
        match raw {
            "true" => Comparand::Bool(true),
            "false" => Comparand::Bool(false),
            other => Comparand::Text(other.to_string()),
        }
    }

    /// Strict equality: type and value must both match.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Comparand::Bool(expected), Value::Bool(actual)) => expected == actual,
            (Comparand::Text(expected), Value::String(actual)) => expected == actual,
            _ => false,
        }
    }
}

impl fmt::Display for Comparand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparand::Bool(b) => write!(f, "{}", b),
            Comparand::Text(s) => f.write_str(s),
        }
    }
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SelectorError(s.to_string());

        let Some((field, rest)) = s.split_once('[') else {
            return if is_word(s) {
                Ok(Selector {
                    field: s.to_string(),
                    filter: None,
                })
            } else {
                Err(invalid())
            };
        };

        if !is_word(field) {
            return Err(invalid());
        }

        let inner = rest
            .strip_prefix('?')
            .and_then(|r| r.strip_suffix(']'))
            .ok_or_else(invalid)?;

        let (condition, comparand) = match inner.split_once("===") {
            Some((_, "")) => return Err(invalid()),
            Some((condition, raw)) => (condition, Some(Comparand::parse(raw))),
            None => (inner, None),
        };

        if !is_word(condition) {
            return Err(invalid());
        }

        Ok(Selector {
            field: field.to_string(),
            filter: Some(Filter {
                condition: condition.to_string(),
                comparand,
            }),
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.field)?;
        if let Some(filter) = &self.filter {
            write!(f, "[?{}", filter.condition)?;
            if let Some(comparand) = &filter.comparand {
                write!(f, "==={}", comparand)?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

impl Filter {
    fn accepts(&self, item: &Value) -> bool {
        let Some(object) = item.as_object() else {
            return false;
        };
        match &self.comparand {
            None => object.contains_key(&self.condition),
            Some(comparand) => object
                .get(&self.condition)
                .is_some_and(|v| comparand.matches(v)),
        }
    }
}

impl Selector {
    /// Apply the selector to a document.
    ///
    /// Returns nothing when `field` is missing or not an array. Without a
    /// filter the whole array is returned, objects or not.
    pub fn select<'a>(&self, doc: &'a Value) -> Vec<&'a Value> {
        let Some(items) = doc.get(&self.field).and_then(Value::as_array) else {
            return Vec::new();
        };

        match &self.filter {
            None => items.iter().collect(),
            Some(filter) => items.iter().filter(|item| filter.accepts(item)).collect(),
        }
    }
}

/// Parse and apply `selector`. Invalid selectors select nothing.
pub fn evaluate_array_selector<'a>(doc: &'a Value, selector: &str) -> Vec<&'a Value> {
    match selector.parse::<Selector>() {
        Ok(selector) => selector.select(doc),
        Err(e) => {
            debug!(error = %e, "Selector match failed");
            Vec::new()
        }
    }
}

/// Derived value computed from a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Calculation {
    /// `length(<selector>)`: number of selected items.
    Length(Selector),
}

impl FromStr for Calculation {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix("length(")
            .and_then(|r| r.strip_suffix(')'))
            .ok_or_else(|| SelectorError(s.to_string()))?;
        Ok(Calculation::Length(inner.parse()?))
    }
}

impl Calculation {
    pub fn evaluate(&self, doc: &Value) -> f64 {
        match self {
            Calculation::Length(selector) => selector.select(doc).len() as f64,
        }
    }
}

/// Evaluate a calculation expression. Unknown or invalid expressions yield 0.
pub fn evaluate_calculation(doc: &Value, expr: &str) -> f64 {
    match expr.parse::<Calculation>() {
        Ok(calculation) => calculation.evaluate(doc),
        Err(e) => {
            debug!(error = %e, expression = %expr, "Unsupported calculation");
            0.0
        }
    }
}
