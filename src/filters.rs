//! Row predicates: the `RowFilter` seam plus ready-made predicates over
//! `serde_json::Value` rows.
//!
//! A predicate returning `Err` is a processing error, not a rejection; the
//! processor decides whether the row survives based on `skip_invalid_data`.

use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

pub trait RowFilter<T>: Send + Sync {
    fn keep(&self, record: &T) -> Result<bool>;
}

impl<T, F> RowFilter<T> for F
where
    F: Fn(&T) -> Result<bool> + Send + Sync,
{
    fn keep(&self, record: &T) -> Result<bool> {
        self(record)
    }
}

/// Comparison applied to a numeric field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NumCmp {
    Gt(f64),
    Ge(f64),
    Lt(f64),
    Le(f64),
}

impl NumCmp {
    fn test(self, x: f64) -> bool {
        match self {
            NumCmp::Gt(v) => x > v,
            NumCmp::Ge(v) => x >= v,
            NumCmp::Lt(v) => x < v,
            NumCmp::Le(v) => x <= v,
        }
    }
}

/// Predicates over top-level fields of a JSON object row.
///
/// A missing field (or `null`) never matches. A present field of the wrong
/// JSON type is reported as an error.
pub enum JsonFilter {
    Number { field: String, cmp: NumCmp },
    Matches { field: String, re: Regex },
    EqualsIgnoreCase { field: String, value: String },
    Present(String),
    All(Vec<JsonFilter>),
    Any(Vec<JsonFilter>),
    Not(Box<JsonFilter>),
}

impl JsonFilter {
    pub fn number(field: impl Into<String>, cmp: NumCmp) -> Self {
        Self::Number { field: field.into(), cmp }
    }

    pub fn matches(field: impl Into<String>, pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern).map_err(|e| anyhow!("bad regex {:?}: {}", pattern, e))?;
        Ok(Self::Matches { field: field.into(), re })
    }

    pub fn equals_ignore_case(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::EqualsIgnoreCase { field: field.into(), value: value.into() }
    }

    pub fn present(field: impl Into<String>) -> Self {
        Self::Present(field.into())
    }

    pub fn all(filters: Vec<JsonFilter>) -> Self {
        Self::All(filters)
    }

    pub fn any(filters: Vec<JsonFilter>) -> Self {
        Self::Any(filters)
    }

    pub fn not(filter: JsonFilter) -> Self {
        Self::Not(Box::new(filter))
    }

    pub fn into_shared(self) -> Arc<dyn RowFilter<Value>> {
        Arc::new(self)
    }

    fn eval(&self, v: &Value) -> Result<bool> {
        match self {
            JsonFilter::Number { field, cmp } => match v.get(field) {
                None | Some(Value::Null) => Ok(false),
                Some(x) => match x.as_f64() {
                    Some(n) => Ok(cmp.test(n)),
                    None => Err(anyhow!("field `{}` is not numeric: {}", field, x)),
                },
            },
            JsonFilter::Matches { field, re } => match v.get(field) {
                None | Some(Value::Null) => Ok(false),
                Some(Value::String(s)) => Ok(re.is_match(s)),
                Some(x) => Err(anyhow!("field `{}` is not a string: {}", field, x)),
            },
            JsonFilter::EqualsIgnoreCase { field, value } => match v.get(field) {
                None | Some(Value::Null) => Ok(false),
                Some(Value::String(s)) => Ok(s.eq_ignore_ascii_case(value)),
                Some(x) => Err(anyhow!("field `{}` is not a string: {}", field, x)),
            },
            JsonFilter::Present(field) => Ok(!matches!(v.get(field), None | Some(Value::Null))),
            JsonFilter::All(fs) => {
                for f in fs {
                    if !f.eval(v)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            JsonFilter::Any(fs) => {
                for f in fs {
                    if f.eval(v)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            JsonFilter::Not(f) => Ok(!f.eval(v)?),
        }
    }
}

impl RowFilter<Value> for JsonFilter {
    fn keep(&self, record: &Value) -> Result<bool> {
        self.eval(record)
    }
}
