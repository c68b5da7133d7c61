use anyhow::{anyhow, Result};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Derives the deduplication key of a record.
///
/// - `Ok(None)`: the record has no key and is dropped from deduplicated output.
/// - `Err(_)`: recorded as a processing error; the record is dropped.
pub trait KeyExtractor<T>: Send + Sync {
    fn key(&self, record: &T) -> Result<Option<String>>;
}

impl<T, F> KeyExtractor<T> for F
where
    F: Fn(&T) -> Result<Option<String>> + Send + Sync,
{
    fn key(&self, record: &T) -> Result<Option<String>> {
        self(record)
    }
}

/// Combines two records that share a key. `existing` was seen first.
/// On `Err` the existing record is kept unchanged.
pub trait MergeFn<T>: Send + Sync {
    fn merge(&self, existing: &T, incoming: &T) -> Result<T>;
}

impl<T, F> MergeFn<T> for F
where
    F: Fn(&T, &T) -> Result<T> + Send + Sync,
{
    fn merge(&self, existing: &T, incoming: &T) -> Result<T> {
        self(existing, incoming)
    }
}

/// Key extractors for JSON object rows.
///
/// Notes:
///  - strings are used as-is, numbers and booleans by their JSON text.
///  - `null`/missing yields no key; objects and arrays are errors.
///  - `Composite` joins parts with U+001F and yields no key if any part is missing.
pub enum JsonKey {
    Field(String),
    FieldLower(String),
    Pointer(String),
    Composite(Vec<String>),
}

impl JsonKey {
    pub fn field(name: impl Into<String>) -> Self { Self::Field(name.into()) }
    pub fn field_lowercase(name: impl Into<String>) -> Self { Self::FieldLower(name.into()) }
    pub fn json_pointer(ptr: impl Into<String>) -> Self { Self::Pointer(ptr.into()) }
    pub fn composite<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self::Composite(fields.into_iter().map(Into::into).collect())
    }

    pub fn into_shared(self) -> Arc<dyn KeyExtractor<Value>> {
        Arc::new(self)
    }
}

fn scalar_key(v: Option<&Value>, what: &str) -> Result<Option<String>> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(anyhow!("key `{}` is not a scalar: {}", what, other)),
    }
}

impl KeyExtractor<Value> for JsonKey {
    fn key(&self, v: &Value) -> Result<Option<String>> {
        match self {
            JsonKey::Field(f) => scalar_key(v.get(f), f),
            JsonKey::FieldLower(f) => Ok(scalar_key(v.get(f), f)?.map(|s| s.to_lowercase())),
            JsonKey::Pointer(p) => scalar_key(v.pointer(p), p),
            JsonKey::Composite(fields) => {
                let mut out = String::new();
                for (i, f) in fields.iter().enumerate() {
                    match scalar_key(v.get(f), f)? {
                        Some(part) => {
                            if i > 0 {
                                out.push('\u{1f}');
                            }
                            out.push_str(&part);
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some(out))
            }
        }
    }
}

/// Merge policies for JSON rows.
pub enum JsonMerge {
    KeepFirst,
    KeepLast,
    /// Keep whichever record has the larger numeric `field`; ties keep the existing one.
    MaxBy(String),
    /// Shallow object merge: fields of the incoming row overwrite the existing ones.
    Overlay,
}

impl JsonMerge {
    pub fn max_by(field: impl Into<String>) -> Self {
        Self::MaxBy(field.into())
    }
}

fn numeric_field(v: &Value, field: &str) -> Result<f64> {
    v.get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("merge field `{}` missing or not numeric", field))
}

impl MergeFn<Value> for JsonMerge {
    fn merge(&self, existing: &Value, incoming: &Value) -> Result<Value> {
        match self {
            JsonMerge::KeepFirst => Ok(existing.clone()),
            JsonMerge::KeepLast => Ok(incoming.clone()),
            JsonMerge::MaxBy(field) => {
                let a = numeric_field(existing, field)?;
                let b = numeric_field(incoming, field)?;
                match b.partial_cmp(&a) {
                    Some(Ordering::Greater) => Ok(incoming.clone()),
                    _ => Ok(existing.clone()),
                }
            }
            JsonMerge::Overlay => match (existing, incoming) {
                (Value::Object(a), Value::Object(b)) => {
                    let mut out = a.clone();
                    for (k, v) in b {
                        out.insert(k.clone(), v.clone());
                    }
                    Ok(Value::Object(out))
                }
                _ => Err(anyhow!("overlay merge needs two JSON objects")),
            },
        }
    }
}
