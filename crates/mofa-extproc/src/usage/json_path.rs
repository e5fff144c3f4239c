//! Minimal dot-separated JSON path accessor.
//!
//! `usage.prompt_tokens` walks the field `usage` and then `prompt_tokens`
//! from the document root. A leading `$` segment is accepted and ignored.
//! Numeric segments also index into arrays, so `choices.0.index` works.

use serde_json::Value;

/// Parsed path, split into segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<String>,
}

impl JsonPath {
    pub fn parse(path: &str) -> Self {
        let mut segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.first().is_some_and(|s| s == "$") {
            segments.remove(0);
        }
        Self { segments }
    }

    /// Walk the document and coerce the leaf into `T`.
    pub fn lookup<T: FromLeaf>(&self, document: &Value) -> Result<T, Lookup> {
        if self.segments.is_empty() {
            return Err(Lookup::Empty);
        }
        let leaf = resolve(document, &self.segments)?;
        T::from_leaf(leaf).ok_or_else(|| Lookup::WrongType(leaf.to_string()))
    }
}

/// Why a lookup did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The path has no segments.
    Empty,
    /// The named segment does not exist at its level.
    Missing(String),
    /// The leaf exists but cannot be coerced; carries the leaf as JSON.
    WrongType(String),
}

fn resolve<'a>(node: &'a Value, segments: &[String]) -> Result<&'a Value, Lookup> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(node);
    };
    let child = match node {
        Value::Object(map) => map.get(head.as_str()),
        Value::Array(items) => head.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    };
    match child {
        Some(child) => resolve(child, rest),
        None => Err(Lookup::Missing(head.clone())),
    }
}

/// Coercion of a JSON leaf into the expected value type.
pub trait FromLeaf: Sized {
    fn from_leaf(value: &Value) -> Option<Self>;
}

impl FromLeaf for i64 {
    /// Integers as-is, floats truncated, numeric strings parsed.
    fn from_leaf(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                    .map(|f| f.trunc() as i64)
            }),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromLeaf for String {
    /// Scalars rendered as text; null and containers become empty.
    fn from_leaf(value: &Value) -> Option<Self> {
        Some(match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null | Value::Array(_) | Value::Object(_) => String::new(),
        })
    }
}
