//! JSON-path usage extraction from a decoded response body.

use super::json_path::{FromLeaf, JsonPath, Lookup};
use super::{COMPLETION_FIELD, MODEL_FIELD, PROMPT_FIELD, TOTAL_FIELD, Usage, UsageKeys};
use crate::error::ExtractionError;
use serde_json::Value;
use tracing::debug;

/// Read the usage counters from a parsed JSON document.
///
/// Any unresolvable count fails the whole extraction. An unresolvable model
/// path leaves the model empty.
pub fn extract(document: &Value, keys: &UsageKeys) -> Result<Usage, ExtractionError> {
    let prompt_tokens = required(document, PROMPT_FIELD, &keys.prompt)?;
    let completion_tokens = required(document, COMPLETION_FIELD, &keys.completion)?;
    let total_tokens = required(document, TOTAL_FIELD, &keys.total)?;

    let model = match keys.model.as_deref() {
        Some(path) => JsonPath::parse(path)
            .lookup::<String>(document)
            .unwrap_or_else(|miss| {
                debug!(path, reason = ?miss, "model not found in body");
                String::new()
            }),
        None => String::new(),
    };

    Ok(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        model,
    })
}

fn required<T: FromLeaf>(
    document: &Value,
    field: &'static str,
    path: &str,
) -> Result<T, ExtractionError> {
    JsonPath::parse(path)
        .lookup(document)
        .map_err(|miss| match miss {
            Lookup::Empty => ExtractionError::EmptyPath(field),
            Lookup::Missing(segment) => ExtractionError::PathNotFound {
                field,
                path: path.to_string(),
                segment,
            },
            Lookup::WrongType(value) => ExtractionError::InvalidInteger { field, value },
        })
}
