//! Header-keyed usage extraction.

use super::{COMPLETION_FIELD, PROMPT_FIELD, TOTAL_FIELD, Usage, UsageKeys};
use crate::error::ExtractionError;
use crate::event::HeaderEntry;

/// Read the usage counters from response headers.
///
/// Header names match exactly. When a header repeats, the last occurrence
/// wins. A header with an empty textual value is read from its raw bytes.
pub fn extract(headers: &[HeaderEntry], keys: &UsageKeys) -> Result<Usage, ExtractionError> {
    let prompt_tokens = count(headers, PROMPT_FIELD, &keys.prompt)?;
    let completion_tokens = count(headers, COMPLETION_FIELD, &keys.completion)?;
    let total_tokens = count(headers, TOTAL_FIELD, &keys.total)?;

    let model = keys
        .model
        .as_deref()
        .and_then(|name| find(headers, name))
        .map(|h| match h.text() {
            Some(text) => text.to_string(),
            None => String::from_utf8_lossy(&h.raw_value).into_owned(),
        })
        .unwrap_or_default();

    Ok(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        model,
    })
}

fn find<'a>(headers: &'a [HeaderEntry], name: &str) -> Option<&'a HeaderEntry> {
    headers.iter().rev().find(|h| h.key == name)
}

fn count(headers: &[HeaderEntry], field: &'static str, name: &str) -> Result<i64, ExtractionError> {
    let header = find(headers, name).ok_or_else(|| ExtractionError::MissingHeader {
        field,
        header: name.to_string(),
    })?;
    let text = header.text().ok_or_else(|| ExtractionError::InvalidInteger {
        field,
        value: String::from_utf8_lossy(&header.raw_value).into_owned(),
    })?;
    text.parse().map_err(|_| ExtractionError::InvalidInteger {
        field,
        value: text.to_string(),
    })
}
