//! Token-usage extraction.
//!
//! Two independent strategies produce a [`Usage`]:
//!
//! | Strategy | Input | Keys are |
//! |----------|-------|----------|
//! | [`header::extract`] | response headers | header names |
//! | [`body::extract`] | decoded JSON body | dot-separated field paths |
//!
//! Both are all-or-nothing: a `Usage` exists only if the prompt, completion
//! and total counts all resolved. The model name is optional and defaults to
//! the empty string.

pub mod body;
pub mod header;
pub mod json_path;

use crate::error::ExtractionError;
use crate::metadata::ExtractionConfig;
use serde::{Deserialize, Serialize};

pub(crate) const PROMPT_FIELD: &str = "prompt_tokens";
pub(crate) const COMPLETION_FIELD: &str = "completion_tokens";
pub(crate) const TOTAL_FIELD: &str = "total_tokens";
pub(crate) const MODEL_FIELD: &str = "model";

/// Token counts reported by an AI backend for one response.
///
/// The counts are taken as reported; `total_tokens` is not checked against
/// the sum of the other two.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub model: String,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64, total_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            model: String::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// The four lookup keys shared by both strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageKeys {
    pub prompt: String,
    pub completion: String,
    pub total: String,
    pub model: Option<String>,
}

impl UsageKeys {
    pub fn new(
        prompt: impl Into<String>,
        completion: impl Into<String>,
        total: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            completion: completion.into(),
            total: total.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Pull the keys out of an event's extraction settings.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let required = |key: &Option<String>, field| {
            key.clone().ok_or(ExtractionError::MissingConfig(field))
        };
        Ok(Self {
            prompt: required(&config.prompt_key, PROMPT_FIELD)?,
            completion: required(&config.completion_key, COMPLETION_FIELD)?,
            total: required(&config.total_key, TOTAL_FIELD)?,
            model: config.model_key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_require_all_three_counts() {
        let config = ExtractionConfig {
            prompt_key: Some("p".into()),
            completion_key: Some("c".into()),
            ..Default::default()
        };
        assert_eq!(
            UsageKeys::from_config(&config),
            Err(ExtractionError::MissingConfig(TOTAL_FIELD))
        );
    }

    #[test]
    fn keys_model_is_optional() {
        let config = ExtractionConfig {
            prompt_key: Some("p".into()),
            completion_key: Some("c".into()),
            total_key: Some("t".into()),
            ..Default::default()
        };
        let keys = UsageKeys::from_config(&config).unwrap();
        assert_eq!(keys, UsageKeys::new("p", "c", "t"));
    }
}
