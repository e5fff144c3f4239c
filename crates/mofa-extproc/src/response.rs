//! Replies sent back to the proxy, one per inbound event.
//!
//! This service never rewrites traffic: every reply carries a continue
//! status, empty mutations where the protocol expects them, and optionally a
//! dynamic-metadata document describing the extracted token usage.

use crate::event::{HeaderEntry, Phase};
use crate::metadata::{
    AI_PROVIDER_API_VERSION, AI_PROVIDER_NAME, COMPLETION_TOKEN_COUNT,
    EXT_PROC_METADATA_CONTEXT_KEY, ExtractionConfig, MODEL, PROMPT_TOKEN_COUNT,
    TOTAL_TOKEN_COUNT,
};
use crate::usage::Usage;
use bytes::Bytes;
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseStatus {
    #[default]
    Continue,
}

/// Header changes requested of the proxy. Always empty here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMutation {
    pub set_headers: Vec<HeaderEntry>,
    pub remove_headers: Vec<String>,
}

/// Body change requested of the proxy. Always empty here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyMutation {
    pub body: Option<Bytes>,
    pub clear_body: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommonResponse {
    pub status: ResponseStatus,
    pub header_mutation: Option<HeaderMutation>,
    pub body_mutation: Option<BodyMutation>,
}

/// Flat key/value map nested under one namespace key.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicMetadata {
    pub namespace: String,
    pub fields: Map<String, Value>,
}

impl DynamicMetadata {
    /// Usage metadata under this filter's namespace. Provider fields are
    /// included only when the upstream metadata named them.
    pub fn for_usage(usage: &Usage, extraction: &ExtractionConfig) -> Self {
        let mut fields = Map::new();
        if let Some(version) = &extraction.provider_api_version {
            fields.insert(AI_PROVIDER_API_VERSION.to_string(), json!(version));
        }
        if let Some(name) = &extraction.provider_name {
            fields.insert(AI_PROVIDER_NAME.to_string(), json!(name));
        }
        fields.insert(MODEL.to_string(), json!(usage.model));
        fields.insert(PROMPT_TOKEN_COUNT.to_string(), json!(usage.prompt_tokens));
        fields.insert(COMPLETION_TOKEN_COUNT.to_string(), json!(usage.completion_tokens));
        fields.insert(TOTAL_TOKEN_COUNT.to_string(), json!(usage.total_tokens));

        Self {
            namespace: EXT_PROC_METADATA_CONTEXT_KEY.to_string(),
            fields,
        }
    }

    /// The full document: `{ namespace: { ...fields } }`.
    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        root.insert(self.namespace.clone(), Value::Object(self.fields.clone()));
        Value::Object(root)
    }
}

/// One reply on the processing stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingReply {
    /// Phase of the event this reply answers.
    pub phase: Phase,
    pub response: CommonResponse,
    pub dynamic_metadata: Option<DynamicMetadata>,
}

impl ProcessingReply {
    /// Continue with empty header and body mutations.
    pub fn headers_continue(phase: Phase) -> Self {
        Self {
            phase,
            response: CommonResponse {
                status: ResponseStatus::Continue,
                header_mutation: Some(HeaderMutation::default()),
                body_mutation: Some(BodyMutation::default()),
            },
            dynamic_metadata: None,
        }
    }

    /// Bare continue for a body whose usage could not be extracted.
    pub fn body_continue() -> Self {
        Self::passthrough(Phase::ResponseBody)
    }

    /// Continue with an empty body mutation and the usage attached.
    pub fn body_with_usage(usage: &Usage, extraction: &ExtractionConfig) -> Self {
        Self {
            phase: Phase::ResponseBody,
            response: CommonResponse {
                status: ResponseStatus::Continue,
                header_mutation: None,
                body_mutation: Some(BodyMutation::default()),
            },
            dynamic_metadata: Some(DynamicMetadata::for_usage(usage, extraction)),
        }
    }

    /// Continue status only, for phases this service does not inspect.
    pub fn passthrough(phase: Phase) -> Self {
        Self {
            phase,
            response: CommonResponse::default(),
            dynamic_metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_reply_has_empty_mutations() {
        let reply = ProcessingReply::headers_continue(Phase::ResponseHeaders);
        assert_eq!(reply.response.status, ResponseStatus::Continue);
        assert_eq!(reply.response.header_mutation, Some(HeaderMutation::default()));
        assert_eq!(reply.response.body_mutation, Some(BodyMutation::default()));
        assert!(reply.dynamic_metadata.is_none());
    }

    #[test]
    fn failed_body_reply_has_status_only() {
        let reply = ProcessingReply::body_continue();
        assert_eq!(reply.phase, Phase::ResponseBody);
        assert_eq!(reply.response, CommonResponse::default());
        assert!(reply.dynamic_metadata.is_none());
    }

    #[test]
    fn usage_metadata_without_provider() {
        let usage = Usage::new(12, 8, 20).with_model("gpt-4");
        let reply = ProcessingReply::body_with_usage(&usage, &ExtractionConfig::default());
        let md = reply.dynamic_metadata.unwrap();
        assert_eq!(
            md.to_value(),
            json!({
                "envoy.filters.http.ext_proc": {
                    "model": "gpt-4",
                    "promptTokenCount": 12,
                    "completionTokenCount": 8,
                    "totalTokenCount": 20
                }
            })
        );
    }

    #[test]
    fn usage_metadata_with_provider() {
        let extraction = ExtractionConfig {
            provider_name: Some("azure-openai".into()),
            provider_api_version: Some("2024-06-01".into()),
            ..Default::default()
        };
        let md = DynamicMetadata::for_usage(&Usage::new(1, 1, 2), &extraction);
        assert_eq!(md.fields[AI_PROVIDER_NAME], json!("azure-openai"));
        assert_eq!(md.fields[AI_PROVIDER_API_VERSION], json!("2024-06-01"));
        assert_eq!(md.fields.len(), 6);
    }
}
