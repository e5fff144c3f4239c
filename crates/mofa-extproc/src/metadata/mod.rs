//! Well-known metadata keys and the configuration read from them.
//!
//! Earlier pipeline stages (route configuration, the ext_authz filter) attach
//! structured metadata to every processing request. This module reads it by
//! direct field access on the already-typed value.

mod text_format;

use serde_json::{Map, Value};
use tracing::warn;

// ─────────────────────────────────────────────────────────────────────────────
// Keys
// ─────────────────────────────────────────────────────────────────────────────

/// Namespace of this filter: route attributes arrive under it and the
/// dynamic metadata we emit is nested under it.
pub const EXT_PROC_METADATA_CONTEXT_KEY: &str = "envoy.filters.http.ext_proc";
/// Upstream filter whose metadata carries the extraction configuration.
pub const EXT_AUTHZ_FILTER_NAME: &str = "envoy.filters.http.ext_authz";
/// Attribute carrying the matched route's metadata.
pub const ROUTE_METADATA_ATTRIBUTE: &str = "xds.route_metadata";

pub const ENABLE_BACKEND_AI_RATELIMIT: &str = "EnableBackendBasedAIRatelimit";
pub const BACKEND_AI_RATELIMIT_DESCRIPTOR_VALUE: &str = "BackendBasedAIRatelimitDescriptorValue";

pub const EXTRACT_TOKEN_FROM: &str = "extractTokenFrom";
pub const PROMPT_TOKEN_ID: &str = "promptTokenID";
pub const COMPLETION_TOKEN_ID: &str = "completionTokenID";
pub const TOTAL_TOKEN_ID: &str = "totalTokenID";
pub const MODEL_ID: &str = "modelID";
pub const AI_PROVIDER_NAME: &str = "aiProviderName";
pub const AI_PROVIDER_API_VERSION: &str = "aiProviderAPIVersion";
pub const ORGANIZATION_AND_AIRL_POLICY: &str = "ratelimit:organization-and-airl-policy";
pub const SUBSCRIPTION: &str = "ratelimit:subscription";

pub const MODEL: &str = "model";
pub const PROMPT_TOKEN_COUNT: &str = "promptTokenCount";
pub const COMPLETION_TOKEN_COUNT: &str = "completionTokenCount";
pub const TOTAL_TOKEN_COUNT: &str = "totalTokenCount";

// ─────────────────────────────────────────────────────────────────────────────
// Route-level rate-limit settings
// ─────────────────────────────────────────────────────────────────────────────

/// Backend rate-limit settings carried in route metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteRateLimitConfig {
    pub enabled: bool,
    pub descriptor: Option<String>,
}

impl RouteRateLimitConfig {
    /// Read the settings from an event's attributes.
    ///
    /// Returns `None` when the event carries no route metadata at all. When
    /// route metadata is present but a field is missing, that field takes its
    /// default (`false` / `None`), so a later event always fully replaces the
    /// previous settings.
    pub fn from_attributes(attributes: &Map<String, Value>) -> Option<Self> {
        let route_metadata = attributes
            .get(EXT_PROC_METADATA_CONTEXT_KEY)?
            .as_object()?
            .get(ROUTE_METADATA_ATTRIBUTE)?;

        // Envoy may hand the route metadata over as an already-serialised
        // document instead of a nested struct.
        let parsed;
        let root = match route_metadata {
            Value::String(text) => {
                parsed = parse_route_metadata(text);
                &parsed
            }
            other => other,
        };

        let enabled = find_field(root, ENABLE_BACKEND_AI_RATELIMIT)
            .map(truthy)
            .unwrap_or(false);
        let descriptor = find_field(root, BACKEND_AI_RATELIMIT_DESCRIPTOR_VALUE).and_then(scalar_text);

        Some(Self {
            enabled,
            descriptor,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-event extraction settings
// ─────────────────────────────────────────────────────────────────────────────

/// Where the provider reports token usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Header,
    Body,
}

impl TokenSource {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "header" | "headers" => Some(TokenSource::Header),
            "body" | "payload" => Some(TokenSource::Body),
            _ => None,
        }
    }
}

/// Extraction settings derived from one event's upstream filter metadata.
///
/// Recomputed for every event; never cached on the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionConfig {
    pub token_source: Option<TokenSource>,
    pub prompt_key: Option<String>,
    pub completion_key: Option<String>,
    pub total_key: Option<String>,
    pub model_key: Option<String>,
    pub provider_name: Option<String>,
    pub provider_api_version: Option<String>,
    pub org_policy_descriptor: Option<String>,
    pub subscription_descriptor: Option<String>,
}

impl ExtractionConfig {
    /// Read the settings from the ext_authz filter metadata.
    ///
    /// Returns `None` when that filter attached nothing to this request.
    pub fn from_filter_metadata(filter_metadata: &Map<String, Value>) -> Option<Self> {
        let fields = filter_metadata.get(EXT_AUTHZ_FILTER_NAME)?.as_object()?;
        let text = |key: &str| fields.get(key).and_then(scalar_text);

        Some(Self {
            token_source: text(EXTRACT_TOKEN_FROM).as_deref().and_then(TokenSource::parse),
            prompt_key: text(PROMPT_TOKEN_ID),
            completion_key: text(COMPLETION_TOKEN_ID),
            total_key: text(TOTAL_TOKEN_ID),
            model_key: text(MODEL_ID),
            provider_name: text(AI_PROVIDER_NAME),
            provider_api_version: text(AI_PROVIDER_API_VERSION),
            org_policy_descriptor: text(ORGANIZATION_AND_AIRL_POLICY),
            subscription_descriptor: text(SUBSCRIPTION),
        })
    }

    /// Whether the given strategy should run for this event.
    pub fn allows(&self, source: TokenSource) -> bool {
        self.token_source.is_none_or(|s| s == source)
    }

    /// Org+policy and subscription descriptors, only when both are present.
    pub fn subscription_descriptors(&self) -> Option<(&str, &str)> {
        Some((
            self.org_policy_descriptor.as_deref()?,
            self.subscription_descriptor.as_deref()?,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Depth-first search for `key` in nested objects and arrays.
/// JSON first, then protobuf text format. Unreadable text reads as empty.
fn parse_route_metadata(text: &str) -> Value {
    if let Ok(doc) = serde_json::from_str::<Value>(text) {
        return doc;
    }
    text_format::to_json(text).unwrap_or_else(|error| {
        warn!(error = %error, route_metadata = text, "could not parse route metadata");
        Value::Null
    })
}

fn find_field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map
            .get(key)
            .or_else(|| map.values().find_map(|v| find_field(v, key))),
        Value::Array(items) => items.iter().find_map(|v| find_field(v, key)),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(route_metadata: Value) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert(
            EXT_PROC_METADATA_CONTEXT_KEY.to_string(),
            json!({ ROUTE_METADATA_ATTRIBUTE: route_metadata }),
        );
        m
    }

    #[test]
    fn route_config_from_nested_struct() {
        let a = attrs(json!({
            "filter_metadata": {
                "envoy.filters.http.ext_proc": {
                    "EnableBackendBasedAIRatelimit": "true",
                    "BackendBasedAIRatelimitDescriptorValue": "backend-1"
                }
            }
        }));
        let cfg = RouteRateLimitConfig::from_attributes(&a).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.descriptor.as_deref(), Some("backend-1"));
    }

    #[test]
    fn route_config_from_serialised_string() {
        let a = attrs(json!(
            r#"{"EnableBackendBasedAIRatelimit": true, "BackendBasedAIRatelimitDescriptorValue": "b"}"#
        ));
        let cfg = RouteRateLimitConfig::from_attributes(&a).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.descriptor.as_deref(), Some("b"));
    }

    #[test]
    fn route_config_from_text_format_string() {
        let a = attrs(json!(
            r#"filter_metadata {
  key: "envoy.filters.http.ext_proc"
  value {
    fields {
      key: "EnableBackendBasedAIRatelimit"
      value { string_value: "true" }
    }
    fields {
      key: "BackendBasedAIRatelimitDescriptorValue"
      value { string_value: "openai-east" }
    }
  }
}"#
        ));
        let cfg = RouteRateLimitConfig::from_attributes(&a).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.descriptor.as_deref(), Some("openai-east"));
    }

    #[test]
    fn unreadable_route_string_disables() {
        let cfg = RouteRateLimitConfig::from_attributes(&attrs(json!("filter_metadata {"))).unwrap();
        assert_eq!(cfg, RouteRateLimitConfig::default());
    }

    #[test]
    fn route_config_missing_fields_default() {
        let cfg = RouteRateLimitConfig::from_attributes(&attrs(json!({}))).unwrap();
        assert_eq!(cfg, RouteRateLimitConfig::default());
    }

    #[test]
    fn route_config_absent_without_route_metadata() {
        let mut a = Map::new();
        a.insert(EXT_PROC_METADATA_CONTEXT_KEY.to_string(), json!({"other": 1}));
        assert!(RouteRateLimitConfig::from_attributes(&a).is_none());
        assert!(RouteRateLimitConfig::from_attributes(&Map::new()).is_none());
    }

    #[test]
    fn extraction_config_reads_ext_authz_fields() {
        let mut m = Map::new();
        m.insert(
            EXT_AUTHZ_FILTER_NAME.to_string(),
            json!({
                "extractTokenFrom": "body",
                "promptTokenID": "$.usage.prompt_tokens",
                "completionTokenID": "usage.completion_tokens",
                "totalTokenID": "usage.total_tokens",
                "modelID": "model",
                "aiProviderName": "openai",
                "aiProviderAPIVersion": "v1",
                "ratelimit:organization-and-airl-policy": "org1-policy",
                "ratelimit:subscription": "sub1"
            }),
        );
        let cfg = ExtractionConfig::from_filter_metadata(&m).unwrap();
        assert_eq!(cfg.token_source, Some(TokenSource::Body));
        assert_eq!(cfg.prompt_key.as_deref(), Some("$.usage.prompt_tokens"));
        assert_eq!(cfg.provider_name.as_deref(), Some("openai"));
        assert_eq!(cfg.subscription_descriptors(), Some(("org1-policy", "sub1")));
        assert!(cfg.allows(TokenSource::Body));
        assert!(!cfg.allows(TokenSource::Header));
    }

    #[test]
    fn subscription_descriptors_need_both() {
        let cfg = ExtractionConfig {
            org_policy_descriptor: Some("org".into()),
            ..Default::default()
        };
        assert!(cfg.subscription_descriptors().is_none());
    }

    #[test]
    fn unset_token_source_allows_both() {
        let cfg = ExtractionConfig::default();
        assert!(cfg.allows(TokenSource::Header));
        assert!(cfg.allows(TokenSource::Body));
    }

    #[test]
    fn extraction_config_absent_without_ext_authz() {
        assert!(ExtractionConfig::from_filter_metadata(&Map::new()).is_none());
    }
}
