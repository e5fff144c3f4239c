//! Token-based rate-limit accounting.
//!
//! A successfully extracted [`Usage`] becomes a batch of [`RateLimitHit`]s
//! which the [`RateLimitDispatcher`] hands to a [`RateLimitClient`] off the
//! reply path. The outcome is logged, never enforced here.

mod client;
mod dispatcher;

pub use client::{LoggingRateLimitClient, RateLimitClient, RateLimitDecision};
pub use dispatcher::{DispatchStats, DispatcherConfig, RateLimitDispatcher};

use crate::metadata::ExtractionConfig;
use crate::session::StreamSession;
use crate::usage::Usage;
use serde::{Deserialize, Serialize};

pub const DESCRIPTOR_KEY_FOR_AI_REQUEST_TOKEN_COUNT: &str = "airequesttokencount";
pub const DESCRIPTOR_KEY_FOR_AI_RESPONSE_TOKEN_COUNT: &str = "airesponsetokencount";
pub const DESCRIPTOR_KEY_FOR_AI_TOTAL_TOKEN_COUNT: &str = "aitotaltokencount";
pub const DESCRIPTOR_KEY_FOR_SUBSCRIPTION_BASED_AI_REQUEST_TOKEN_COUNT: &str =
    "airequesttokencountsubs";
pub const DESCRIPTOR_KEY_FOR_SUBSCRIPTION_BASED_AI_RESPONSE_TOKEN_COUNT: &str =
    "airesponsetokencountsubs";
pub const DESCRIPTOR_KEY_FOR_SUBSCRIPTION_BASED_AI_TOTAL_TOKEN_COUNT: &str =
    "aitotaltokencountsubs";
pub const DESCRIPTOR_KEY_FOR_AI_SUBSCRIPTION: &str = "subscription";

/// One accounting unit submitted to the external limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHit {
    pub key: String,
    pub value: String,
    pub hits: i64,
    pub child: Option<Box<RateLimitHit>>,
}

impl RateLimitHit {
    pub fn new(key: impl Into<String>, value: impl Into<String>, hits: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            hits,
            child: None,
        }
    }

    /// Nest `child` under this hit. The parent's own `hits` is left as given.
    pub fn with_child(mut self, child: RateLimitHit) -> Self {
        self.child = Some(Box::new(child));
        self
    }

    /// Weight actually applied by the limiter: the innermost hit's count.
    pub fn effective_hits(&self) -> i64 {
        match &self.child {
            Some(child) => child.effective_hits(),
            None => self.hits,
        }
    }
}

/// Counts submitted to the limiter are one less than measured, saturating at
/// `i64::MIN`.
fn weight(count: i64) -> i64 {
    count.saturating_sub(1)
}

/// Build the accounting batch for one extracted usage.
///
/// - backend accounting enabled on the route: three flat hits keyed by the
///   token descriptor names, valued with the route's descriptor value;
/// - org+policy and subscription descriptors both present on the event:
///   three subscription-scoped hits, each nesting a `subscription` child.
pub fn build_hits(
    usage: &Usage,
    session: &StreamSession,
    extraction: &ExtractionConfig,
) -> Vec<RateLimitHit> {
    let counts = [
        (
            DESCRIPTOR_KEY_FOR_AI_REQUEST_TOKEN_COUNT,
            DESCRIPTOR_KEY_FOR_SUBSCRIPTION_BASED_AI_REQUEST_TOKEN_COUNT,
            usage.prompt_tokens,
        ),
        (
            DESCRIPTOR_KEY_FOR_AI_RESPONSE_TOKEN_COUNT,
            DESCRIPTOR_KEY_FOR_SUBSCRIPTION_BASED_AI_RESPONSE_TOKEN_COUNT,
            usage.completion_tokens,
        ),
        (
            DESCRIPTOR_KEY_FOR_AI_TOTAL_TOKEN_COUNT,
            DESCRIPTOR_KEY_FOR_SUBSCRIPTION_BASED_AI_TOTAL_TOKEN_COUNT,
            usage.total_tokens,
        ),
    ];

    let mut hits = Vec::with_capacity(6);

    if session.backend_rate_limit_enabled {
        let descriptor = session.backend_rate_limit_descriptor.as_deref().unwrap_or_default();
        hits.extend(
            counts
                .iter()
                .map(|(key, _, count)| RateLimitHit::new(*key, descriptor, weight(*count))),
        );
    }

    if let Some((org_policy, subscription)) = extraction.subscription_descriptors() {
        hits.extend(counts.iter().map(|(_, key, count)| {
            RateLimitHit::new(*key, org_policy, weight(*count)).with_child(RateLimitHit::new(
                DESCRIPTOR_KEY_FOR_AI_SUBSCRIPTION,
                subscription,
                weight(*count),
            ))
        }));
    }

    hits
}
