//! Rate-limit client contract.

use super::RateLimitHit;
use crate::error::DispatchError;
use async_trait::async_trait;
use tracing::info;

/// Overall verdict returned by the limiter for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RateLimitDecision {
    Ok,
    OverLimit,
    Unknown,
}

/// External rate-limit service.
///
/// Implementations must be `Send + Sync`; one client is shared by every
/// stream in the process.
#[async_trait]
pub trait RateLimitClient: Send + Sync {
    /// Stable identifier used in logs.
    fn name(&self) -> &str;

    /// Record `hits` with the limiter and return its verdict.
    async fn should_rate_limit(
        &self,
        hits: &[RateLimitHit],
    ) -> Result<RateLimitDecision, DispatchError>;
}

/// Client used when no limiter endpoint is configured: logs each batch.
#[derive(Debug, Default)]
pub struct LoggingRateLimitClient;

impl LoggingRateLimitClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RateLimitClient for LoggingRateLimitClient {
    fn name(&self) -> &str {
        "logging"
    }

    async fn should_rate_limit(
        &self,
        hits: &[RateLimitHit],
    ) -> Result<RateLimitDecision, DispatchError> {
        for hit in hits {
            info!(
                key = %hit.key,
                value = %hit.value,
                child_key = hit.child.as_ref().map(|c| c.key.as_str()),
                child_value = hit.child.as_ref().map(|c| c.value.as_str()),
                hits = hit.effective_hits(),
                "rate-limit hit"
            );
        }
        Ok(RateLimitDecision::Ok)
    }
}
