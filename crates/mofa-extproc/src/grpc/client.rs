//! Rate-limit client speaking `envoy.service.ratelimit.v3`.

use super::envoy::extensions::common::ratelimit::v3::{RateLimitDescriptor, rate_limit_descriptor};
use super::envoy::service::ratelimit::v3::rate_limit_response::Code;
use super::envoy::service::ratelimit::v3::rate_limit_service_client::RateLimitServiceClient;
use super::envoy::service::ratelimit::v3::RateLimitRequest;
use crate::error::DispatchError;
use crate::ratelimit::{RateLimitClient, RateLimitDecision, RateLimitHit};
use async_trait::async_trait;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Sends each batch as one `ShouldRateLimit` call.
///
/// The channel connects lazily, so an unreachable limiter surfaces as failed
/// batches instead of a startup error.
#[derive(Clone)]
pub struct GrpcRateLimitClient {
    client: RateLimitServiceClient<Channel>,
    domain: String,
}

impl GrpcRateLimitClient {
    pub fn new(
        endpoint: impl Into<String>,
        domain: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(endpoint.into())?
            .connect_timeout(connect_timeout)
            .connect_lazy();
        Ok(Self {
            client: RateLimitServiceClient::new(channel),
            domain: domain.into(),
        })
    }

    fn request(&self, hits: &[RateLimitHit]) -> RateLimitRequest {
        RateLimitRequest {
            domain: self.domain.clone(),
            descriptors: hits.iter().map(descriptor).collect(),
            hits_addend: 0,
        }
    }
}

/// Parent entry first, then the child's. The weight is carried per descriptor;
/// the wire type is unsigned, so negative weights go out as zero.
fn descriptor(hit: &RateLimitHit) -> RateLimitDescriptor {
    let mut entries = vec![rate_limit_descriptor::Entry {
        key: hit.key.clone(),
        value: hit.value.clone(),
    }];
    let mut child = hit.child.as_deref();
    while let Some(c) = child {
        entries.push(rate_limit_descriptor::Entry {
            key: c.key.clone(),
            value: c.value.clone(),
        });
        child = c.child.as_deref();
    }
    RateLimitDescriptor {
        entries,
        hits_addend: Some(hit.effective_hits().max(0) as u64),
    }
}

#[async_trait]
impl RateLimitClient for GrpcRateLimitClient {
    fn name(&self) -> &str {
        "grpc"
    }

    async fn should_rate_limit(
        &self,
        hits: &[RateLimitHit],
    ) -> Result<RateLimitDecision, DispatchError> {
        let response = self
            .client
            .clone()
            .should_rate_limit(self.request(hits))
            .await
            .map_err(|status| DispatchError::Client(status.to_string()))?;

        Ok(match response.into_inner().overall_code() {
            Code::Ok => RateLimitDecision::Ok,
            Code::OverLimit => RateLimitDecision::OverLimit,
            Code::Unknown => RateLimitDecision::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_hit_is_one_entry() {
        let d = descriptor(&RateLimitHit::new("aitotaltokencount", "backend-a", 14));
        assert_eq!(d.entries.len(), 1);
        assert_eq!(d.entries[0].key, "aitotaltokencount");
        assert_eq!(d.hits_addend, Some(14));
    }

    #[test]
    fn nested_hit_lists_parent_then_child() {
        let hit = RateLimitHit::new("airequesttokencountsubs", "org1-gold", 9)
            .with_child(RateLimitHit::new("subscription", "sub-42", 9));
        let d = descriptor(&hit);
        let pairs: Vec<_> = d.entries.iter().map(|e| (e.key.as_str(), e.value.as_str())).collect();
        assert_eq!(
            pairs,
            vec![("airequesttokencountsubs", "org1-gold"), ("subscription", "sub-42")]
        );
        assert_eq!(d.hits_addend, Some(9));
    }

    #[test]
    fn negative_weight_clamps_to_zero() {
        let d = descriptor(&RateLimitHit::new("airequesttokencount", "", -1));
        assert_eq!(d.hits_addend, Some(0));
    }

    #[tokio::test]
    async fn request_uses_configured_domain() {
        let client =
            GrpcRateLimitClient::new("http://127.0.0.1:1", "ai-gateway", Duration::from_millis(50))
                .unwrap();
        let req = client.request(&[RateLimitHit::new("a", "b", 1), RateLimitHit::new("c", "d", 2)]);
        assert_eq!(req.domain, "ai-gateway");
        assert_eq!(req.descriptors.len(), 2);
    }
}
