//! Limiter trait shared by every algorithm and decorator.

use async_trait::async_trait;

use super::key::RequestContext;
use super::policy::{Outcome, RateLimitPolicy};
use super::result::RateLimitResult;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the in-memory limiters, the shared-store limiter
/// and the adaptive decorators so the request layer can hold any of them
/// behind an `Arc<dyn RateLimiterBackend>`.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// The base policy this limiter was built with.
    fn policy(&self) -> &RateLimitPolicy;

    /// Check a request against an explicit admission threshold.
    ///
    /// Decorators call this with a scaled limit; the base policy is never
    /// modified.
    async fn check_with_limit(
        &self,
        ctx: &RequestContext,
        outcome: Outcome,
        max_requests: u32,
    ) -> RateLimitResult;

    /// Check a request against the policy's own threshold.
    async fn check_limit(&self, ctx: &RequestContext, outcome: Outcome) -> RateLimitResult {
        let max_requests = self.policy().max_requests();
        self.check_with_limit(ctx, outcome, max_requests).await
    }
}
