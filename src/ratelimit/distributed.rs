//! Distributed rate limiter over a shared hit store.
//!
//! Uses the same sliding-window rules as [`SlidingWindowLimiter`], but the
//! hit log lives in a [`HitStore`] so every instance sharing the store
//! enforces one limit. The store round-trip is the only suspension point and
//! is bounded by a timeout; any store failure admits the request.
//!
//! [`SlidingWindowLimiter`]: super::SlidingWindowLimiter

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::key::{KeyExtractor, RequestContext};
use super::policy::{Outcome, RateLimitPolicy};
use super::result::RateLimitResult;
use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::HitStore;

/// Default bound on a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(150);

/// A rate limiter whose state lives in a shared store.
pub struct DistributedRateLimiter {
    policy: RateLimitPolicy,
    keys: KeyExtractor,
    clock: Arc<dyn Clock>,
    store: Arc<dyn HitStore>,
    timeout: Duration,
}

impl DistributedRateLimiter {
    pub fn new(
        policy: RateLimitPolicy,
        keys: KeyExtractor,
        clock: Arc<dyn Clock>,
        store: Arc<dyn HitStore>,
    ) -> Self {
        Self {
            policy,
            keys,
            clock,
            store,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Override the store round-trip timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check a request against the policy threshold.
    pub async fn check(&self, ctx: &RequestContext) -> RateLimitResult {
        let key = self.keys.key_of(ctx);
        self.check_key(&key, self.policy.max_requests()).await
    }

    /// Check an already-derived key against an explicit threshold.
    pub async fn check_key(&self, key: &str, max_requests: u32) -> RateLimitResult {
        let now = self.clock.now_ms();
        let window_ms = self.policy.window_ms();
        // History for the base limit is kept even when checked against a lower one
        let retain = self.policy.max_requests().max(max_requests) as usize + 1;

        trace!(
            key = %key,
            store = self.store.name(),
            limit = max_requests,
            "Checking distributed rate limit"
        );

        let call = self.store.record_hit(key, now, window_ms, retain);
        let snapshot = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => return self.fail_open(key, max_requests, now, &e),
            Err(_) => {
                let err = StoreError::Timeout(self.timeout);
                return self.fail_open(key, max_requests, now, &err);
            }
        };

        let reset_at = snapshot.oldest_ms.unwrap_or(now).saturating_add(window_ms);
        let result = RateLimitResult::from_count(snapshot.count, max_requests, reset_at, now);
        if !result.allowed {
            debug!(
                key = %key,
                count = snapshot.count,
                limit = max_requests,
                "Distributed rate limit exceeded"
            );
        }
        result
    }

    /// Admit the request when the store cannot answer.
    fn fail_open(
        &self,
        key: &str,
        max_requests: u32,
        now: u64,
        err: &StoreError,
    ) -> RateLimitResult {
        warn!(
            key = %key,
            store = self.store.name(),
            error = %err,
            "Counter store unavailable, failing open"
        );

        RateLimitResult {
            allowed: true,
            limit: max_requests,
            remaining: max_requests.saturating_sub(1),
            reset_at_ms: now.saturating_add(self.policy.window_ms()),
            retry_after_secs: None,
        }
    }
}

#[async_trait]
impl RateLimiterBackend for DistributedRateLimiter {
    fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    async fn check_with_limit(
        &self,
        ctx: &RequestContext,
        _outcome: Outcome,
        max_requests: u32,
    ) -> RateLimitResult {
        let key = self.keys.key_of(ctx);
        self.check_key(&key, max_requests).await
    }
}
