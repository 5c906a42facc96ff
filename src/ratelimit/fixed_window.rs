//! Fixed-window limiter: one counter per key, reset on a fixed schedule.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::key::{KeyExtractor, RequestContext};
use super::policy::{Outcome, RateLimitPolicy};
use super::result::RateLimitResult;
use super::sweeper::Sweep;
use crate::clock::Clock;

/// Counting state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRecord {
    /// Counted requests in the current window
    pub count: u64,
    /// Counted requests whose outcome was a failure
    pub failure_count: u64,
    /// When the current window began, epoch ms
    pub window_start_ms: u64,
    /// When the current window expires, epoch ms
    pub reset_at_ms: u64,
}

impl WindowRecord {
    fn open(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 0,
            failure_count: 0,
            window_start_ms: now_ms,
            reset_at_ms: now_ms.saturating_add(window_ms),
        }
    }

    /// A window stays open up to and including its reset instant.
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.reset_at_ms
    }
}

/// Fixed-window rate limiter.
///
/// Records live in a sharded map; the whole read-modify-write for one key
/// runs under that key's shard lock, so concurrent checks for the same key
/// never lose an increment.
pub struct FixedWindowLimiter {
    policy: RateLimitPolicy,
    keys: KeyExtractor,
    clock: Arc<dyn Clock>,
    records: DashMap<String, WindowRecord>,
    sweep_lock: Mutex<()>,
}

impl FixedWindowLimiter {
    pub fn new(policy: RateLimitPolicy, keys: KeyExtractor, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            keys,
            clock,
            records: DashMap::new(),
            sweep_lock: Mutex::new(()),
        }
    }

    /// Check a request against the policy threshold.
    pub fn check(&self, ctx: &RequestContext, outcome: Outcome) -> RateLimitResult {
        let key = self.keys.key_of(ctx);
        self.check_key(&key, outcome, self.policy.max_requests())
    }

    /// Check an already-derived key against an explicit threshold.
    pub fn check_key(&self, key: &str, outcome: Outcome, max_requests: u32) -> RateLimitResult {
        let now = self.clock.now_ms();
        let window_ms = self.policy.window_ms();
        let counted = self.policy.counts(outcome);

        let record = {
            let mut record = self.records.entry(key.to_string()).or_insert_with(|| {
                debug!(key = %key, window_ms, "Creating new window record");
                WindowRecord::open(now, window_ms)
            });

            if record.is_expired(now) {
                trace!(key = %key, count = record.count, "Window rolled over");
                *record = WindowRecord::open(now, window_ms);
            }

            if counted {
                record.count += 1;
                if outcome == Outcome::Failure {
                    record.failure_count += 1;
                }
            }

            *record
        };

        trace!(
            key = %key,
            outcome = ?outcome,
            counted,
            count = record.count,
            limit = max_requests,
            "Checked fixed window"
        );

        let result =
            RateLimitResult::from_count(record.count, max_requests, record.reset_at_ms, now);
        if !result.allowed {
            debug!(key = %key, count = record.count, limit = max_requests, "Rate limit exceeded");
        }
        result
    }

    /// Current record for a key, if one is stored.
    pub fn record(&self, key: &str) -> Option<WindowRecord> {
        self.records.get(key).map(|r| *r)
    }

    /// Forget a key, e.g. after a successful login.
    pub fn reset(&self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Sweep for FixedWindowLimiter {
    fn sweep_expired(&self) -> usize {
        let Some(_running) = self.sweep_lock.try_lock() else {
            return 0;
        };

        let now = self.clock.now_ms();
        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = record.reset_at_ms >= now;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "Swept expired window records");
        }
        removed
    }
}

#[async_trait]
impl RateLimiterBackend for FixedWindowLimiter {
    fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    async fn check_with_limit(
        &self,
        ctx: &RequestContext,
        outcome: Outcome,
        max_requests: u32,
    ) -> RateLimitResult {
        let key = self.keys.key_of(ctx);
        self.check_key(&key, outcome, max_requests)
    }
}
