//! Sliding-window limiter: a pruned timestamp log per key.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::key::{KeyExtractor, RequestContext};
use super::policy::{Outcome, RateLimitPolicy};
use super::result::RateLimitResult;
use super::sweeper::Sweep;
use crate::clock::Clock;

/// Whether a hit at `hit_ms` still counts in the window ending at `now_ms`.
///
/// Written as `hit + window > now` so early timestamps are kept while
/// `now < window`.
pub(crate) fn in_window(hit_ms: u64, now_ms: u64, window_ms: u64) -> bool {
    hit_ms.saturating_add(window_ms) > now_ms
}

/// Ordered request timestamps for one key, oldest first.
///
/// Only the newest `retain` entries are kept. With `retain = max + 1` the
/// in-window count is exact up to `max + 1`, which is all an admission
/// decision needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitLog {
    hits: VecDeque<u64>,
}

impl HitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from stored timestamps, sorting them oldest first.
    pub fn from_timestamps(mut timestamps: Vec<u64>) -> Self {
        timestamps.sort_unstable();
        Self {
            hits: timestamps.into(),
        }
    }

    /// Drop every entry that has left the window ending at `now_ms`, i.e.
    /// every `t` with `t + window_ms <= now_ms`.
    pub fn prune(&mut self, now_ms: u64, window_ms: u64) {
        while self
            .hits
            .front()
            .is_some_and(|&t| !in_window(t, now_ms, window_ms))
        {
            self.hits.pop_front();
        }
    }

    /// Append a hit, then trim to the newest `retain` entries.
    pub fn record(&mut self, now_ms: u64, retain: usize) {
        self.hits.push_back(now_ms);
        while self.hits.len() > retain.max(1) {
            self.hits.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn oldest(&self) -> Option<u64> {
        self.hits.front().copied()
    }

    pub fn newest(&self) -> Option<u64> {
        self.hits.back().copied()
    }

    /// Number of entries inside the window ending at `now_ms`.
    pub fn count_in_window(&self, now_ms: u64, window_ms: u64) -> usize {
        self.hits
            .iter()
            .filter(|&&t| in_window(t, now_ms, window_ms))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.hits.iter().copied()
    }
}

/// Sliding-window rate limiter.
///
/// Every check is recorded, admitted or not, so a caller that keeps hammering
/// stays denied until its traffic actually slows down.
pub struct SlidingWindowLimiter {
    policy: RateLimitPolicy,
    keys: KeyExtractor,
    clock: Arc<dyn Clock>,
    logs: DashMap<String, HitLog>,
    sweep_lock: Mutex<()>,
}

impl SlidingWindowLimiter {
    pub fn new(policy: RateLimitPolicy, keys: KeyExtractor, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            keys,
            clock,
            logs: DashMap::new(),
            sweep_lock: Mutex::new(()),
        }
    }

    /// Check a request against the policy threshold.
    pub fn check(&self, ctx: &RequestContext) -> RateLimitResult {
        let key = self.keys.key_of(ctx);
        self.check_key(&key, self.policy.max_requests())
    }

    /// Check an already-derived key against an explicit threshold.
    pub fn check_key(&self, key: &str, max_requests: u32) -> RateLimitResult {
        let now = self.clock.now_ms();
        let window_ms = self.policy.window_ms();
        // History for the base limit is kept even when checked against a lower one
        let retain = self.policy.max_requests().max(max_requests) as usize + 1;

        let (count, oldest) = {
            let mut log = self.logs.entry(key.to_string()).or_insert_with(|| {
                debug!(key = %key, window_ms, "Creating new hit log");
                HitLog::new()
            });
            log.prune(now, window_ms);
            log.record(now, retain);
            (log.len() as u64, log.oldest().unwrap_or(now))
        };

        trace!(key = %key, count, limit = max_requests, "Checked sliding window");

        let reset_at = oldest.saturating_add(window_ms);
        let result = RateLimitResult::from_count(count, max_requests, reset_at, now);
        if !result.allowed {
            debug!(key = %key, count, limit = max_requests, "Rate limit exceeded");
        }
        result
    }

    /// Number of logged hits for a key that are still inside the window.
    pub fn hits_in_window(&self, key: &str) -> usize {
        let now = self.clock.now_ms();
        self.logs
            .get(key)
            .map(|log| log.count_in_window(now, self.policy.window_ms()))
            .unwrap_or(0)
    }

    pub fn reset(&self, key: &str) -> bool {
        self.logs.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.logs.clear();
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

impl Sweep for SlidingWindowLimiter {
    fn sweep_expired(&self) -> usize {
        let Some(_running) = self.sweep_lock.try_lock() else {
            return 0;
        };

        let now = self.clock.now_ms();
        let window_ms = self.policy.window_ms();
        let mut removed = 0;
        self.logs.retain(|_, log| {
            let keep = log.newest().is_some_and(|t| in_window(t, now, window_ms));
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed, remaining = self.logs.len(), "Swept idle hit logs");
        }
        removed
    }
}

#[async_trait]
impl RateLimiterBackend for SlidingWindowLimiter {
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
        self.check_key(&key, max_requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::MAX_WINDOW;
    use std::time::Duration;

    fn limiter(window_ms: u64, max: u32, clock: Arc<ManualClock>) -> SlidingWindowLimiter {
        let policy = RateLimitPolicy::new(Duration::from_millis(window_ms), max).unwrap();
        SlidingWindowLimiter::new(policy, KeyExtractor::origin(), clock)
    }

    fn ctx() -> RequestContext {
        RequestContext::new().with_header("x-forwarded-for", "192.0.2.1")
    }

    #[test]
    fn test_hit_log_prune_is_inclusive() {
        let mut log = HitLog::from_timestamps(vec![400, 1, 0, 900]);
        assert_eq!(log.oldest(), Some(0));

        log.prune(1_001, 1_000);
        assert_eq!(log.iter().collect::<Vec<_>>(), vec![400, 900]);
    }

    #[test]
    fn test_hit_log_retains_newest() {
        let mut log = HitLog::new();
        for t in 0..10 {
            log.record(t, 3);
        }
        assert_eq!(log.iter().collect::<Vec<_>>(), vec![7, 8, 9]);
        assert_eq!(log.newest(), Some(9));
    }

    #[test]
    fn test_hit_log_keeps_hits_before_first_full_window() {
        let mut log = HitLog::from_timestamps(vec![0, 400]);
        log.prune(500, 1_000);
        assert_eq!(log.len(), 2);
        assert_eq!(log.count_in_window(500, 1_000), 2);

        log.prune(1_000, 1_000);
        assert_eq!(log.iter().collect::<Vec<_>>(), vec![400]);
    }

    #[test]
    fn test_hits_at_time_zero_count_while_clock_is_early() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(60_000, 2, clock.clone());

        assert!(limiter.check_key("k", 2).allowed);
        clock.set(10);
        assert!(limiter.check_key("k", 2).allowed);
        clock.set(20);
        let result = limiter.check_key("k", 2);
        assert!(!result.allowed);
        assert_eq!(result.reset_at_ms, 60_000);
        assert_eq!(limiter.hits_in_window("k"), 3);
    }

    #[test]
    fn test_lowered_limit_does_not_forget_hits() {
        let clock = Arc::new(ManualClock::new(100_000));
        let limiter = limiter(60_000, 10, clock.clone());

        for t in 0..10 {
            clock.set(100_000 + t);
            assert!(limiter.check_key("k", 10).allowed);
        }

        // A load spike scales the limit down for one check
        clock.set(100_010);
        assert!(!limiter.check_key("k", 1).allowed);

        clock.set(100_011);
        let after = limiter.check_key("k", 10);
        assert!(!after.allowed, "an 11th request in one window was admitted");
        assert_eq!(after.remaining, 0);
        assert_eq!(limiter.hits_in_window("k"), 11);
    }

    #[test]
    fn test_largest_window_near_end_of_time() {
        let clock = Arc::new(ManualClock::new(u64::MAX - 5));
        let policy = RateLimitPolicy::new(MAX_WINDOW, 1).unwrap();
        let limiter = SlidingWindowLimiter::new(policy, KeyExtractor::origin(), clock);

        assert!(limiter.check_key("k", 1).allowed);
        let result = limiter.check_key("k", 1);
        assert!(!result.allowed);
        assert_eq!(result.reset_at_ms, u64::MAX);
    }

    #[test]
    fn test_sliding_window_boundary() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(1_000, 2, clock.clone());
        let ctx = ctx();

        let mut allowed = Vec::new();
        for t in [0, 400, 900] {
            clock.set(t);
            allowed.push(limiter.check(&ctx).allowed);
        }
        assert_eq!(allowed, vec![true, true, false]);

        // cutoff = 1, so the hit at 0 is pruned; 400, 900 and 1001 remain
        clock.set(1_001);
        let result = limiter.check(&ctx);
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.reset_at_ms, 1_400);
        assert_eq!(result.retry_after_secs, Some(1));
    }

    #[test]
    fn test_hit_exactly_at_cutoff_is_pruned() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(1_000, 1, clock.clone());
        let ctx = ctx();

        assert!(limiter.check(&ctx).allowed);

        clock.set(1_000);
        let result = limiter.check(&ctx);
        assert!(result.allowed);
        assert_eq!(result.reset_at_ms, 2_000);
    }

    #[test]
    fn test_reset_at_tracks_oldest_hit() {
        let clock = Arc::new(ManualClock::new(100));
        let limiter = limiter(1_000, 5, clock.clone());
        let ctx = ctx();

        assert_eq!(limiter.check(&ctx).reset_at_ms, 1_100);
        clock.set(600);
        let result = limiter.check(&ctx);
        assert_eq!(result.reset_at_ms, 1_100);
        assert_eq!(result.remaining, 3);
    }

    #[test]
    fn test_admitted_hits_never_exceed_max_in_any_window() {
        let clock = Arc::new(ManualClock::new(0));
        let window_ms = 1_000;
        let max = 4;
        let limiter = limiter(window_ms, max, clock.clone());
        let ctx = ctx();

        let mut admitted = Vec::new();
        let mut t = 0;
        while t < 5_000 {
            clock.set(t);
            if limiter.check(&ctx).allowed {
                admitted.push(t);
            }
            let in_window = admitted.iter().filter(|&&a| a + window_ms > t).count();
            assert!(in_window <= max as usize, "{} admitted in window ending {}", in_window, t);
            assert!(limiter.hits_in_window("192.0.2.1") <= max as usize + 1);
            t += 70;
        }
        assert!(!admitted.is_empty());
    }

    #[test]
    fn test_sweep_removes_idle_logs() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(1_000, 5, clock.clone());

        limiter.check(&RequestContext::new().with_header("x-forwarded-for", "10.0.0.1"));
        clock.set(600);
        limiter.check(&RequestContext::new().with_header("x-forwarded-for", "10.0.0.2"));

        clock.set(1_000);
        assert_eq!(limiter.sweep_expired(), 1);
        assert_eq!(limiter.len(), 1);

        clock.set(1_600);
        assert_eq!(limiter.sweep_expired(), 1);
        assert!(limiter.is_empty());
    }

    #[tokio::test]
    async fn test_outcome_is_ignored() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(1_000, 1, clock);
        let ctx = ctx();

        assert!(limiter.check_limit(&ctx, Outcome::Success).await.allowed);
        assert!(!limiter.check_limit(&ctx, Outcome::Success).await.allowed);
    }
}
