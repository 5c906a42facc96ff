//! In-process hit store.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{HitStore, WindowSnapshot};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::ratelimit::{in_window, HitLog, Sweep};

/// A [`HitStore`] living in this process.
///
/// Useful as a drop-in for the shared limiter when only one instance runs,
/// and as the reference behaviour the remote adapters are tested against.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    logs: DashMap<String, (HitLog, u64)>,
    sweep_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            logs: DashMap::new(),
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

#[async_trait]
impl HitStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn record_hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        retain: usize,
    ) -> Result<WindowSnapshot, StoreError> {
        let mut entry = self
            .logs
            .entry(key.to_string())
            .or_insert_with(|| (HitLog::new(), window_ms));
        let (log, window) = &mut *entry;

        log.prune(now_ms, window_ms);
        log.record(now_ms, retain);
        *window = window_ms;

        Ok(WindowSnapshot {
            count: log.len() as u64,
            oldest_ms: log.oldest(),
        })
    }
}

impl Sweep for MemoryStore {
    fn sweep_expired(&self) -> usize {
        let Some(_running) = self.sweep_lock.try_lock() else {
            return 0;
        };

        let now = self.clock.now_ms();
        let mut removed = 0;
        self.logs.retain(|_, (log, window_ms)| {
            let keep = log.newest().is_some_and(|t| in_window(t, now, *window_ms));
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_record_hit_prunes_and_counts() {
        let store = MemoryStore::new(Arc::new(ManualClock::new(0)));

        let snapshot = tokio_test::block_on(store.record_hit("k", 0, 1_000, 10)).unwrap();
        assert_eq!((snapshot.count, snapshot.oldest_ms), (1, Some(0)));

        tokio_test::block_on(store.record_hit("k", 400, 1_000, 10)).unwrap();
        let snapshot = tokio_test::block_on(store.record_hit("k", 1_000, 1_000, 10)).unwrap();
        assert_eq!((snapshot.count, snapshot.oldest_ms), (2, Some(400)));
    }

    #[test]
    fn test_record_hit_keeps_early_hits() {
        let store = MemoryStore::new(Arc::new(ManualClock::new(0)));

        tokio_test::block_on(store.record_hit("k", 0, 60_000, 10)).unwrap();
        let snapshot = tokio_test::block_on(store.record_hit("k", 20, 60_000, 10)).unwrap();
        assert_eq!((snapshot.count, snapshot.oldest_ms), (2, Some(0)));
    }

    #[test]
    fn test_record_hit_respects_retain() {
        let store = MemoryStore::new(Arc::new(ManualClock::new(0)));
        for t in 0..20 {
            tokio_test::block_on(store.record_hit("k", t, 1_000, 4)).unwrap();
        }
        let snapshot = tokio_test::block_on(store.record_hit("k", 20, 1_000, 4)).unwrap();
        assert_eq!(snapshot.count, 4);
        assert_eq!(snapshot.oldest_ms, Some(17));
    }

    #[test]
    fn test_sweep_drops_idle_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());

        tokio_test::block_on(store.record_hit("a", 0, 100, 10)).unwrap();
        tokio_test::block_on(store.record_hit("b", 0, 10_000, 10)).unwrap();

        clock.set(500);
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
