//! Shared counter stores.
//!
//! A [`HitStore`] holds sliding-window hit logs outside the limiter so that
//! several processes can enforce one limit. Adapters:
//!
//! - [`MemoryStore`] - in-process, for tests and single-node deployments
//! - [`RedisStore`] - sorted sets behind an atomic pipeline
//! - [`crate::mesh::Cluster`] - gossip-replicated logs, no central server

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, DEFAULT_KEY_PREFIX};

use async_trait::async_trait;

use crate::error::StoreError;

/// State of a key's window right after a hit was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Hits inside the window, including the one just recorded
    pub count: u64,
    /// Oldest hit still inside the window
    pub oldest_ms: Option<u64>,
}

/// A store that can record a hit in one atomic step.
#[async_trait]
pub trait HitStore: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Prune hits at or before `now_ms - window_ms`, record a hit at
    /// `now_ms`, keep at most `retain` newest hits, refresh the key's expiry
    /// and return the resulting window.
    ///
    /// The whole sequence must be atomic with respect to other callers
    /// recording hits for the same key.
    async fn record_hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        retain: usize,
    ) -> Result<WindowSnapshot, StoreError>;
}
