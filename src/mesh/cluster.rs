//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and gossip of per-node hit logs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::ratelimit::{in_window, HitLog, Sweep};
use crate::store::{HitStore, WindowSnapshot};

/// Prefix of every chitchat key holding a hit log.
const HIT_KEY_PREFIX: &str = "hits|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "turnstile".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600), // 1 hour
        }
    }
}

fn chitchat_key(key: &str) -> String {
    format!("{}{}", HIT_KEY_PREFIX, key)
}

fn encode_log(log: &HitLog) -> String {
    log.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(",")
}

fn decode_log(value: &str) -> HitLog {
    HitLog::from_timestamps(
        value
            .split(',')
            .filter_map(|t| t.trim().parse::<u64>().ok())
            .collect(),
    )
}

/// The cluster handle for distributed hit logs.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    clock: Arc<dyn Clock>,
    /// Keys this node has published, with (newest hit, window) for expiry
    published: Mutex<HashMap<String, (u64, u64)>>,
    sweep_lock: Mutex<()>,
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node using the system clock.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        Self::start_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Create and start a new cluster node.
    pub async fn start_with_clock(
        config: ClusterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            clock,
            published: Mutex::new(HashMap::new()),
            sweep_lock: Mutex::new(()),
            config,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Hits for a key inside the window ending now, summed over live nodes.
    pub async fn window_count(&self, key: &str, window_ms: u64) -> u64 {
        let now = self.clock.now_ms();
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        Self::window_across_nodes(&chitchat, &chitchat_key(key), now, window_ms).count
    }

    /// Sum every live node's log for a key over the window ending at `now_ms`.
    fn window_across_nodes(
        chitchat: &Chitchat,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> WindowSnapshot {
        let mut count = 0;
        let mut oldest: Option<u64> = None;

        for node_id in chitchat.live_nodes() {
            let Some(value) = chitchat.node_state(node_id).and_then(|state| state.get(key)) else {
                continue;
            };

            let log = decode_log(value);
            for hit in log.iter().filter(|&t| in_window(t, now_ms, window_ms)) {
                count += 1;
                oldest = Some(oldest.map_or(hit, |o| o.min(hit)));
            }
        }

        WindowSnapshot {
            count,
            oldest_ms: oldest,
        }
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl HitStore for Cluster {
    fn name(&self) -> &'static str {
        "mesh"
    }

    /// Atomic for this node: the chitchat lock is held from prune to count.
    /// Other nodes' hits become visible as gossip arrives.
    async fn record_hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        retain: usize,
    ) -> Result<WindowSnapshot, StoreError> {
        let chitchat_key = chitchat_key(key);

        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let mut log = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .map(decode_log)
            .unwrap_or_default();
        log.prune(now_ms, window_ms);
        log.record(now_ms, retain);
        chitchat
            .self_node_state()
            .set(&chitchat_key, encode_log(&log));

        self.published
            .lock()
            .insert(chitchat_key.clone(), (now_ms, window_ms));

        let snapshot = Self::window_across_nodes(&chitchat, &chitchat_key, now_ms, window_ms);

        debug!(
            key = %chitchat_key,
            local = log.len(),
            total = snapshot.count,
            "Recorded hit in mesh"
        );

        Ok(snapshot)
    }
}

impl Sweep for Cluster {
    /// Tombstone this node's logs whose newest hit has left its window.
    fn sweep_expired(&self) -> usize {
        let Some(_running) = self.sweep_lock.try_lock() else {
            return 0;
        };

        let chitchat_arc = self.handle.chitchat();
        // A check holds the lock right now; try again next round
        let Ok(mut chitchat) = chitchat_arc.try_lock() else {
            return 0;
        };

        let now = self.clock.now_ms();
        let mut published = self.published.lock();
        let expired: Vec<String> = published
            .iter()
            .filter(|(_, (newest, window_ms))| !in_window(*newest, now, *window_ms))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            chitchat.self_node_state().delete(key);
            published.remove(key);
        }

        if !expired.is_empty() {
            debug!(removed = expired.len(), "Swept expired mesh hit logs");
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn test_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_log_encoding() {
        let log = HitLog::from_timestamps(vec![1_000, 1_200, 1_100]);
        let encoded = encode_log(&log);
        assert_eq!(encoded, "1000,1100,1200");
        assert_eq!(decode_log(&encoded), log);
    }

    #[test]
    fn test_decode_skips_garbage() {
        let log = decode_log("5, x,3,,");
        assert_eq!(log.iter().collect::<Vec<_>>(), vec![3, 5]);
        assert!(decode_log("").is_empty());
    }

    #[tokio::test]
    async fn test_cluster_start() {
        let config = test_config(17946);
        let cluster = Cluster::start(config).await.unwrap();

        assert_eq!(cluster.node_id(), "test-node-17946");
        assert_eq!(cluster.live_node_count().await, 1); // Just ourselves

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_record_hit() {
        let config = test_config(17947);
        let cluster = Cluster::start(config).await.unwrap();

        let first = cluster.record_hit("k", 1_000, 1_000, 10).await.unwrap();
        assert_eq!((first.count, first.oldest_ms), (1, Some(1_000)));

        cluster.record_hit("k", 1_500, 1_000, 10).await.unwrap();
        let third = cluster.record_hit("k", 2_000, 1_000, 10).await.unwrap();
        // 1000 sits exactly on the cutoff and is pruned
        assert_eq!((third.count, third.oldest_ms), (2, Some(1_500)));

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_keeps_hits_before_first_full_window() {
        let cluster = Cluster::start(test_config(17952)).await.unwrap();

        cluster.record_hit("k", 0, 60_000, 10).await.unwrap();
        let second = cluster.record_hit("k", 20, 60_000, 10).await.unwrap();
        assert_eq!((second.count, second.oldest_ms), (2, Some(0)));

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_sweep_tombstones_expired_logs() {
        let clock = Arc::new(ManualClock::new(0));
        let cluster = Cluster::start_with_clock(test_config(17948), clock.clone())
            .await
            .unwrap();

        cluster.record_hit("old", 0, 100, 10).await.unwrap();
        cluster.record_hit("new", 0, 10_000, 10).await.unwrap();

        clock.set(500);
        assert_eq!(cluster.sweep_expired(), 1);
        assert_eq!(cluster.window_count("old", 100).await, 0);
        assert_eq!(cluster.window_count("new", 10_000).await, 1);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_two_nodes_share_window() {
        let clock = Arc::new(ManualClock::new(10_000));

        // Start first node
        let cluster1 = Cluster::start_with_clock(test_config(17949), clock.clone())
            .await
            .unwrap();

        // Start second node with first as seed
        let mut config2 = test_config(17950);
        config2.seed_nodes = vec!["127.0.0.1:17949".to_string()];
        let cluster2 = Cluster::start_with_clock(config2, clock.clone())
            .await
            .unwrap();

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(cluster1.live_node_count().await, 2);
        assert_eq!(cluster2.live_node_count().await, 2);

        for t in [9_100, 9_200, 9_300] {
            cluster1.record_hit("shared", t, 60_000, 100).await.unwrap();
        }

        // Give time for gossip
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snapshot = cluster2.record_hit("shared", 9_400, 60_000, 100).await.unwrap();
        assert_eq!(snapshot.count, 4, "node 2 should see node 1's hits");
        assert_eq!(snapshot.oldest_ms, Some(9_100));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cluster1.window_count("shared", 60_000).await, 4);

        cluster1.shutdown().await.unwrap();
        cluster2.shutdown().await.unwrap();
    }
}
