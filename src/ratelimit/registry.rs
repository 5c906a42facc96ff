//! Named limiter instances built once from configuration.
//!
//! The registry is constructed at process start and handed by reference to
//! whatever serves requests. It owns the background sweepers and the shared
//! store, and tears them down in [`Limiters::shutdown`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::adaptive::{
    GeoAdaptive, GeoPolicy, GeoResolver, HeaderGeoResolver, InFlightProbe, LoadAdaptive,
};
use super::backend::RateLimiterBackend;
use super::distributed::DistributedRateLimiter;
use super::fixed_window::FixedWindowLimiter;
use super::key::{KeyExtractor, RequestContext};
use super::policy::Outcome;
use super::presets::Algorithm;
use super::result::RateLimitResult;
use super::sliding_window::SlidingWindowLimiter;
use super::sweeper::{SweepHandle, Sweeper};
use crate::clock::Clock;
use crate::config::{KeyStrategy, MeshConfig, StoreConfig, TurnstileConfig};
use crate::error::{Result, TurnstileError};
use crate::mesh::{Cluster, ClusterConfig};
use crate::store::{HitStore, MemoryStore, RedisStore};

/// The process's rate limiters, by name.
pub struct Limiters {
    limiters: BTreeMap<String, Arc<dyn RateLimiterBackend>>,
    sweepers: Vec<SweepHandle>,
    load_probe: Arc<InFlightProbe>,
    cluster: Option<Arc<Cluster>>,
}

impl std::fmt::Debug for Limiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiters")
            .field("limiters", &self.limiters.keys().collect::<Vec<_>>())
            .field("sweepers", &self.sweepers.len())
            .finish_non_exhaustive()
    }
}

impl Limiters {
    /// Build every configured limiter and start its sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn from_config(config: &TurnstileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.sweep_interval_ms == 0 {
            return Err(TurnstileError::Misconfigured(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        let sweep_interval = config.sweep_interval();

        let load_probe = Arc::new(InFlightProbe::new(config.load.capacity)?);
        let refresh_interval = Duration::from_millis(config.load.refresh_interval_ms);

        let resolver: Arc<dyn GeoResolver> = Arc::new(HeaderGeoResolver::new(
            config.geo.country_header.clone(),
            config.geo.anonymized_header.clone(),
        ));
        let geo_policy = GeoPolicy::new(
            &config.geo.high_risk_regions,
            config.geo.high_risk_factor,
            config.geo.anonymized_factor,
        )?;

        let mut sweepers = Vec::new();
        let mut cluster = None;
        let mut shared_store: Option<Arc<dyn HitStore>> = None;
        let mut limiters = BTreeMap::new();

        for (name, settings) in &config.limiters {
            let policy = settings.policy(name)?;
            let keys = match settings.key {
                KeyStrategy::Origin => KeyExtractor::origin(),
                KeyStrategy::Account => KeyExtractor::account(),
            }
            .with_prefix(name.clone());

            let algorithm = settings.algorithm();
            let mut limiter: Arc<dyn RateLimiterBackend> = match algorithm {
                Algorithm::Fixed => {
                    let limiter =
                        Arc::new(FixedWindowLimiter::new(policy.clone(), keys, clock.clone()));
                    sweepers.push(Sweeper::spawn(name.clone(), limiter.clone(), sweep_interval));
                    limiter
                }
                Algorithm::Sliding => {
                    let limiter =
                        Arc::new(SlidingWindowLimiter::new(policy.clone(), keys, clock.clone()));
                    sweepers.push(Sweeper::spawn(name.clone(), limiter.clone(), sweep_interval));
                    limiter
                }
                Algorithm::Shared => {
                    let store = match &shared_store {
                        Some(store) => store.clone(),
                        None => {
                            let store = build_store(
                                config,
                                clock.clone(),
                                &mut sweepers,
                                &mut cluster,
                            )
                            .await?;
                            shared_store = Some(store.clone());
                            store
                        }
                    };
                    Arc::new(
                        DistributedRateLimiter::new(policy.clone(), keys, clock.clone(), store)
                            .with_timeout(config.store_timeout()),
                    )
                }
            };

            if let Some(damping) = settings.load_damping {
                limiter = Arc::new(LoadAdaptive::new(
                    limiter,
                    load_probe.clone(),
                    damping,
                    refresh_interval,
                    clock.clone(),
                )?);
            }

            if settings.geo {
                limiter = Arc::new(GeoAdaptive::new(limiter, resolver.clone(), geo_policy.clone()));
            }

            info!(
                limiter = %name,
                algorithm = ?algorithm,
                window_ms = policy.window_ms(),
                max_requests = policy.max_requests(),
                load_adaptive = settings.load_damping.is_some(),
                geo_adaptive = settings.geo,
                "Limiter ready"
            );
            limiters.insert(name.clone(), limiter);
        }

        Ok(Self {
            limiters,
            sweepers,
            load_probe,
            cluster,
        })
    }

    /// Every preset with its default policy, in memory.
    pub async fn with_presets(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_config(&TurnstileConfig::default(), clock).await
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RateLimiterBackend>> {
        self.limiters.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// The in-flight probe feeding every load-adaptive limiter.
    pub fn load_probe(&self) -> &Arc<InFlightProbe> {
        &self.load_probe
    }

    /// Check a request against the named limiter; `None` if no such limiter.
    pub async fn check(
        &self,
        name: &str,
        ctx: &RequestContext,
        outcome: Outcome,
    ) -> Option<RateLimitResult> {
        let limiter = self.limiters.get(name)?;
        Some(limiter.check_limit(ctx, outcome).await)
    }

    /// Stop sweepers and leave the gossip mesh.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            limiters,
            sweepers,
            cluster,
            ..
        } = self;

        for sweeper in sweepers {
            sweeper.stop().await;
        }
        drop(limiters);

        if let Some(cluster) = cluster {
            match Arc::try_unwrap(cluster) {
                Ok(cluster) => cluster.shutdown().await?,
                Err(_) => warn!("Limiters still in use elsewhere, leaving mesh without shutdown"),
            }
        }

        info!("Limiters shut down");
        Ok(())
    }
}

async fn build_store(
    config: &TurnstileConfig,
    clock: Arc<dyn Clock>,
    sweepers: &mut Vec<SweepHandle>,
    cluster: &mut Option<Arc<Cluster>>,
) -> Result<Arc<dyn HitStore>> {
    match &config.store {
        StoreConfig::Memory => {
            let store = Arc::new(MemoryStore::new(clock));
            sweepers.push(Sweeper::spawn("memory-store", store.clone(), config.sweep_interval()));
            info!("Using in-process shared store");
            Ok(store)
        }
        StoreConfig::Redis { url, key_prefix } => {
            let store = RedisStore::open(url, key_prefix.clone())?;
            info!(key_prefix = %key_prefix, "Using Redis shared store");
            Ok(Arc::new(store))
        }
        StoreConfig::Mesh(mesh) => {
            let node = Arc::new(Cluster::start_with_clock(cluster_config(mesh), clock).await?);
            sweepers.push(Sweeper::spawn("mesh-store", node.clone(), config.sweep_interval()));
            *cluster = Some(node.clone());
            Ok(node)
        }
    }
}

fn cluster_config(mesh: &MeshConfig) -> ClusterConfig {
    let defaults = ClusterConfig::default();
    ClusterConfig {
        node_id: mesh.node_id.clone().unwrap_or(defaults.node_id),
        listen_addr: mesh.listen_addr,
        advertise_addr: mesh.advertise_addr.unwrap_or(mesh.listen_addr),
        seed_nodes: mesh.seed_nodes.clone(),
        cluster_id: mesh.cluster_id.clone(),
        gossip_interval: Duration::from_millis(mesh.gossip_interval_ms),
        dead_node_grace_period: defaults.dead_node_grace_period,
    }
}
