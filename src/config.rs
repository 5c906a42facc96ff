//! Configuration management for turnstile.
//!
//! Settings come from a YAML file, overridden by `TURNSTILE__`-prefixed
//! environment variables (`TURNSTILE__STORE_TIMEOUT_MS=250`). Values are only
//! parsed here; [`Limiters::from_config`] validates them when building
//! limiters.
//!
//! [`Limiters::from_config`]: crate::ratelimit::Limiters::from_config

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    Algorithm, Preset, RateLimitPolicy, TimeUnit, DEFAULT_ANONYMIZED_HEADER,
    DEFAULT_COUNTRY_HEADER,
};

/// Main configuration for turnstile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// How often expired limiter state is garbage-collected
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Shared store used by `algorithm: shared` limiters
    #[serde(default)]
    pub store: StoreConfig,

    /// Bound on a single shared-store round-trip
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Load probe settings for load-adaptive limiters
    #[serde(default)]
    pub load: LoadConfig,

    /// Origin-risk settings for geo-adaptive limiters
    #[serde(default)]
    pub geo: GeoConfig,

    /// Limiters by name
    #[serde(default = "default_limiters")]
    pub limiters: BTreeMap<String, LimiterConfig>,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval(),
            store: StoreConfig::default(),
            store_timeout_ms: default_store_timeout(),
            load: LoadConfig::default(),
            geo: GeoConfig::default(),
            limiters: default_limiters(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60_000
}

fn default_store_timeout() -> u64 {
    150
}

fn default_limiters() -> BTreeMap<String, LimiterConfig> {
    Preset::ALL
        .iter()
        .map(|preset| (preset.name().to_string(), LimiterConfig::from_preset(*preset)))
        .collect()
}

/// Shared store selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Keep shared windows in this process
    #[default]
    Memory,
    /// A Redis server
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
    /// Gossip between turnstile instances
    Mesh(MeshConfig),
}

fn default_key_prefix() -> String {
    crate::store::DEFAULT_KEY_PREFIX.to_string()
}

/// Gossip mesh membership settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Unique node identifier; random when unset
    #[serde(default)]
    pub node_id: Option<String>,
    /// Address to listen on for gossip
    #[serde(default = "default_mesh_addr")]
    pub listen_addr: SocketAddr,
    /// Address advertised to peers; defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,
    /// Peers to bootstrap membership from
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,
}

fn default_mesh_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "turnstile".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

/// In-flight load probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// In-flight requests that count as full load
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Minimum time between load samples
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refresh_interval_ms: default_refresh_interval(),
        }
    }
}

fn default_capacity() -> usize {
    1024
}

fn default_refresh_interval() -> u64 {
    5_000
}

/// Origin-risk settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    #[serde(default = "default_country_header")]
    pub country_header: String,
    #[serde(default = "default_anonymized_header")]
    pub anonymized_header: String,
    /// ISO country codes treated as high risk
    #[serde(default)]
    pub high_risk_regions: Vec<String>,
    #[serde(default = "default_high_risk_factor")]
    pub high_risk_factor: f64,
    #[serde(default = "default_anonymized_factor")]
    pub anonymized_factor: f64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            country_header: default_country_header(),
            anonymized_header: default_anonymized_header(),
            high_risk_regions: Vec::new(),
            high_risk_factor: default_high_risk_factor(),
            anonymized_factor: default_anonymized_factor(),
        }
    }
}

fn default_country_header() -> String {
    DEFAULT_COUNTRY_HEADER.to_string()
}

fn default_anonymized_header() -> String {
    DEFAULT_ANONYMIZED_HEADER.to_string()
}

fn default_high_risk_factor() -> f64 {
    0.5
}

fn default_anonymized_factor() -> f64 {
    0.7
}

/// How a limiter groups requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Network origin address
    #[default]
    Origin,
    /// Account id, falling back to origin
    Account,
}

/// Settings for one named limiter.
///
/// Either name a `preset` or give `max_requests` plus `window_ms` (or
/// `unit`). Explicit fields override the preset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub preset: Option<Preset>,
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Shorthand for a one-unit window; ignored when `window_ms` is set
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    #[serde(default)]
    pub max_requests: Option<u32>,
    #[serde(default)]
    pub count_successes: Option<bool>,
    #[serde(default)]
    pub count_failures: Option<bool>,
    #[serde(default)]
    pub key: KeyStrategy,
    /// Enables load adaptation with this damping factor
    #[serde(default)]
    pub load_damping: Option<f64>,
    /// Enables geo adaptation
    #[serde(default)]
    pub geo: bool,
}

impl LimiterConfig {
    pub fn from_preset(preset: Preset) -> Self {
        Self {
            preset: Some(preset),
            ..Self::default()
        }
    }

    /// The algorithm to run: explicit, else the preset's, else fixed window.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
            .or_else(|| self.preset.map(|p| p.algorithm()))
            .unwrap_or_default()
    }

    /// Resolve the validated policy for the limiter called `name`.
    pub fn policy(&self, name: &str) -> Result<RateLimitPolicy> {
        let base = self.preset.map(|p| p.policy());

        let window = match (self.window_ms, self.unit) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, Some(unit)) => unit.duration(),
            (None, None) => base.as_ref().map(|p| p.window()).ok_or_else(|| {
                TurnstileError::Config(format!(
                    "limiter '{}' needs window_ms, unit or preset",
                    name
                ))
            })?,
        };

        let max_requests = match self.max_requests {
            Some(max) => max,
            None => base.as_ref().map(|p| p.max_requests()).ok_or_else(|| {
                TurnstileError::Config(format!("limiter '{}' needs max_requests or preset", name))
            })?,
        };

        let default_successes = base.as_ref().map_or(true, |p| p.counts_successes());
        let default_failures = base.as_ref().map_or(true, |p| p.counts_failures());

        let policy = RateLimitPolicy::new(window, max_requests)
            .map_err(|e| match e {
                TurnstileError::Misconfigured(msg) => {
                    TurnstileError::Misconfigured(format!("limiter '{}': {}", name, msg))
                }
                other => other,
            })?
            .count_successes(self.count_successes.unwrap_or(default_successes))
            .count_failures(self.count_failures.unwrap_or(default_failures));

        // Sliding logs record every request regardless of outcome
        let algorithm = self.algorithm();
        let filters_outcomes = !(policy.counts_successes() && policy.counts_failures());
        if filters_outcomes && algorithm != Algorithm::Fixed {
            return Err(TurnstileError::Misconfigured(format!(
                "limiter '{}': count_successes/count_failures need algorithm fixed, got {:?}",
                name, algorithm
            )));
        }

        Ok(policy)
    }
}

impl TurnstileConfig {
    /// Load configuration from a file, layered under environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Outcome;

    #[test]
    fn test_default_config_has_every_preset() {
        let config = TurnstileConfig::default();
        assert_eq!(config.limiters.len(), Preset::ALL.len());
        assert!(matches!(config.store, StoreConfig::Memory));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.store_timeout(), Duration::from_millis(150));
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
sweep_interval_ms: 1000
store:
  kind: redis
  url: redis://127.0.0.1:6379/
store_timeout_ms: 80
geo:
  high_risk_regions: [XX]
limiters:
  login:
    preset: auth
    key: account
  api:
    algorithm: shared
    unit: minute
    max_requests: 600
    load_damping: 0.5
    geo: true
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.sweep_interval_ms, 1000);
        assert_eq!(config.store_timeout_ms, 80);
        match &config.store {
            StoreConfig::Redis { url, key_prefix } => {
                assert_eq!(url, "redis://127.0.0.1:6379/");
                assert_eq!(key_prefix, "turnstile");
            }
            other => panic!("unexpected store {:?}", other),
        }
        assert_eq!(config.geo.high_risk_regions, vec!["XX".to_string()]);
        assert_eq!(config.geo.anonymized_factor, 0.7);

        // An explicit limiter map replaces the presets
        assert_eq!(config.limiters.len(), 2);

        let login = &config.limiters["login"];
        assert_eq!(login.key, KeyStrategy::Account);
        assert_eq!(login.algorithm(), Algorithm::Fixed);
        let policy = login.policy("login").unwrap();
        assert_eq!(policy.max_requests(), 5);
        assert!(!policy.counts(Outcome::Success));

        let api = &config.limiters["api"];
        assert_eq!(api.algorithm(), Algorithm::Shared);
        assert_eq!(api.load_damping, Some(0.5));
        assert!(api.geo);
        let policy = api.policy("api").unwrap();
        assert_eq!(policy.window(), Duration::from_secs(60));
        assert_eq!(policy.max_requests(), 600);
    }

    #[test]
    fn test_parse_mesh_store() {
        let yaml = r#"
store:
  kind: mesh
  listen_addr: 127.0.0.1:7946
  seed_nodes: ["10.0.0.2:7946"]
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        match config.store {
            StoreConfig::Mesh(mesh) => {
                assert_eq!(mesh.listen_addr.port(), 7946);
                assert_eq!(mesh.seed_nodes.len(), 1);
                assert_eq!(mesh.cluster_id, "turnstile");
                assert!(mesh.node_id.is_none());
            }
            other => panic!("unexpected store {:?}", other),
        }
    }

    #[test]
    fn test_preset_fields_can_be_overridden() {
        let limiter = LimiterConfig {
            preset: Some(Preset::Auth),
            max_requests: Some(10),
            count_successes: Some(true),
            ..LimiterConfig::default()
        };
        let policy = limiter.policy("auth").unwrap();
        assert_eq!(policy.max_requests(), 10);
        assert_eq!(policy.window(), Duration::from_secs(900));
        assert!(policy.counts(Outcome::Success));
    }

    #[test]
    fn test_limiter_without_window_rejected() {
        let limiter = LimiterConfig {
            max_requests: Some(10),
            ..LimiterConfig::default()
        };
        let err = limiter.policy("bare").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
        assert!(err.to_string().contains("bare"));
    }

    #[test]
    fn test_zero_max_is_misconfigured() {
        let limiter = LimiterConfig {
            window_ms: Some(1_000),
            max_requests: Some(0),
            ..LimiterConfig::default()
        };
        assert!(matches!(
            limiter.policy("zero"),
            Err(TurnstileError::Misconfigured(_))
        ));
    }

    #[test]
    fn test_outcome_filtering_needs_fixed_window() {
        let yaml = r#"
limiters:
  login:
    preset: auth
    algorithm: sliding
  signup:
    window_ms: 60000
    max_requests: 3
    count_failures: false
    algorithm: shared
  reset:
    preset: auth
    algorithm: shared
    count_successes: true
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        let err = config.limiters["login"].policy("login").unwrap_err();
        assert!(matches!(err, TurnstileError::Misconfigured(_)));
        assert!(err.to_string().contains("login"));
        assert!(matches!(
            config.limiters["signup"].policy("signup"),
            Err(TurnstileError::Misconfigured(_))
        ));

        // Counting every outcome works with any algorithm
        let policy = config.limiters["reset"].policy("reset").unwrap();
        assert!(policy.counts(Outcome::Success));
    }

    #[test]
    fn test_oversized_window_is_misconfigured() {
        let limiter = LimiterConfig {
            window_ms: Some(u64::MAX),
            max_requests: Some(1),
            ..LimiterConfig::default()
        };
        assert!(matches!(
            limiter.policy("huge"),
            Err(TurnstileError::Misconfigured(_))
        ));
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = TurnstileConfig::from_yaml("limiters: [").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "sweep_interval_ms: 2500\nlimiters:\n  search:\n    preset: search\n",
        )
        .unwrap();

        let config = TurnstileConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.sweep_interval_ms, 2500);
        assert_eq!(config.limiters["search"].algorithm(), Algorithm::Sliding);
    }
}
