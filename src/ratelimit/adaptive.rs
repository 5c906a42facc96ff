//! Adaptive decorators that scale the effective limit per check.
//!
//! A decorator wraps any [`RateLimiterBackend`] and hands it a reduced
//! threshold through [`RateLimiterBackend::check_with_limit`]. The inner
//! limiter's policy is never touched, so concurrent checks against a shared
//! instance cannot observe each other's adjustments. Decorators stack:
//! the reductions multiply. The effective limit is never below 1.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::key::RequestContext;
use super::policy::{Outcome, RateLimitPolicy};
use super::result::RateLimitResult;
use crate::clock::Clock;
use crate::error::{Result, TurnstileError};

/// Header a CDN sets with the caller's ISO country code.
pub const DEFAULT_COUNTRY_HEADER: &str = "cf-ipcountry";
/// Header an edge proxy sets when the caller comes through a VPN or proxy.
pub const DEFAULT_ANONYMIZED_HEADER: &str = "x-geo-anonymized";

fn scale(max_requests: u32, factor: f64) -> u32 {
    let scaled = (max_requests as f64 * factor).floor();
    if scaled < 1.0 {
        1
    } else {
        scaled as u32
    }
}

/// A source of the current load estimate, in `0.0..=1.0`.
pub trait LoadProbe: Send + Sync {
    fn sample(&self) -> f64;
}

/// Load measured as in-flight requests over a fixed capacity.
#[derive(Debug)]
pub struct InFlightProbe {
    in_flight: AtomicUsize,
    capacity: usize,
}

impl InFlightProbe {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TurnstileError::Misconfigured(
                "in-flight capacity must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            in_flight: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Mark a request as in flight until the guard is dropped.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            probe: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl LoadProbe for InFlightProbe {
    fn sample(&self) -> f64 {
        (self.in_flight() as f64 / self.capacity as f64).min(1.0)
    }
}

/// Decrements the probe's in-flight count on drop.
#[must_use = "the request stops counting as in flight when the guard is dropped"]
#[derive(Debug)]
pub struct InFlightGuard {
    probe: Arc<InFlightProbe>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shrinks the limit as load rises: `max * (1 - load * damping)`.
pub struct LoadAdaptive {
    inner: Arc<dyn RateLimiterBackend>,
    probe: Arc<dyn LoadProbe>,
    damping: f64,
    refresh_interval: Duration,
    clock: Arc<dyn Clock>,
    /// Last (load, sampled_at_ms)
    cached: Mutex<Option<(f64, u64)>>,
}

impl LoadAdaptive {
    /// `damping` must lie in `0.0..=1.0`.
    pub fn new(
        inner: Arc<dyn RateLimiterBackend>,
        probe: Arc<dyn LoadProbe>,
        damping: f64,
        refresh_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&damping) {
            return Err(TurnstileError::Misconfigured(format!(
                "load damping must be between 0 and 1, got {}",
                damping
            )));
        }

        Ok(Self {
            inner,
            probe,
            damping,
            refresh_interval,
            clock,
            cached: Mutex::new(None),
        })
    }

    /// The load estimate, re-sampled at most once per refresh interval.
    pub fn current_load(&self) -> f64 {
        let now = self.clock.now_ms();
        let refresh_ms = self.refresh_interval.as_millis() as u64;
        let mut cached = self.cached.lock();

        match *cached {
            Some((load, sampled_at)) if now.saturating_sub(sampled_at) < refresh_ms => load,
            _ => {
                let load = self.probe.sample();
                let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 0.0 };
                trace!(load, "Refreshed load estimate");
                *cached = Some((load, now));
                load
            }
        }
    }

    pub fn effective_limit(&self, max_requests: u32) -> u32 {
        scale(max_requests, 1.0 - self.current_load() * self.damping)
    }
}

#[async_trait]
impl RateLimiterBackend for LoadAdaptive {
    fn policy(&self) -> &RateLimitPolicy {
        self.inner.policy()
    }

    async fn check_with_limit(
        &self,
        ctx: &RequestContext,
        outcome: Outcome,
        max_requests: u32,
    ) -> RateLimitResult {
        let effective = self.effective_limit(max_requests);
        if effective < max_requests {
            debug!(base = max_requests, effective, "Load-adjusted limit");
        }
        self.inner.check_with_limit(ctx, outcome, effective).await
    }
}

/// Where a request appears to come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoInfo {
    /// Upper-case ISO 3166 country code
    pub country: Option<String>,
    /// Whether the caller is behind a VPN, proxy or anonymizing network
    pub anonymized: bool,
}

/// Resolves a request's origin.
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ctx: &RequestContext) -> Option<GeoInfo>;
}

/// Reads origin information that an edge proxy already attached as headers.
#[derive(Debug, Clone)]
pub struct HeaderGeoResolver {
    country_header: String,
    anonymized_header: String,
}

impl HeaderGeoResolver {
    pub fn new(country_header: impl Into<String>, anonymized_header: impl Into<String>) -> Self {
        Self {
            country_header: country_header.into(),
            anonymized_header: anonymized_header.into(),
        }
    }
}

impl Default for HeaderGeoResolver {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTRY_HEADER, DEFAULT_ANONYMIZED_HEADER)
    }
}

impl GeoResolver for HeaderGeoResolver {
    fn resolve(&self, ctx: &RequestContext) -> Option<GeoInfo> {
        let country = ctx
            .header(&self.country_header)
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty());
        let anonymized_flag = ctx.header(&self.anonymized_header);

        if country.is_none() && anonymized_flag.is_none() {
            return None;
        }

        let anonymized = anonymized_flag
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Some(GeoInfo {
            country,
            anonymized,
        })
    }
}

/// Reduction factors applied to risky origins.
#[derive(Debug, Clone)]
pub struct GeoPolicy {
    high_risk_regions: HashSet<String>,
    high_risk_factor: f64,
    anonymized_factor: f64,
}

impl GeoPolicy {
    /// Both factors must lie in `(0.0, 1.0]`.
    pub fn new<I, S>(
        high_risk_regions: I,
        high_risk_factor: f64,
        anonymized_factor: f64,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for (name, factor) in [
            ("high_risk_factor", high_risk_factor),
            ("anonymized_factor", anonymized_factor),
        ] {
            if !(factor > 0.0 && factor <= 1.0) {
                return Err(TurnstileError::Misconfigured(format!(
                    "{} must be in (0, 1], got {}",
                    name, factor
                )));
            }
        }

        Ok(Self {
            high_risk_regions: high_risk_regions
                .into_iter()
                .map(|r| r.as_ref().trim().to_ascii_uppercase())
                .collect(),
            high_risk_factor,
            anonymized_factor,
        })
    }

    /// Combined multiplier for an origin.
    pub fn factor(&self, geo: &GeoInfo) -> f64 {
        let mut factor = 1.0;
        if geo
            .country
            .as_ref()
            .is_some_and(|c| self.high_risk_regions.contains(c))
        {
            factor *= self.high_risk_factor;
        }
        if geo.anonymized {
            factor *= self.anonymized_factor;
        }
        factor
    }
}

/// Shrinks the limit for high-risk or anonymized origins.
pub struct GeoAdaptive {
    inner: Arc<dyn RateLimiterBackend>,
    resolver: Arc<dyn GeoResolver>,
    policy: GeoPolicy,
}

impl GeoAdaptive {
    pub fn new(
        inner: Arc<dyn RateLimiterBackend>,
        resolver: Arc<dyn GeoResolver>,
        policy: GeoPolicy,
    ) -> Self {
        Self {
            inner,
            resolver,
            policy,
        }
    }

    pub fn effective_limit(&self, ctx: &RequestContext, max_requests: u32) -> u32 {
        match self.resolver.resolve(ctx) {
            Some(geo) => scale(max_requests, self.policy.factor(&geo)),
            None => max_requests,
        }
    }
}

#[async_trait]
impl RateLimiterBackend for GeoAdaptive {
    fn policy(&self) -> &RateLimitPolicy {
        self.inner.policy()
    }

    async fn check_with_limit(
        &self,
        ctx: &RequestContext,
        outcome: Outcome,
        max_requests: u32,
    ) -> RateLimitResult {
        let effective = self.effective_limit(ctx, max_requests);
        if effective < max_requests {
            debug!(base = max_requests, effective, "Geo-adjusted limit");
        }
        self.inner.check_with_limit(ctx, outcome, effective).await
    }
}
