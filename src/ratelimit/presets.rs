//! Named limiter presets for common endpoint classes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::policy::RateLimitPolicy;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Which counting algorithm a limiter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// In-memory fixed window
    #[default]
    Fixed,
    /// In-memory sliding window
    Sliding,
    /// Sliding window in the configured shared store
    Shared,
}

/// Endpoint classes with a ready-made policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Sign-in: 5 failed attempts per 15 minutes, successes are free
    Auth,
    /// Password reset requests: 3 per hour
    PasswordReset,
    /// General API traffic: 100 per minute
    Api,
    /// Search queries: 30 per minute
    Search,
    /// File uploads: 10 per hour
    Upload,
    /// Contact form submissions: 5 per hour
    Contact,
}

impl Preset {
    pub const ALL: [Preset; 6] = [
        Preset::Auth,
        Preset::PasswordReset,
        Preset::Api,
        Preset::Search,
        Preset::Upload,
        Preset::Contact,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Auth => "auth",
            Preset::PasswordReset => "password_reset",
            Preset::Api => "api",
            Preset::Search => "search",
            Preset::Upload => "upload",
            Preset::Contact => "contact",
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        match self {
            Preset::Auth => RateLimitPolicy::preset(15 * MINUTE, 5, false, true),
            Preset::PasswordReset => RateLimitPolicy::preset(HOUR, 3, true, true),
            Preset::Api => RateLimitPolicy::preset(MINUTE, 100, true, true),
            Preset::Search => RateLimitPolicy::preset(MINUTE, 30, true, true),
            Preset::Upload => RateLimitPolicy::preset(HOUR, 10, true, true),
            Preset::Contact => RateLimitPolicy::preset(HOUR, 5, true, true),
        }
    }

    /// Steady API and search traffic gets the smoother sliding window.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Preset::Api | Preset::Search => Algorithm::Sliding,
            _ => Algorithm::Fixed,
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
