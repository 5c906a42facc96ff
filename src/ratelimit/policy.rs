//! Limiter policy: window length, admission threshold and outcome counting.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Time unit shorthand accepted in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// The observed outcome of the request being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    /// Outcome not known yet; always counted
    #[default]
    Unknown,
    /// The guarded operation succeeded
    Success,
    /// The guarded operation failed (e.g. a wrong password)
    Failure,
}

impl From<Option<bool>> for Outcome {
    fn from(hint: Option<bool>) -> Self {
        match hint {
            None => Outcome::Unknown,
            Some(true) => Outcome::Success,
            Some(false) => Outcome::Failure,
        }
    }
}

/// Longest window a policy accepts.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 86_400);

/// Immutable per-limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    window: Duration,
    max_requests: u32,
    count_successes: bool,
    count_failures: bool,
}

impl RateLimitPolicy {
    /// Create a policy that counts every outcome.
    ///
    /// Fails with [`TurnstileError::Misconfigured`] when the window is shorter
    /// than one millisecond or longer than [`MAX_WINDOW`], or when
    /// `max_requests` is zero.
    pub fn new(window: Duration, max_requests: u32) -> Result<Self> {
        if window.as_millis() == 0 {
            return Err(TurnstileError::Misconfigured(format!(
                "window must be at least 1ms, got {:?}",
                window
            )));
        }
        if window > MAX_WINDOW {
            return Err(TurnstileError::Misconfigured(format!(
                "window must be at most {:?}, got {:?}",
                MAX_WINDOW, window
            )));
        }
        if max_requests == 0 {
            return Err(TurnstileError::Misconfigured(
                "max_requests must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            window,
            max_requests,
            count_successes: true,
            count_failures: true,
        })
    }

    /// Build a policy from known-good constants.
    pub(crate) const fn preset(
        window: Duration,
        max_requests: u32,
        count_successes: bool,
        count_failures: bool,
    ) -> Self {
        Self {
            window,
            max_requests,
            count_successes,
            count_failures,
        }
    }

    /// Whether successful requests consume the budget.
    pub fn count_successes(mut self, yes: bool) -> Self {
        self.count_successes = yes;
        self
    }

    /// Whether failed requests consume the budget.
    pub fn count_failures(mut self, yes: bool) -> Self {
        self.count_failures = yes;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn counts_successes(&self) -> bool {
        self.count_successes
    }

    pub fn counts_failures(&self) -> bool {
        self.count_failures
    }

    /// Decide whether an observation with this outcome increments the counter.
    pub fn counts(&self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Unknown => true,
            Outcome::Success => self.count_successes,
            Outcome::Failure => self.count_failures,
        }
    }
}
