//! Admission decisions and their HTTP rendering.

use chrono::{DateTime, SecondsFormat};
use serde::Serialize;

/// HTTP status the request layer answers with when a check is denied.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// The outcome of a single limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request is admitted
    pub allowed: bool,
    /// The limit this check was evaluated against (after any adaptive scaling)
    pub limit: u32,
    /// Requests left in the current window, never negative
    pub remaining: u32,
    /// When the current window expires, epoch milliseconds
    pub reset_at_ms: u64,
    /// Seconds until the caller should retry, present only when denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl RateLimitResult {
    /// Build a result from the post-check window count.
    pub(crate) fn from_count(count: u64, limit: u32, reset_at_ms: u64, now_ms: u64) -> Self {
        let allowed = count <= limit as u64;
        let remaining = (limit as u64).saturating_sub(count) as u32;
        let retry_after_secs = if allowed {
            None
        } else {
            Some(retry_after_secs(reset_at_ms, now_ms))
        };

        Self {
            allowed,
            limit,
            remaining,
            reset_at_ms,
            retry_after_secs,
        }
    }

    /// HTTP status code for this decision.
    pub fn status_code(&self) -> u16 {
        if self.allowed {
            200
        } else {
            TOO_MANY_REQUESTS
        }
    }

    /// `X-RateLimit-Reset` value: the reset time as ISO-8601 (UTC).
    pub fn reset_at_iso8601(&self) -> String {
        DateTime::from_timestamp_millis(self.reset_at_ms as i64)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default()
    }

    /// Response headers describing this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at_iso8601()),
        ];
        if let Some(secs) = self.retry_after_secs {
            headers.push(("Retry-After", secs.to_string()));
        }
        headers
    }
}

/// `ceil((reset_at - now) / 1000)`, zero once the reset time has passed.
pub(crate) fn retry_after_secs(reset_at_ms: u64, now_ms: u64) -> u64 {
    reset_at_ms.saturating_sub(now_ms).div_ceil(1000)
}
