//! Request context and key derivation.
//!
//! Limiters never see a framework request type. The HTTP layer builds a
//! [`RequestContext`] and the limiter derives its grouping key through an
//! injected [`KeyExtractor`].

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Key used when no origin information is available at all.
pub const UNKNOWN_KEY: &str = "unknown";

/// A framework-agnostic view of an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Address of the directly connected peer
    pub peer_addr: Option<IpAddr>,
    /// Request headers, names lower-cased
    headers: HashMap<String, String>,
    /// Authenticated account, if any
    pub account_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Look up a header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Best-effort network origin of the caller.
    ///
    /// Prefers the first hop of `x-forwarded-for`, then `x-real-ip`, then the
    /// peer address.
    pub fn origin(&self) -> Option<String> {
        if let Some(forwarded) = self.header("x-forwarded-for") {
            let first = forwarded.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }

        if let Some(real_ip) = self.header("x-real-ip") {
            let real_ip = real_ip.trim();
            if !real_ip.is_empty() {
                return Some(real_ip.to_string());
            }
        }

        self.peer_addr.map(|addr| addr.to_string())
    }
}

type KeyFn = dyn Fn(&RequestContext) -> String + Send + Sync;

/// Maps a request to the string key its requests are grouped under.
#[derive(Clone)]
pub struct KeyExtractor {
    f: Arc<KeyFn>,
}

impl KeyExtractor {
    /// Build an extractor from an arbitrary function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Group by network origin.
    pub fn origin() -> Self {
        Self::new(|ctx| ctx.origin().unwrap_or_else(|| UNKNOWN_KEY.to_string()))
    }

    /// Group by account, falling back to network origin for anonymous callers.
    pub fn account() -> Self {
        Self::new(|ctx| match &ctx.account_id {
            Some(id) => format!("account:{}", id),
            None => ctx.origin().unwrap_or_else(|| UNKNOWN_KEY.to_string()),
        })
    }

    /// Namespace every key produced by this extractor.
    pub fn with_prefix(self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let inner = self.f;
        Self::new(move |ctx| format!("{}:{}", prefix, inner(ctx)))
    }

    /// Derive the key for a request.
    pub fn key_of(&self, ctx: &RequestContext) -> String {
        (self.f)(ctx)
    }
}

impl Default for KeyExtractor {
    fn default() -> Self {
        Self::origin()
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExtractor").finish_non_exhaustive()
    }
}
