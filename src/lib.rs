//! Turnstile - request admission control
//!
//! This crate decides whether a caller may proceed, independent of any web
//! framework. It provides fixed-window and sliding-window limiters, a
//! distributed limiter over a shared store (Redis or a gossip mesh) that
//! fails open, and decorators that tighten limits under load or for risky
//! origins.

pub mod clock;
pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;
pub mod store;
