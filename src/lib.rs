//! Ratewarden - Adaptive Multi-Strategy Rate Limiting Engine
//!
//! This crate decides, per request, whether a caller identified by an opaque
//! string may proceed under a named rule. Four strategies are supported
//! (fixed window, sliding window, token bucket and leaky bucket), and limits
//! are scaled per caller by an adaptive behavior score. Counter state lives
//! in a shared store so several engine instances enforce one limit.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
