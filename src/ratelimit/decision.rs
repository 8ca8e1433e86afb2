//! Values returned to callers of the engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::acl::AclStatus;
use super::clock::to_datetime;
use super::rules::Rule;
use super::strategy::{Evaluation, Limits, Strategy};

/// Seconds a blacklisted caller is told to wait.
pub const BLACKLIST_RETRY_AFTER_SECS: u64 = 3600;
/// Seconds a caller is told to wait when the store cannot be reached.
pub const STORE_FAILURE_RETRY_AFTER_SECS: u64 = 1;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reason {
    #[serde(rename = "blacklisted")]
    Blacklisted,
    #[serde(rename = "whitelisted")]
    Whitelisted,
    #[serde(rename = "rate limit exceeded")]
    LimitExceeded,
    #[serde(rename = "blocked")]
    Blocked,
    #[serde(rename = "store unavailable")]
    StoreUnavailable,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Blacklisted => "blacklisted",
            Reason::Whitelisted => "whitelisted",
            Reason::LimitExceeded => "rate limit exceeded",
            Reason::Blocked => "blocked",
            Reason::StoreUnavailable => "store unavailable",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of a `check()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Effective limit the request was measured against
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    /// Whole seconds to wait, set on denial
    pub retry_after: Option<u64>,
    pub reason: Option<Reason>,
    pub strategy_used: Strategy,
}

impl RateLimitResult {
    pub(crate) fn evaluated(rule: &Rule, limits: &Limits, evaluation: &Evaluation) -> Self {
        Self {
            allowed: evaluation.allowed,
            limit: limits.limit,
            remaining: evaluation.remaining,
            reset_time: to_datetime(evaluation.reset_at),
            retry_after: evaluation.retry_after,
            reason: (!evaluation.allowed).then_some(Reason::LimitExceeded),
            strategy_used: rule.strategy,
        }
    }

    pub(crate) fn blacklisted(rule: &Rule, now: f64) -> Self {
        Self {
            allowed: false,
            limit: rule.base_limit(),
            remaining: 0,
            reset_time: to_datetime(now + BLACKLIST_RETRY_AFTER_SECS as f64),
            retry_after: Some(BLACKLIST_RETRY_AFTER_SECS),
            reason: Some(Reason::Blacklisted),
            strategy_used: rule.strategy,
        }
    }

    pub(crate) fn whitelisted(rule: &Rule, now: f64) -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_time: to_datetime(now),
            retry_after: None,
            reason: Some(Reason::Whitelisted),
            strategy_used: rule.strategy,
        }
    }

    pub(crate) fn blocked(rule: &Rule, limit: u64, until: f64, now: f64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_time: to_datetime(until),
            retry_after: Some(((until - now).ceil().max(1.0)) as u64),
            reason: Some(Reason::Blocked),
            strategy_used: rule.strategy,
        }
    }

    pub(crate) fn store_unavailable(rule: &Rule, now: f64) -> Self {
        let allowed = rule.fail_open;
        Self {
            allowed,
            limit: rule.base_limit(),
            remaining: if allowed { rule.base_limit() } else { 0 },
            reset_time: to_datetime(now + STORE_FAILURE_RETRY_AFTER_SECS as f64),
            retry_after: (!allowed).then_some(STORE_FAILURE_RETRY_AFTER_SECS),
            reason: Some(Reason::StoreUnavailable),
            strategy_used: rule.strategy,
        }
    }

    /// Standard rate limit response headers for an HTTP layer.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_time.timestamp().to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers
    }
}

/// Limit an identifier would be evaluated against under a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "limit")]
pub enum EffectiveLimit {
    /// Whitelisted: evaluation is bypassed
    Unlimited,
    /// Blacklisted: always denied
    Denied,
    /// Scaled limit for everyone else
    Limited(u64),
}

/// Non-mutating usage view for one client key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub limit: u64,
    pub current_usage: u64,
    pub remaining: u64,
    pub window_seconds: u64,
    pub is_blocked: bool,
    pub block_until: Option<DateTime<Utc>>,
    pub strategy: Strategy,
    pub acl: AclStatus,
    pub multiplier: f64,
}

/// Per-rule breakdown in [`GlobalStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleStats {
    pub strategy: Strategy,
    pub max_requests: u64,
    pub window_seconds: u64,
    pub version: u32,
    pub active_limits: usize,
    pub blocked: usize,
}

/// Aggregate counts for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalStats {
    pub total_active_limits: usize,
    pub total_blocked: usize,
    pub whitelisted_count: usize,
    pub blacklisted_count: usize,
    pub tracked_identifiers: usize,
    pub per_rule_stats: BTreeMap<String, RuleStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::RuleConfig;

    fn rule() -> Rule {
        Rule::from_config(&RuleConfig {
            name: "r".to_string(),
            max_requests: 10,
            window_seconds: 60,
            strategy: Strategy::FixedWindow,
            block_duration: 0,
            burst_limit: 0,
            refill_rate: 0.0,
            fail_open: false,
        })
        .unwrap()
    }

    #[test]
    fn test_reason_serializes_as_text() {
        let json = serde_json::to_string(&Reason::LimitExceeded).unwrap();
        assert_eq!(json, "\"rate limit exceeded\"");
        assert_eq!(Reason::StoreUnavailable.to_string(), "store unavailable");
    }

    #[test]
    fn test_blacklisted_differs_from_exceeded() {
        let result = RateLimitResult::blacklisted(&rule(), 1_700_000_000.0);
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(Reason::Blacklisted));
        assert_eq!(result.retry_after, Some(BLACKLIST_RETRY_AFTER_SECS));
    }

    #[test]
    fn test_store_unavailable_fails_closed_by_default() {
        let mut rule = rule();
        let closed = RateLimitResult::store_unavailable(&rule, 1_700_000_000.0);
        assert!(!closed.allowed);
        assert_eq!(closed.retry_after, Some(1));

        rule.fail_open = true;
        let open = RateLimitResult::store_unavailable(&rule, 1_700_000_000.0);
        assert!(open.allowed);
        assert_eq!(open.reason, Some(Reason::StoreUnavailable));
        assert_eq!(open.retry_after, None);
    }

    #[test]
    fn test_headers() {
        let result = RateLimitResult::blocked(&rule(), 10, 1_700_000_030.0, 1_700_000_000.0);
        let headers = result.headers();
        assert!(headers.contains(&("X-RateLimit-Limit", "10".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
        assert!(headers.contains(&("X-RateLimit-Reset", "1700000030".to_string())));
        assert!(headers.contains(&("Retry-After", "30".to_string())));
    }
}
