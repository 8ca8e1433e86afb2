//! Rate limiting logic and state management.

mod acl;
mod behavior;
mod clock;
mod decision;
mod key;
mod limiter;
mod rules;
mod strategy;

pub use acl::{AccessList, AclStatus, ListKind};
pub use behavior::{BehaviorScorer, BehaviorSnapshot, MAX_MULTIPLIER, MIN_MULTIPLIER};
pub use clock::{to_datetime, Clock, ManualClock, SystemClock};
pub use decision::{
    EffectiveLimit, GlobalStats, RateLimitResult, Reason, RuleStats, Snapshot,
    BLACKLIST_RETRY_AFTER_SECS, STORE_FAILURE_RETRY_AFTER_SECS,
};
pub use key::{validate_identifier, ClientKey, KeyKind, MAX_IDENTIFIER_LEN};
pub use limiter::RateLimiter;
pub use rules::{default_rules, Rule, RuleConfig, RuleRegistry, RulesFile};
pub use strategy::{CounterState, Evaluation, Limits, Strategy, Usage};
