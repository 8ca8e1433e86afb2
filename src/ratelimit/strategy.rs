//! Admission-control strategies.
//!
//! Each strategy is a pure transition from the stored [`CounterState`] and the
//! current instant to a new state plus an [`Evaluation`]. Stores are
//! responsible for applying the transition atomically; the Redis store runs
//! the same arithmetic as Lua scripts (see `store::scripts`).

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tolerance for floating point token arithmetic.
const EPSILON: f64 = 1e-9;

/// Admission-control algorithm used by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Counter reset at aligned window boundaries
    FixedWindow,
    /// Timestamp log over a trailing window
    SlidingWindow,
    /// Refilling bucket of tokens, one consumed per request
    TokenBucket,
    /// Draining bucket, one unit added per request
    LeakyBucket,
}

/// Parameters a strategy evaluates against.
///
/// `limit` is already scaled by the adaptive multiplier. For bucket strategies
/// it is the capacity and `rate` the refill/leak rate per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub limit: u64,
    pub window_secs: u64,
    pub rate: f64,
}

/// Strategy-specific state held in the store for one client key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CounterState {
    Window { start: u64, count: u64 },
    Log(VecDeque<f64>),
    Bucket { tokens: f64, last_refill: f64 },
    Leaky { level: f64, last_leak: f64 },
}

/// Outcome of one permit-consuming evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub allowed: bool,
    pub remaining: u64,
    /// Epoch seconds at which the counter is fully replenished
    pub reset_at: f64,
    /// Whole seconds to wait before retrying, set on denial
    pub retry_after: Option<u64>,
}

/// Read-only view of a counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub current: u64,
    pub remaining: u64,
    pub reset_at: f64,
}

impl Strategy {
    /// All strategies, in declaration order.
    pub const ALL: [Strategy; 4] = [
        Strategy::FixedWindow,
        Strategy::SlidingWindow,
        Strategy::TokenBucket,
        Strategy::LeakyBucket,
    ];

    /// The configuration name of this strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed_window",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::TokenBucket => "token_bucket",
            Strategy::LeakyBucket => "leaky_bucket",
        }
    }

    /// Whether this strategy is parameterised by a capacity and a rate.
    pub fn is_bucket(&self) -> bool {
        matches!(self, Strategy::TokenBucket | Strategy::LeakyBucket)
    }

    /// Seconds an idle counter for this strategy is kept before expiring.
    pub fn ttl_secs(&self, limits: &Limits) -> u64 {
        let window = limits.window_secs.max(1);
        match self {
            Strategy::FixedWindow | Strategy::SlidingWindow => window * 2,
            Strategy::TokenBucket | Strategy::LeakyBucket => {
                let drain = if limits.rate > 0.0 {
                    (2.0 * limits.limit as f64 / limits.rate).ceil() as u64
                } else {
                    0
                };
                drain.max(window).max(1)
            }
        }
    }

    /// Apply one request to `state` at instant `now`.
    ///
    /// A missing state, or a state left behind by a different strategy, is
    /// treated as first-seen.
    pub fn evaluate(
        &self,
        state: Option<CounterState>,
        limits: &Limits,
        now: f64,
    ) -> (CounterState, Evaluation) {
        match self {
            Strategy::FixedWindow => fixed_window(state, limits, now),
            Strategy::SlidingWindow => sliding_window(state, limits, now),
            Strategy::TokenBucket => token_bucket(state, limits, now),
            Strategy::LeakyBucket => leaky_bucket(state, limits, now),
        }
    }

    /// Describe usage of `state` at `now` without consuming a permit.
    pub fn usage(&self, state: Option<&CounterState>, limits: &Limits, now: f64) -> Usage {
        let limit = limits.limit;
        match self {
            Strategy::FixedWindow => {
                let (start, window) = window_bounds(limits, now);
                let count = match state {
                    Some(CounterState::Window { start: s, count }) if *s == start => *count,
                    _ => 0,
                };
                Usage {
                    current: count,
                    remaining: limit.saturating_sub(count),
                    reset_at: (start + window) as f64,
                }
            }
            Strategy::SlidingWindow => {
                let window = limits.window_secs as f64;
                let cutoff = now - window;
                let live: Vec<f64> = match state {
                    Some(CounterState::Log(log)) => {
                        log.iter().copied().filter(|t| *t > cutoff).collect()
                    }
                    _ => Vec::new(),
                };
                let count = live.len() as u64;
                let reset_at = live.first().map(|t| t + window).unwrap_or(now + window);
                Usage {
                    current: count,
                    remaining: limit.saturating_sub(count),
                    reset_at,
                }
            }
            Strategy::TokenBucket => {
                let capacity = limit as f64;
                let tokens = match state {
                    Some(CounterState::Bucket {
                        tokens,
                        last_refill,
                    }) => refill(*tokens, *last_refill, capacity, limits.rate, now),
                    _ => capacity,
                };
                let remaining = floor_u64(tokens + EPSILON);
                Usage {
                    current: limit.saturating_sub(remaining),
                    remaining,
                    reset_at: now + seconds_at_rate(capacity - tokens, limits.rate),
                }
            }
            Strategy::LeakyBucket => {
                let capacity = limit as f64;
                let level = match state {
                    Some(CounterState::Leaky { level, last_leak }) => {
                        drain(*level, *last_leak, limits.rate, now)
                    }
                    _ => 0.0,
                };
                Usage {
                    current: (level - EPSILON).ceil().max(0.0) as u64,
                    remaining: floor_u64(capacity - level + EPSILON),
                    reset_at: now + seconds_at_rate(level, limits.rate),
                }
            }
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| format!("unknown strategy '{}'", s))
    }
}

fn window_bounds(limits: &Limits, now: f64) -> (u64, u64) {
    let window = limits.window_secs.max(1);
    let start = (now.max(0.0) as u64 / window) * window;
    (start, window)
}

fn fixed_window(
    state: Option<CounterState>,
    limits: &Limits,
    now: f64,
) -> (CounterState, Evaluation) {
    let (start, window) = window_bounds(limits, now);
    let reset_at = (start + window) as f64;

    // Entries from an earlier window are ignored rather than carried over.
    let count = match state {
        Some(CounterState::Window { start: s, count }) if s == start => count,
        _ => 0,
    };

    if count >= limits.limit {
        return (
            CounterState::Window { start, count },
            denied(reset_at, (reset_at - now).ceil()),
        );
    }

    let count = count + 1;
    (
        CounterState::Window { start, count },
        Evaluation {
            allowed: true,
            remaining: limits.limit - count,
            reset_at,
            retry_after: None,
        },
    )
}

fn sliding_window(
    state: Option<CounterState>,
    limits: &Limits,
    now: f64,
) -> (CounterState, Evaluation) {
    let window = limits.window_secs as f64;
    let cutoff = now - window;

    let mut log = match state {
        Some(CounterState::Log(log)) => log,
        _ => VecDeque::new(),
    };
    while log.front().is_some_and(|t| *t <= cutoff) {
        log.pop_front();
    }

    let count = log.len() as u64;
    let reset_at = log.front().map(|t| t + window).unwrap_or(now + window);

    if count >= limits.limit {
        let retry = (reset_at - now).ceil();
        return (CounterState::Log(log), denied(reset_at, retry));
    }

    log.push_back(now);
    (
        CounterState::Log(log),
        Evaluation {
            allowed: true,
            remaining: limits.limit - count - 1,
            reset_at,
            retry_after: None,
        },
    )
}

fn token_bucket(
    state: Option<CounterState>,
    limits: &Limits,
    now: f64,
) -> (CounterState, Evaluation) {
    let capacity = limits.limit as f64;
    let tokens = match state {
        Some(CounterState::Bucket {
            tokens,
            last_refill,
        }) => refill(tokens, last_refill, capacity, limits.rate, now),
        _ => capacity,
    };

    if tokens + EPSILON >= 1.0 {
        let tokens = (tokens - 1.0).max(0.0);
        return (
            CounterState::Bucket {
                tokens,
                last_refill: now,
            },
            Evaluation {
                allowed: true,
                remaining: floor_u64(tokens + EPSILON),
                reset_at: now + seconds_at_rate(capacity - tokens, limits.rate),
                retry_after: None,
            },
        );
    }

    let reset_at = now + seconds_at_rate(capacity - tokens, limits.rate);
    (
        CounterState::Bucket {
            tokens,
            last_refill: now,
        },
        denied(reset_at, one_unit_wait(limits.rate)),
    )
}

fn leaky_bucket(
    state: Option<CounterState>,
    limits: &Limits,
    now: f64,
) -> (CounterState, Evaluation) {
    let capacity = limits.limit as f64;
    let level = match state {
        Some(CounterState::Leaky { level, last_leak }) => drain(level, last_leak, limits.rate, now),
        _ => 0.0,
    };

    if level + EPSILON < capacity {
        let level = level + 1.0;
        return (
            CounterState::Leaky {
                level,
                last_leak: now,
            },
            Evaluation {
                allowed: true,
                remaining: floor_u64(capacity - level + EPSILON),
                reset_at: now + seconds_at_rate(level, limits.rate),
                retry_after: None,
            },
        );
    }

    let reset_at = now + seconds_at_rate(level, limits.rate);
    (
        CounterState::Leaky {
            level,
            last_leak: now,
        },
        denied(reset_at, one_unit_wait(limits.rate)),
    )
}

fn refill(tokens: f64, last_refill: f64, capacity: f64, rate: f64, now: f64) -> f64 {
    let elapsed = (now - last_refill).max(0.0);
    (tokens + elapsed * rate).min(capacity)
}

fn drain(level: f64, last_leak: f64, rate: f64, now: f64) -> f64 {
    let elapsed = (now - last_leak).max(0.0);
    (level - elapsed * rate).max(0.0)
}

fn seconds_at_rate(units: f64, rate: f64) -> f64 {
    if rate > 0.0 {
        units.max(0.0) / rate
    } else {
        0.0
    }
}

fn one_unit_wait(rate: f64) -> f64 {
    if rate > 0.0 {
        (1.0 / rate).ceil()
    } else {
        1.0
    }
}

fn denied(reset_at: f64, retry_after: f64) -> Evaluation {
    Evaluation {
        allowed: false,
        remaining: 0,
        reset_at,
        retry_after: Some((retry_after.max(1.0)) as u64),
    }
}

fn floor_u64(value: f64) -> u64 {
    value.floor().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    // Aligned to both 10 and 60 second windows.
    const T0: f64 = 1_700_000_040.0;

    fn limits(limit: u64, window_secs: u64, rate: f64) -> Limits {
        Limits {
            limit,
            window_secs,
            rate,
        }
    }

    fn run(
        strategy: Strategy,
        state: &mut Option<CounterState>,
        limits: &Limits,
        now: f64,
    ) -> Evaluation {
        let (next, eval) = strategy.evaluate(state.take(), limits, now);
        *state = Some(next);
        eval
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.as_str().parse::<Strategy>().unwrap(), strategy);
        }
        assert!("round_robin".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_fixed_window_limit_and_retry_after() {
        let l = limits(5, 60, 0.0);
        let mut state = None;

        for (i, expected) in [4, 3, 2, 1, 0].into_iter().enumerate() {
            let eval = run(Strategy::FixedWindow, &mut state, &l, T0 + i as f64);
            assert!(eval.allowed, "request {} should be allowed", i + 1);
            assert_eq!(eval.remaining, expected);
        }

        let eval = run(Strategy::FixedWindow, &mut state, &l, T0 + 5.0);
        assert!(!eval.allowed);
        assert_eq!(eval.remaining, 0);
        assert_eq!(eval.retry_after, Some(55));
        assert_eq!(eval.reset_at, T0 + 60.0);
    }

    #[test]
    fn test_fixed_window_resets_at_boundary() {
        let l = limits(2, 10, 0.0);
        let mut state = None;

        assert!(run(Strategy::FixedWindow, &mut state, &l, T0 + 1.0).allowed);
        assert!(run(Strategy::FixedWindow, &mut state, &l, T0 + 2.0).allowed);
        assert!(!run(Strategy::FixedWindow, &mut state, &l, T0 + 3.0).allowed);

        let eval = run(Strategy::FixedWindow, &mut state, &l, T0 + 10.0);
        assert!(eval.allowed);
        assert_eq!(eval.remaining, 1);
    }

    #[test]
    fn test_sliding_window_expires_oldest_entries() {
        let l = limits(2, 10, 0.0);
        let mut state = None;

        assert!(run(Strategy::SlidingWindow, &mut state, &l, T0).allowed);
        assert!(run(Strategy::SlidingWindow, &mut state, &l, T0 + 4.0).allowed);

        let eval = run(Strategy::SlidingWindow, &mut state, &l, T0 + 9.0);
        assert!(!eval.allowed);
        assert_eq!(eval.retry_after, Some(1));

        // The first entry has aged out, the second has not.
        let eval = run(Strategy::SlidingWindow, &mut state, &l, T0 + 10.0);
        assert!(eval.allowed);
        assert_eq!(eval.remaining, 0);
        assert!(!run(Strategy::SlidingWindow, &mut state, &l, T0 + 10.5).allowed);
    }

    #[test]
    fn test_boundary_burst_fixed_admits_sliding_denies() {
        let l = limits(5, 10, 0.0);
        let mut fixed = None;
        let mut sliding = None;

        // Five requests at the end of one window, five at the start of the next.
        let mut fixed_allowed = 0;
        let mut sliding_allowed = 0;
        for i in 0..10 {
            let now = if i < 5 { T0 + 9.5 } else { T0 + 10.0 };
            if run(Strategy::FixedWindow, &mut fixed, &l, now).allowed {
                fixed_allowed += 1;
            }
            if run(Strategy::SlidingWindow, &mut sliding, &l, now).allowed {
                sliding_allowed += 1;
            }
        }

        assert_eq!(fixed_allowed, 10);
        assert_eq!(sliding_allowed, 5);
    }

    #[test]
    fn test_token_bucket_burst_then_refill() {
        let l = limits(10, 10, 1.0);
        let mut state = None;

        for expected in (0..10).rev() {
            let eval = run(Strategy::TokenBucket, &mut state, &l, T0);
            assert!(eval.allowed);
            assert_eq!(eval.remaining, expected);
        }

        let eval = run(Strategy::TokenBucket, &mut state, &l, T0);
        assert!(!eval.allowed);
        assert_eq!(eval.retry_after, Some(1));

        assert!(run(Strategy::TokenBucket, &mut state, &l, T0 + 1.0).allowed);
        assert!(!run(Strategy::TokenBucket, &mut state, &l, T0 + 1.0).allowed);
    }

    #[test]
    fn test_token_bucket_never_exceeds_capacity() {
        let l = limits(3, 3, 1.0);
        let mut state = None;

        for _ in 0..3 {
            assert!(run(Strategy::TokenBucket, &mut state, &l, T0).allowed);
        }

        let later = T0 + 10_000.0;
        let allowed = (0..10)
            .filter(|_| run(Strategy::TokenBucket, &mut state, &l, later).allowed)
            .count();
        assert_eq!(allowed, 3);
    }

    #[test]
    fn test_token_bucket_retry_after_for_slow_rate() {
        let l = limits(1, 60, 0.25);
        let mut state = None;

        assert!(run(Strategy::TokenBucket, &mut state, &l, T0).allowed);
        let eval = run(Strategy::TokenBucket, &mut state, &l, T0);
        assert_eq!(eval.retry_after, Some(4));
    }

    #[test]
    fn test_leaky_bucket_drains_one_slot() {
        let l = limits(4, 4, 2.0);
        let mut state = None;

        for expected in [3, 2, 1, 0] {
            let eval = run(Strategy::LeakyBucket, &mut state, &l, T0);
            assert!(eval.allowed);
            assert_eq!(eval.remaining, expected);
        }
        let eval = run(Strategy::LeakyBucket, &mut state, &l, T0);
        assert!(!eval.allowed);
        assert_eq!(eval.retry_after, Some(1));

        // 1 / rate = 0.5s frees exactly one slot.
        assert!(run(Strategy::LeakyBucket, &mut state, &l, T0 + 0.5).allowed);
        assert!(!run(Strategy::LeakyBucket, &mut state, &l, T0 + 0.5).allowed);
    }

    #[test]
    fn test_mismatched_state_is_treated_as_fresh() {
        let l = limits(3, 60, 1.0);
        let stale = Some(CounterState::Window {
            start: 0,
            count: 99,
        });

        let (state, eval) = Strategy::TokenBucket.evaluate(stale, &l, T0);
        assert!(eval.allowed);
        assert_eq!(eval.remaining, 2);
        assert!(matches!(state, CounterState::Bucket { .. }));
    }

    #[test]
    fn test_usage_does_not_consume() {
        let l = limits(5, 60, 0.0);
        let mut state = None;
        run(Strategy::SlidingWindow, &mut state, &l, T0);
        run(Strategy::SlidingWindow, &mut state, &l, T0 + 1.0);

        let usage = Strategy::SlidingWindow.usage(state.as_ref(), &l, T0 + 2.0);
        assert_eq!(usage.current, 2);
        assert_eq!(usage.remaining, 3);
        assert_eq!(usage.reset_at, T0 + 60.0);

        let usage = Strategy::SlidingWindow.usage(state.as_ref(), &l, T0 + 61.0);
        assert_eq!(usage.current, 0);
    }

    #[test]
    fn test_ttl() {
        assert_eq!(Strategy::FixedWindow.ttl_secs(&limits(5, 60, 0.0)), 120);
        assert_eq!(Strategy::TokenBucket.ttl_secs(&limits(10, 5, 1.0)), 20);
        assert_eq!(Strategy::LeakyBucket.ttl_secs(&limits(1, 60, 10.0)), 60);
    }
}
