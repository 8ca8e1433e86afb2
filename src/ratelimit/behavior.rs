//! Per-client behavior scoring.
//!
//! The scorer turns a caller's recent outcomes into a multiplier applied to
//! rule limits. State is process-local and may be stale; it only scales
//! limits and never decides admission on its own.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::Serialize;
use tracing::trace;

use super::key::ClientKey;
use crate::config::BehaviorConfig;

/// Lower bound of the adaptive multiplier.
pub const MIN_MULTIPLIER: f64 = 0.1;
/// Upper bound of the adaptive multiplier.
pub const MAX_MULTIPLIER: f64 = 3.0;

const NEUTRAL: f64 = 1.0;
const ERROR_PENALTY: f64 = 0.5;
const VOLUME_PENALTY: f64 = 0.7;
const GOOD_CONDUCT_REWARD: f64 = 1.2;
const BUCKET_SECS: u64 = 60;

#[derive(Debug, Clone, Copy)]
struct MinuteBucket {
    minute: u64,
    requests: u64,
    denials: u64,
}

#[derive(Debug, Default)]
struct BehaviorRecord {
    /// Most recent outcomes, `true` meaning denied
    outcomes: VecDeque<bool>,
    /// Rolling per-minute counts covering the trailing window
    buckets: VecDeque<MinuteBucket>,
    last_seen: f64,
}

impl BehaviorRecord {
    fn push(&mut self, denied: bool, now: f64, config: &BehaviorConfig) {
        self.outcomes.push_back(denied);
        while self.outcomes.len() > config.history_size.max(1) {
            self.outcomes.pop_front();
        }

        let minute = now.max(0.0) as u64 / BUCKET_SECS;
        match self.buckets.back_mut() {
            Some(bucket) if bucket.minute == minute => {
                bucket.requests += 1;
                bucket.denials += u64::from(denied);
            }
            _ => self.buckets.push_back(MinuteBucket {
                minute,
                requests: 1,
                denials: u64::from(denied),
            }),
        }
        self.expire(now, config);
        self.last_seen = now;
    }

    fn expire(&mut self, now: f64, config: &BehaviorConfig) {
        let oldest_minute = (now.max(0.0) as u64).saturating_sub(config.window_secs) / BUCKET_SECS;
        while self
            .buckets
            .front()
            .is_some_and(|bucket| bucket.minute < oldest_minute)
        {
            self.buckets.pop_front();
        }
    }

    fn volume(&self, now: f64, config: &BehaviorConfig) -> (u64, u64) {
        let oldest_minute = (now.max(0.0) as u64).saturating_sub(config.window_secs) / BUCKET_SECS;
        self.buckets
            .iter()
            .filter(|bucket| bucket.minute >= oldest_minute)
            .fold((0, 0), |(requests, denials), bucket| {
                (requests + bucket.requests, denials + bucket.denials)
            })
    }

    fn denial_ratio(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let denials = self.outcomes.iter().filter(|denied| **denied).count();
        Some(denials as f64 / self.outcomes.len() as f64)
    }
}

/// Point-in-time view of a caller's behavior record.
#[derive(Debug, Clone, Serialize)]
pub struct BehaviorSnapshot {
    pub recent_outcomes: usize,
    pub denial_ratio: f64,
    pub window_requests: u64,
    pub window_denials: u64,
    pub multiplier: f64,
}

/// Multiplier fixed for one client key until the end of a rule window.
#[derive(Debug, Clone, Copy)]
struct Ceiling {
    window_end: u64,
    multiplier: f64,
}

/// Computes adaptive limit multipliers from recent outcomes.
#[derive(Debug)]
pub struct BehaviorScorer {
    config: BehaviorConfig,
    records: DashMap<String, BehaviorRecord>,
    ceilings: DashMap<ClientKey, Ceiling>,
}

impl BehaviorScorer {
    pub fn new(config: BehaviorConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            ceilings: DashMap::new(),
        }
    }

    /// A scorer that always yields the neutral multiplier.
    pub fn disabled() -> Self {
        Self::new(BehaviorConfig {
            enabled: false,
            ..BehaviorConfig::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record the outcome of an evaluated request.
    pub fn record(&self, identifier: &str, allowed: bool, now: f64) {
        if !self.config.enabled {
            return;
        }
        self.records
            .entry(identifier.to_string())
            .or_default()
            .push(!allowed, now, &self.config);
    }

    /// The multiplier for `identifier` at `now`, clamped to
    /// [`MIN_MULTIPLIER`, `MAX_MULTIPLIER`]. Falls back to 1.0 on any
    /// degenerate input.
    pub fn multiplier(&self, identifier: &str, now: f64) -> f64 {
        if !self.config.enabled {
            return NEUTRAL;
        }

        let multiplier = match self.records.get(identifier) {
            Some(record) => {
                let (requests, _) = record.volume(now, &self.config);
                score(
                    &self.config,
                    record.denial_ratio(),
                    record.outcomes.len(),
                    requests,
                )
            }
            None => NEUTRAL,
        };

        trace!(identifier = %identifier, multiplier, "Computed behavior multiplier");
        multiplier
    }

    /// The multiplier applied to `key` for the rule window containing `now`.
    ///
    /// The first request of a window fixes the multiplier for that window.
    /// Later requests may only lower it, so a reward earned inside a window
    /// takes effect from the next one.
    pub fn window_multiplier(&self, key: &ClientKey, window_secs: u64, now: f64) -> f64 {
        if !self.config.enabled {
            return NEUTRAL;
        }

        let current = self.multiplier(&key.identifier, now);
        let window_end = window_end(window_secs, now);
        let mut ceiling = self.ceilings.entry(key.clone()).or_insert(Ceiling {
            window_end,
            multiplier: current,
        });
        if ceiling.window_end == window_end {
            ceiling.multiplier = ceiling.multiplier.min(current);
        } else {
            *ceiling = Ceiling {
                window_end,
                multiplier: current,
            };
        }
        ceiling.multiplier
    }

    /// Like [`BehaviorScorer::window_multiplier`] without fixing a new window.
    pub fn peek_window_multiplier(&self, key: &ClientKey, window_secs: u64, now: f64) -> f64 {
        if !self.config.enabled {
            return NEUTRAL;
        }

        let current = self.multiplier(&key.identifier, now);
        match self.ceilings.get(key) {
            Some(ceiling) if ceiling.window_end == window_end(window_secs, now) => {
                ceiling.multiplier.min(current)
            }
            _ => current,
        }
    }

    /// Inspect the record for `identifier`, if any.
    pub fn snapshot(&self, identifier: &str, now: f64) -> Option<BehaviorSnapshot> {
        let record = self.records.get(identifier)?;
        let (window_requests, window_denials) = record.volume(now, &self.config);
        let denial_ratio = record.denial_ratio();
        Some(BehaviorSnapshot {
            recent_outcomes: record.outcomes.len(),
            denial_ratio: denial_ratio.unwrap_or(0.0),
            window_requests,
            window_denials,
            multiplier: score(
                &self.config,
                denial_ratio,
                record.outcomes.len(),
                window_requests,
            ),
        })
    }

    /// Drop all history for `identifier`.
    pub fn forget(&self, identifier: &str) -> bool {
        self.ceilings.retain(|key, _| key.identifier != identifier);
        self.records.remove(identifier).is_some()
    }

    /// Drop records idle for longer than the scoring window.
    pub fn prune(&self, now: f64) -> usize {
        let horizon = now - self.config.window_secs as f64;
        self.ceilings.retain(|_, ceiling| ceiling.window_end as f64 > now);
        let before = self.records.len();
        self.records.retain(|_, record| record.last_seen > horizon);
        before.saturating_sub(self.records.len())
    }

    /// Number of identifiers with a live record.
    pub fn tracked(&self) -> usize {
        self.records.len()
    }
}

impl Default for BehaviorScorer {
    fn default() -> Self {
        Self::new(BehaviorConfig::default())
    }
}

fn window_end(window_secs: u64, now: f64) -> u64 {
    let window = window_secs.max(1);
    (now.max(0.0) as u64 / window + 1) * window
}

fn score(
    config: &BehaviorConfig,
    denial_ratio: Option<f64>,
    samples: usize,
    window_requests: u64,
) -> f64 {
    let mut multiplier = NEUTRAL;
    let ratio = denial_ratio.unwrap_or(0.0);

    if ratio > config.error_ratio_threshold {
        multiplier *= ERROR_PENALTY;
    }
    if window_requests > config.volume_ceiling {
        multiplier *= VOLUME_PENALTY;
    }
    if samples >= config.min_samples
        && ratio <= config.low_error_ratio
        && window_requests <= config.volume_ceiling / 2
    {
        multiplier *= GOOD_CONDUCT_REWARD;
    }

    if !multiplier.is_finite() {
        return NEUTRAL;
    }
    multiplier.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER)
}
