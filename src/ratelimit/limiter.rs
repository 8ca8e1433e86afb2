//! Core rate limiter implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use super::acl::{AccessList, AclStatus, ListKind};
use super::behavior::BehaviorScorer;
use super::clock::{to_datetime, Clock, SystemClock};
use super::decision::{EffectiveLimit, GlobalStats, RateLimitResult, RuleStats, Snapshot};
use super::key::{validate_identifier, ClientKey};
use super::rules::{Rule, RuleConfig, RuleRegistry};
use crate::config::{BehaviorConfig, WardenConfig};
use crate::error::{Result, WardenError};
use crate::store::{StateStore, StoreError};

/// The decision engine.
///
/// Combines the access lists, hard blocks, the adaptive scorer and the
/// configured strategy into one admit/deny answer per request. All counter
/// state lives in the shared store, so any number of limiters pointed at the
/// same store enforce one consistent limit. The struct is `Send + Sync` and
/// is meant to be shared behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    rules: RuleRegistry,
    acl: AccessList,
    scorer: BehaviorScorer,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter with the wall clock and default behavior settings.
    pub fn new(store: Arc<dyn StateStore>, rules: RuleRegistry) -> Self {
        Self {
            acl: AccessList::new(store.clone()),
            store,
            rules,
            scorer: BehaviorScorer::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Build a limiter from loaded configuration.
    pub fn from_config(config: &WardenConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        let rules = config.rule_registry()?;
        Ok(Self::new(store, rules).with_behavior(config.behavior.clone()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_behavior(mut self, config: BehaviorConfig) -> Self {
        self.scorer = BehaviorScorer::new(config);
        self
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn scorer(&self) -> &BehaviorScorer {
        &self.scorer
    }

    /// Decide whether one request from `identifier` under `rule_name` is
    /// admitted, consuming a permit when it is.
    ///
    /// Store failures never surface as errors here; they resolve to an
    /// admit or deny according to the rule's `fail_open` setting.
    pub async fn check(&self, identifier: &str, rule_name: &str) -> Result<RateLimitResult> {
        validate_identifier(identifier)?;
        let rule = self.rule(rule_name)?;
        let now = self.clock.now();
        let key = ClientKey::new(identifier, &rule.name);

        trace!(key = %key, strategy = %rule.strategy, "Checking rate limit");

        match self.acl.status(identifier).await {
            Ok(AclStatus::Blacklisted) => {
                debug!(key = %key, "Denied blacklisted identifier");
                return Ok(RateLimitResult::blacklisted(&rule, now));
            }
            Ok(AclStatus::Whitelisted) => {
                debug!(key = %key, "Admitted whitelisted identifier");
                return Ok(RateLimitResult::whitelisted(&rule, now));
            }
            Ok(AclStatus::Unlisted) => {}
            Err(e) => return Ok(self.degraded(&rule, &key, e, now)),
        }

        let multiplier = self.scorer.window_multiplier(&key, rule.window_seconds, now);
        let limits = rule.limits(multiplier);

        match self.store.blocked_until(&key, now).await {
            Ok(Some(until)) => {
                debug!(key = %key, until = until, "Denied blocked client");
                self.scorer.record(identifier, false, now);
                return Ok(RateLimitResult::blocked(&rule, limits.limit, until, now));
            }
            Ok(None) => {}
            Err(e) => return Ok(self.degraded(&rule, &key, e, now)),
        }

        let evaluation = match self.store.evaluate(&key, rule.strategy, &limits, now).await {
            Ok(evaluation) => evaluation,
            Err(e) => return Ok(self.degraded(&rule, &key, e, now)),
        };
        self.scorer.record(identifier, evaluation.allowed, now);

        let mut result = RateLimitResult::evaluated(&rule, &limits, &evaluation);
        if evaluation.allowed {
            return Ok(result);
        }

        debug!(
            key = %key,
            limit = limits.limit,
            multiplier = multiplier,
            "Rate limit exceeded"
        );

        if rule.block_duration > 0 {
            let until = now + rule.block_duration as f64;
            match self.store.set_blocked(&key, until, now).await {
                Ok(()) => {
                    info!(key = %key, seconds = rule.block_duration, "Blocked client after violation");
                    let retry_after = result.retry_after.unwrap_or(1).max(rule.block_duration);
                    result.retry_after = Some(retry_after);
                    result.reset_time = to_datetime(until.max(evaluation.reset_at));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to record block, denial stands");
                }
            }
        }

        Ok(result)
    }

    /// The limit `identifier` would currently be measured against.
    pub async fn effective_limit(&self, identifier: &str, rule_name: &str) -> Result<EffectiveLimit> {
        validate_identifier(identifier)?;
        let rule = self.rule(rule_name)?;

        Ok(match self.acl.status(identifier).await? {
            AclStatus::Blacklisted => EffectiveLimit::Denied,
            AclStatus::Whitelisted => EffectiveLimit::Unlimited,
            AclStatus::Unlisted => {
                let key = ClientKey::new(identifier, &rule.name);
                let now = self.clock.now();
                let multiplier = self
                    .scorer
                    .peek_window_multiplier(&key, rule.window_seconds, now);
                EffectiveLimit::Limited(rule.effective_limit(multiplier))
            }
        })
    }

    /// Report usage for a client key without consuming a permit.
    pub async fn get_info(&self, identifier: &str, rule_name: &str) -> Result<Snapshot> {
        validate_identifier(identifier)?;
        let rule = self.rule(rule_name)?;
        let now = self.clock.now();
        let key = ClientKey::new(identifier, &rule.name);

        let acl = self.acl.status(identifier).await?;
        let multiplier = self
            .scorer
            .peek_window_multiplier(&key, rule.window_seconds, now);
        let limits = rule.limits(multiplier);
        let usage = self.store.peek(&key, rule.strategy, &limits, now).await?;
        let block_until = self.store.blocked_until(&key, now).await?;

        let (limit, remaining) = match acl {
            AclStatus::Blacklisted => (0, 0),
            AclStatus::Whitelisted => (u64::MAX, u64::MAX),
            AclStatus::Unlisted if block_until.is_some() => (limits.limit, 0),
            AclStatus::Unlisted => (limits.limit, usage.remaining),
        };

        Ok(Snapshot {
            limit,
            current_usage: usage.current,
            remaining,
            window_seconds: rule.window_seconds,
            is_blocked: acl == AclStatus::Blacklisted || block_until.is_some(),
            block_until: block_until.map(to_datetime),
            strategy: rule.strategy,
            acl,
            multiplier,
        })
    }

    /// Drop the counter, hard block and behavior history for a client key.
    ///
    /// Returns whether any store state was removed.
    pub async fn reset(&self, identifier: &str, rule_name: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        let rule = self.rule(rule_name)?;
        let key = ClientKey::new(identifier, &rule.name);

        let cleared = self.store.clear(&key).await?;
        let forgotten = self.scorer.forget(identifier);

        info!(key = %key, cleared = cleared, history = forgotten, "Reset rate limit");
        Ok(cleared)
    }

    pub async fn add_to_whitelist(&self, identifier: &str) -> Result<bool> {
        self.update_list(ListKind::Whitelist, identifier, true).await
    }

    pub async fn remove_from_whitelist(&self, identifier: &str) -> Result<bool> {
        self.update_list(ListKind::Whitelist, identifier, false).await
    }

    pub async fn add_to_blacklist(&self, identifier: &str) -> Result<bool> {
        self.update_list(ListKind::Blacklist, identifier, true).await
    }

    pub async fn remove_from_blacklist(&self, identifier: &str) -> Result<bool> {
        self.update_list(ListKind::Blacklist, identifier, false).await
    }

    /// Aggregate counts across the store and the registered rules.
    pub async fn get_global_stats(&self) -> Result<GlobalStats> {
        let now = self.clock.now();
        let (census, whitelisted_count, blacklisted_count) = futures::try_join!(
            self.store.census(now),
            self.acl.len(ListKind::Whitelist),
            self.acl.len(ListKind::Blacklist),
        )?;

        let per_rule_stats: BTreeMap<String, RuleStats> = self
            .rules
            .rules()
            .into_iter()
            .map(|rule| {
                let stats = RuleStats {
                    strategy: rule.strategy,
                    max_requests: rule.max_requests,
                    window_seconds: rule.window_seconds,
                    version: rule.version,
                    active_limits: census.counters.iter().filter(|k| k.rule == rule.name).count(),
                    blocked: census.blocked.iter().filter(|k| k.rule == rule.name).count(),
                };
                (rule.name.clone(), stats)
            })
            .collect();

        Ok(GlobalStats {
            total_active_limits: census.counters.len(),
            total_blocked: census.blocked.len(),
            whitelisted_count,
            blacklisted_count,
            tracked_identifiers: self.scorer.tracked(),
            per_rule_stats,
        })
    }

    /// Purge expired counters, lapsed blocks and stale behavior records.
    ///
    /// Returns the number of entries removed. Safe to run repeatedly.
    pub async fn cleanup_expired_data(&self) -> Result<usize> {
        let now = self.clock.now();
        let purged = self.store.purge_expired(now).await?;
        let pruned = self.scorer.prune(now);

        info!(purged = purged, pruned = pruned, "Cleaned up expired rate limit data");
        Ok(purged + pruned)
    }

    /// Replace a rule at runtime. In-flight checks finish against the
    /// previous version.
    pub fn override_rule(&self, config: &RuleConfig) -> Result<Arc<Rule>> {
        self.rules.override_rule(config)
    }

    fn rule(&self, name: &str) -> Result<Arc<Rule>> {
        self.rules
            .get(name)
            .ok_or_else(|| WardenError::UnknownRule(name.to_string()))
    }

    async fn update_list(&self, list: ListKind, identifier: &str, add: bool) -> Result<bool> {
        validate_identifier(identifier)?;
        let changed = if add {
            self.acl.add(list, identifier).await?
        } else {
            self.acl.remove(list, identifier).await?
        };

        info!(
            list = list.as_str(),
            identifier = identifier,
            added = add,
            changed = changed,
            "Updated access list"
        );
        Ok(changed)
    }

    fn degraded(&self, rule: &Rule, key: &ClientKey, err: StoreError, now: f64) -> RateLimitResult {
        match &err {
            StoreError::Corrupt { .. } => error!(
                key = %key,
                backend = self.store.backend_name(),
                error = %err,
                fail_open = rule.fail_open,
                "Corrupt limiter state during check"
            ),
            _ => warn!(
                key = %key,
                backend = self.store.backend_name(),
                error = %err,
                fail_open = rule.fail_open,
                "Store unavailable during check"
            ),
        }
        RateLimitResult::store_unavailable(rule, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, Reason, Strategy};
    use crate::store::MemoryStore;

    const T0: f64 = 1_700_000_040.0;

    fn rule(name: &str, max_requests: u64, window_seconds: u64, strategy: Strategy) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            max_requests,
            window_seconds,
            strategy,
            block_duration: 0,
            burst_limit: 0,
            refill_rate: 0.0,
            fail_open: false,
        }
    }

    fn limiter(configs: &[RuleConfig]) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(T0);
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            RuleRegistry::from_configs(configs).unwrap(),
        )
        .with_clock(Arc::new(clock.clone()))
        .with_behavior(BehaviorConfig {
            enabled: false,
            ..BehaviorConfig::default()
        });
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_check_counts_down() {
        let (limiter, _) = limiter(&[rule("api", 3, 60, Strategy::FixedWindow)]);

        for expected in [2, 1, 0] {
            let result = limiter.check("client", "api").await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
            assert_eq!(result.reason, None);
        }

        let result = limiter.check("client", "api").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(Reason::LimitExceeded));
    }

    #[tokio::test]
    async fn test_different_rules_have_separate_counters() {
        let (limiter, _) = limiter(&[
            rule("a", 1, 60, Strategy::FixedWindow),
            rule("b", 1, 60, Strategy::FixedWindow),
        ]);

        assert!(limiter.check("client", "a").await.unwrap().allowed);
        assert!(limiter.check("client", "b").await.unwrap().allowed);
        assert!(!limiter.check("client", "a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unknown_rule_and_bad_identifier() {
        let (limiter, _) = limiter(&[rule("api", 3, 60, Strategy::FixedWindow)]);

        assert!(matches!(
            limiter.check("client", "missing").await,
            Err(WardenError::UnknownRule(name)) if name == "missing"
        ));
        assert!(matches!(
            limiter.check("", "api").await,
            Err(WardenError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            limiter.add_to_blacklist("  ").await,
            Err(WardenError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_block_duration_holds_after_window_reset() {
        let mut config = rule("auth", 1, 10, Strategy::FixedWindow);
        config.block_duration = 30;
        let (limiter, clock) = limiter(&[config]);

        assert!(limiter.check("client", "auth").await.unwrap().allowed);
        let denied = limiter.check("client", "auth").await.unwrap();
        assert_eq!(denied.reason, Some(Reason::LimitExceeded));
        assert_eq!(denied.retry_after, Some(30));

        // The window has rolled over but the block has not lapsed.
        clock.advance(15.0);
        let blocked = limiter.check("client", "auth").await.unwrap();
        assert!(!blocked.allowed);
        assert_eq!(blocked.reason, Some(Reason::Blocked));
        assert_eq!(blocked.retry_after, Some(15));

        clock.advance(15.0);
        assert!(limiter.check("client", "auth").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_clears_block() {
        let mut config = rule("auth", 1, 60, Strategy::FixedWindow);
        config.block_duration = 300;
        let (limiter, _) = limiter(&[config]);

        limiter.check("client", "auth").await.unwrap();
        limiter.check("client", "auth").await.unwrap();
        assert!(limiter.get_info("client", "auth").await.unwrap().is_blocked);

        assert!(limiter.reset("client", "auth").await.unwrap());
        assert!(!limiter.reset("client", "auth").await.unwrap());
        assert!(limiter.check("client", "auth").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_effective_limit_follows_acl() {
        let (limiter, _) = limiter(&[rule("api", 7, 60, Strategy::SlidingWindow)]);

        assert_eq!(
            limiter.effective_limit("a", "api").await.unwrap(),
            EffectiveLimit::Limited(7)
        );
        limiter.add_to_whitelist("a").await.unwrap();
        assert_eq!(
            limiter.effective_limit("a", "api").await.unwrap(),
            EffectiveLimit::Unlimited
        );
        limiter.add_to_blacklist("a").await.unwrap();
        assert_eq!(
            limiter.effective_limit("a", "api").await.unwrap(),
            EffectiveLimit::Denied
        );
    }

    #[tokio::test]
    async fn test_override_rule_applies_to_next_check() {
        let (limiter, _) = limiter(&[rule("api", 1, 60, Strategy::FixedWindow)]);

        assert!(limiter.check("client", "api").await.unwrap().allowed);
        assert!(!limiter.check("client", "api").await.unwrap().allowed);

        let updated = limiter
            .override_rule(&rule("api", 5, 60, Strategy::FixedWindow))
            .unwrap();
        assert_eq!(updated.version, 2);

        let result = limiter.check("client", "api").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.limit, 5);
    }

    #[tokio::test]
    async fn test_adaptive_multiplier_shrinks_limit_for_abusers() {
        let (limiter, _) = limiter(&[rule("api", 10, 60, Strategy::FixedWindow)]);
        let limiter = limiter.with_behavior(BehaviorConfig::default());

        // 10 admitted, 10 denied: denial ratio 0.5 halves the limit.
        for _ in 0..20 {
            limiter.check("abuser", "api").await.unwrap();
        }
        assert_eq!(
            limiter.effective_limit("abuser", "api").await.unwrap(),
            EffectiveLimit::Limited(5)
        );
        assert_eq!(
            limiter.effective_limit("stranger", "api").await.unwrap(),
            EffectiveLimit::Limited(10)
        );
    }
}
