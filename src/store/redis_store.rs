//! Redis-backed store shared by every engine instance.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use super::scripts;
use super::{KeyCensus, StateStore, StoreError};
use crate::ratelimit::{
    ClientKey, CounterState, Evaluation, KeyKind, Limits, ListKind, Strategy, Usage,
};

const SCAN_BATCH: usize = 500;

/// Compiled strategy scripts, sent as `EVALSHA` after the first load.
struct Scripts {
    fixed_window: Script,
    sliding_window: Script,
    token_bucket: Script,
    leaky_bucket: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            fixed_window: Script::new(scripts::FIXED_WINDOW),
            sliding_window: Script::new(scripts::SLIDING_WINDOW),
            token_bucket: Script::new(scripts::TOKEN_BUCKET),
            leaky_bucket: Script::new(scripts::LEAKY_BUCKET),
        }
    }

    fn for_strategy(&self, strategy: Strategy) -> &Script {
        match strategy {
            Strategy::FixedWindow => &self.fixed_window,
            Strategy::SlidingWindow => &self.sliding_window,
            Strategy::TokenBucket => &self.token_bucket,
            Strategy::LeakyBucket => &self.leaky_bucket,
        }
    }
}

/// A store backed by Redis.
///
/// Layout under `prefix`:
/// - `{prefix}:counter:{rule}:{identifier}` hash or sorted set, with TTL
/// - `{prefix}:blocked:{rule}:{identifier}` string holding the block deadline, with TTL
/// - `{prefix}:whitelist` and `{prefix}:blacklist` sets
pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let prefix = prefix.into();
        info!(prefix = %prefix, "Connecting to Redis store");

        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await.map_err(|e| {
            warn!(error = %e, "Failed to connect to Redis");
            StoreError::Unavailable(e.to_string())
        })?;

        Ok(Self {
            conn,
            prefix,
            scripts: Scripts::new(),
        })
    }

    fn counter_key(&self, key: &ClientKey) -> String {
        key.store_key(&self.prefix, KeyKind::Counter)
    }

    fn blocked_key(&self, key: &ClientKey) -> String {
        key.store_key(&self.prefix, KeyKind::Blocked)
    }

    fn list_key(&self, list: ListKind) -> String {
        format!("{}:{}", self.prefix, list.as_str())
    }

    /// Collect every key matching `pattern` with cursor-based SCAN.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn load_state(
        &self,
        key: &str,
        strategy: Strategy,
    ) -> Result<Option<CounterState>, StoreError> {
        let mut conn = self.conn.clone();

        // State written under another strategy reads as absent.
        let kind: String = redis::cmd("TYPE").arg(key).query_async(&mut conn).await?;
        let expected = if strategy == Strategy::SlidingWindow {
            "zset"
        } else {
            "hash"
        };
        if kind != expected {
            return Ok(None);
        }

        if strategy == Strategy::SlidingWindow {
            let flat: Vec<String> = redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await?;
            if flat.is_empty() {
                return Ok(None);
            }
            let log = flat
                .chunks(2)
                .filter_map(|pair| pair.get(1))
                .map(|score| parse_f64(key, score))
                .collect::<Result<_, _>>()?;
            return Ok(Some(CounterState::Log(log)));
        }

        let fields: [&str; 2] = match strategy {
            Strategy::FixedWindow => ["start", "count"],
            Strategy::TokenBucket => ["tokens", "last"],
            Strategy::LeakyBucket => ["level", "last"],
            Strategy::SlidingWindow => unreachable!("handled above"),
        };
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(&fields[..])
            .query_async(&mut conn)
            .await?;

        let (first, second) = match (values.first(), values.get(1)) {
            (Some(Some(a)), Some(Some(b))) => (parse_f64(key, a)?, parse_f64(key, b)?),
            _ => return Ok(None),
        };

        Ok(Some(match strategy {
            Strategy::FixedWindow => CounterState::Window {
                start: first as u64,
                count: second as u64,
            },
            Strategy::TokenBucket => CounterState::Bucket {
                tokens: first,
                last_refill: second,
            },
            _ => CounterState::Leaky {
                level: first,
                last_leak: second,
            },
        }))
    }
}

fn parse_f64(key: &str, raw: &str) -> Result<f64, StoreError> {
    raw.parse::<f64>().map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        detail: format!("'{}' is not a number: {}", raw, e),
    })
}

#[async_trait]
impl StateStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn evaluate(
        &self,
        key: &ClientKey,
        strategy: Strategy,
        limits: &Limits,
        now: f64,
    ) -> Result<Evaluation, StoreError> {
        let counter_key = self.counter_key(key);
        let mut conn = self.conn.clone();

        let (allowed, remaining, reset_at, retry_after): (i64, i64, String, i64) = self
            .scripts
            .for_strategy(strategy)
            .key(&counter_key)
            .arg(limits.limit)
            .arg(limits.window_secs.max(1))
            .arg(format!("{:.6}", now))
            .arg(strategy.ttl_secs(limits))
            .arg(format!("{}", limits.rate))
            .arg(uuid::Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await?;

        let reset_at = parse_f64(&counter_key, &reset_at)?;
        debug!(key = %counter_key, allowed, remaining, "Evaluated counter in Redis");

        Ok(Evaluation {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u64,
            reset_at,
            retry_after: (allowed != 1).then(|| retry_after.max(1) as u64),
        })
    }

    async fn peek(
        &self,
        key: &ClientKey,
        strategy: Strategy,
        limits: &Limits,
        now: f64,
    ) -> Result<Usage, StoreError> {
        let state = self.load_state(&self.counter_key(key), strategy).await?;
        Ok(strategy.usage(state.as_ref(), limits, now))
    }

    async fn blocked_until(&self, key: &ClientKey, now: f64) -> Result<Option<f64>, StoreError> {
        let blocked_key = self.blocked_key(key);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&blocked_key).await?;

        match raw {
            Some(raw) => {
                let until = parse_f64(&blocked_key, &raw)?;
                Ok((until > now).then_some(until))
            }
            None => Ok(None),
        }
    }

    async fn set_blocked(&self, key: &ClientKey, until: f64, now: f64) -> Result<(), StoreError> {
        let ttl = (until - now).ceil().max(1.0) as u64;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.blocked_key(key), format!("{:.6}", until), ttl)
            .await?;
        Ok(())
    }

    async fn clear(&self, key: &ClientKey) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn
            .del(vec![self.counter_key(key), self.blocked_key(key)])
            .await?;
        Ok(removed > 0)
    }

    async fn list_add(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let added: usize = conn.sadd(self.list_key(list), identifier).await?;
        Ok(added > 0)
    }

    async fn list_remove(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.srem(self.list_key(list), identifier).await?;
        Ok(removed > 0)
    }

    async fn list_contains(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(self.list_key(list), identifier).await?)
    }

    async fn list_len(&self, list: ListKind) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(self.list_key(list)).await?)
    }

    async fn census(&self, _now: f64) -> Result<KeyCensus, StoreError> {
        let parse = |kind: KeyKind, keys: Vec<String>| -> Vec<ClientKey> {
            let mut parsed: Vec<ClientKey> = keys
                .iter()
                .filter_map(|raw| ClientKey::from_store_key(&self.prefix, kind, raw))
                .collect();
            parsed.sort();
            parsed
        };

        let counters = self
            .scan(&ClientKey::pattern(&self.prefix, KeyKind::Counter))
            .await?;
        let blocked = self
            .scan(&ClientKey::pattern(&self.prefix, KeyKind::Blocked))
            .await?;

        Ok(KeyCensus {
            counters: parse(KeyKind::Counter, counters),
            blocked: parse(KeyKind::Blocked, blocked),
        })
    }

    async fn purge_expired(&self, now: f64) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let mut doomed = Vec::new();

        // Redis expires keys itself; only keys that lost their TTL linger.
        for key in self
            .scan(&ClientKey::pattern(&self.prefix, KeyKind::Counter))
            .await?
        {
            let ttl: i64 = conn.ttl(&key).await?;
            if ttl == -1 {
                doomed.push(key);
            }
        }

        for key in self
            .scan(&ClientKey::pattern(&self.prefix, KeyKind::Blocked))
            .await?
        {
            let ttl: i64 = conn.ttl(&key).await?;
            let raw: Option<String> = conn.get(&key).await?;
            let lapsed = raw
                .and_then(|raw| raw.parse::<f64>().ok())
                .map_or(true, |until| until <= now);
            if ttl == -1 || lapsed {
                doomed.push(key);
            }
        }

        if doomed.is_empty() {
            return Ok(0);
        }
        let removed: usize = conn.del(&doomed).await?;
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    // Requires a running Redis: RATEWARDEN_REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored
    async fn connect() -> RedisStore {
        let url = std::env::var("RATEWARDEN_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let prefix = format!("rwtest{}", uuid::Uuid::new_v4().simple());
        RedisStore::connect(&url, prefix).await.unwrap()
    }

    fn now() -> f64 {
        crate::ratelimit::Clock::now(&crate::ratelimit::SystemClock)
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_strategies_enforce_limit() {
        let store = connect().await;
        let limits = Limits {
            limit: 3,
            window_secs: 60,
            rate: 0.05,
        };
        let t = now();

        for strategy in Strategy::ALL {
            let key = ClientKey::new("client", strategy.as_str());
            for expected in [2, 1, 0] {
                let eval = store.evaluate(&key, strategy, &limits, t).await.unwrap();
                assert!(eval.allowed, "{} should admit", strategy);
                assert_eq!(eval.remaining, expected, "{}", strategy);
            }
            let eval = store.evaluate(&key, strategy, &limits, t).await.unwrap();
            assert!(!eval.allowed, "{} should deny", strategy);
            assert!(eval.retry_after.unwrap() >= 1);

            let usage = store.peek(&key, strategy, &limits, t).await.unwrap();
            assert_eq!(usage.remaining, 0, "{}", strategy);
            assert!(store.clear(&key).await.unwrap());
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_strategy_change_starts_fresh() {
        let store = connect().await;
        let limits = Limits {
            limit: 2,
            window_secs: 60,
            rate: 0.5,
        };
        let key = ClientKey::new("client", "api");
        let t = now();

        let mut previous = Strategy::FixedWindow;
        for _ in 0..2 {
            store.evaluate(&key, previous, &limits, t).await.unwrap();
        }
        assert!(!store.evaluate(&key, previous, &limits, t).await.unwrap().allowed);

        for strategy in [
            Strategy::SlidingWindow,
            Strategy::TokenBucket,
            Strategy::LeakyBucket,
            Strategy::FixedWindow,
        ] {
            let usage = store.peek(&key, strategy, &limits, t).await.unwrap();
            assert_eq!(usage.current, 0, "{} after {}", strategy, previous);

            let eval = store.evaluate(&key, strategy, &limits, t).await.unwrap();
            assert!(eval.allowed, "{} after {}", strategy, previous);
            assert_eq!(eval.remaining, 1, "{} after {}", strategy, previous);
            previous = strategy;
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_matches_memory_store() {
        let redis = connect().await;
        let memory = MemoryStore::new();
        let limits = Limits {
            limit: 3,
            window_secs: 10,
            rate: 0.4,
        };
        // Fractional instants spanning a window boundary.
        let t0 = 1_700_000_040.0;
        let offsets = [
            0.0, 0.25, 0.5, 0.75, 1.5, 2.5, 4.0, 7.75, 9.5, 10.0, 10.25, 10.5, 12.0, 14.5, 20.25,
        ];

        for strategy in Strategy::ALL {
            let key = ClientKey::new("client", strategy.as_str());
            for offset in offsets {
                let t = t0 + offset;
                let expected = memory.evaluate(&key, strategy, &limits, t).await.unwrap();
                let actual = redis.evaluate(&key, strategy, &limits, t).await.unwrap();

                let at = format!("{} at +{}", strategy, offset);
                assert_eq!(actual.allowed, expected.allowed, "{}", at);
                assert_eq!(actual.remaining, expected.remaining, "{}", at);
                assert_eq!(actual.retry_after, expected.retry_after, "{}", at);
                assert!((actual.reset_at - expected.reset_at).abs() < 1e-3, "{}", at);

                let expected = memory.peek(&key, strategy, &limits, t).await.unwrap();
                let actual = redis.peek(&key, strategy, &limits, t).await.unwrap();
                assert_eq!(actual.current, expected.current, "{}", at);
                assert_eq!(actual.remaining, expected.remaining, "{}", at);
            }
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_lists_and_blocks() {
        let store = connect().await;
        let key = ClientKey::new("client", "rule");
        let t = now();

        assert!(store.list_add(ListKind::Blacklist, "client").await.unwrap());
        assert!(store.list_contains(ListKind::Blacklist, "client").await.unwrap());
        assert_eq!(store.list_len(ListKind::Blacklist).await.unwrap(), 1);
        assert!(store.list_remove(ListKind::Blacklist, "client").await.unwrap());

        store.set_blocked(&key, t + 30.0, t).await.unwrap();
        assert!(store.blocked_until(&key, t).await.unwrap().is_some());
        let census = store.census(t).await.unwrap();
        assert_eq!(census.blocked, vec![key.clone()]);

        assert!(store.clear(&key).await.unwrap());
        store.ping().await.unwrap();
    }
}
