//! In-process store for tests and single-instance deployments.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{KeyCensus, StateStore, StoreError};
use crate::ratelimit::{ClientKey, CounterState, Evaluation, Limits, ListKind, Strategy, Usage};

#[derive(Debug)]
struct Slot {
    state: CounterState,
    expires_at: f64,
}

#[derive(Debug, Default)]
struct MemoryState {
    counters: HashMap<ClientKey, Slot>,
    blocked: HashMap<ClientKey, f64>,
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
}

impl MemoryState {
    fn list(&self, list: ListKind) -> &HashSet<String> {
        match list {
            ListKind::Whitelist => &self.whitelist,
            ListKind::Blacklist => &self.blacklist,
        }
    }

    fn list_mut(&mut self, list: ListKind) -> &mut HashSet<String> {
        match list {
            ListKind::Whitelist => &mut self.whitelist,
            ListKind::Blacklist => &mut self.blacklist,
        }
    }
}

/// A store held entirely in process memory.
///
/// All state sits behind one mutex, so each evaluation is a single critical
/// section. Expired entries are ignored on read and removed by
/// [`StateStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counters held, including expired ones not yet purged.
    pub fn counter_count(&self) -> usize {
        self.inner.lock().counters.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn evaluate(
        &self,
        key: &ClientKey,
        strategy: Strategy,
        limits: &Limits,
        now: f64,
    ) -> Result<Evaluation, StoreError> {
        let mut inner = self.inner.lock();

        let previous = match inner.counters.remove(key) {
            Some(slot) if slot.expires_at > now => Some(slot.state),
            Some(_) => {
                trace!(key = %key, "Counter expired, starting fresh");
                None
            }
            None => None,
        };

        let (state, evaluation) = strategy.evaluate(previous, limits, now);
        inner.counters.insert(
            key.clone(),
            Slot {
                state,
                expires_at: now + strategy.ttl_secs(limits) as f64,
            },
        );

        Ok(evaluation)
    }

    async fn peek(
        &self,
        key: &ClientKey,
        strategy: Strategy,
        limits: &Limits,
        now: f64,
    ) -> Result<Usage, StoreError> {
        let inner = self.inner.lock();
        let state = inner
            .counters
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| &slot.state);
        Ok(strategy.usage(state, limits, now))
    }

    async fn blocked_until(&self, key: &ClientKey, now: f64) -> Result<Option<f64>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.blocked.get(key).copied().filter(|until| *until > now))
    }

    async fn set_blocked(&self, key: &ClientKey, until: f64, _now: f64) -> Result<(), StoreError> {
        self.inner.lock().blocked.insert(key.clone(), until);
        Ok(())
    }

    async fn clear(&self, key: &ClientKey) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let counter = inner.counters.remove(key).is_some();
        let blocked = inner.blocked.remove(key).is_some();
        Ok(counter || blocked)
    }

    async fn list_add(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .list_mut(list)
            .insert(identifier.to_string()))
    }

    async fn list_remove(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().list_mut(list).remove(identifier))
    }

    async fn list_contains(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().list(list).contains(identifier))
    }

    async fn list_len(&self, list: ListKind) -> Result<usize, StoreError> {
        Ok(self.inner.lock().list(list).len())
    }

    async fn census(&self, now: f64) -> Result<KeyCensus, StoreError> {
        let inner = self.inner.lock();
        let mut counters: Vec<ClientKey> = inner
            .counters
            .iter()
            .filter(|(_, slot)| slot.expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut blocked: Vec<ClientKey> = inner
            .blocked
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(key, _)| key.clone())
            .collect();
        counters.sort();
        blocked.sort();

        Ok(KeyCensus { counters, blocked })
    }

    async fn purge_expired(&self, now: f64) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let before = inner.counters.len() + inner.blocked.len();
        inner.counters.retain(|_, slot| slot.expires_at > now);
        inner.blocked.retain(|_, until| *until > now);
        Ok(before - inner.counters.len() - inner.blocked.len())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
