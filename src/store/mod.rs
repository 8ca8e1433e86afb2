//! Shared state store adapters.
//!
//! Counters, blocked markers and ACL sets live behind the [`StateStore`]
//! trait so several engine instances can share one consistent view. Every
//! [`StateStore::evaluate`] call must apply the strategy's read-modify-write
//! as a single atomic operation.

mod memory;
mod redis_store;
mod scripts;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::{ClientKey, Evaluation, Limits, ListKind, Strategy, Usage};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Errors raised by store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("corrupt state at {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

/// Keys currently present in a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCensus {
    pub counters: Vec<ClientKey>,
    pub blocked: Vec<ClientKey>,
}

/// Abstraction over the key-value store that holds limiter state.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Short name used in logs.
    fn backend_name(&self) -> &'static str;

    /// Atomically apply one request to the counter for `key`.
    async fn evaluate(
        &self,
        key: &ClientKey,
        strategy: Strategy,
        limits: &Limits,
        now: f64,
    ) -> Result<Evaluation, StoreError>;

    /// Read the counter for `key` without consuming a permit.
    async fn peek(
        &self,
        key: &ClientKey,
        strategy: Strategy,
        limits: &Limits,
        now: f64,
    ) -> Result<Usage, StoreError>;

    /// The instant until which `key` is hard-blocked, if it is.
    async fn blocked_until(&self, key: &ClientKey, now: f64) -> Result<Option<f64>, StoreError>;

    /// Hard-block `key` until `until`.
    async fn set_blocked(&self, key: &ClientKey, until: f64, now: f64) -> Result<(), StoreError>;

    /// Remove the counter and blocked marker for `key`. Returns whether
    /// anything was removed.
    async fn clear(&self, key: &ClientKey) -> Result<bool, StoreError>;

    async fn list_add(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError>;

    async fn list_remove(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError>;

    async fn list_contains(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError>;

    async fn list_len(&self, list: ListKind) -> Result<usize, StoreError>;

    /// Enumerate live counters and blocked markers.
    async fn census(&self, now: f64) -> Result<KeyCensus, StoreError>;

    /// Delete expired or orphaned entries. Returns the number removed.
    async fn purge_expired(&self, now: f64) -> Result<usize, StoreError>;

    /// Round-trip to the store.
    async fn ping(&self) -> Result<(), StoreError>;
}
