//! Whitelist / blacklist membership.
//!
//! Membership lives in the shared store and is read fresh on every check.
//! Blacklist takes precedence over whitelist.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{StateStore, StoreError};

/// One of the two access control lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Whitelist,
    Blacklist,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Whitelist => "whitelist",
            ListKind::Blacklist => "blacklist",
        }
    }
}

/// Resolved ACL standing of an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclStatus {
    Blacklisted,
    Whitelisted,
    Unlisted,
}

/// Store-backed access control lists.
#[derive(Debug, Clone)]
pub struct AccessList {
    store: Arc<dyn StateStore>,
}

impl AccessList {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Resolve membership, blacklist first.
    pub async fn status(&self, identifier: &str) -> Result<AclStatus, StoreError> {
        if self
            .store
            .list_contains(ListKind::Blacklist, identifier)
            .await?
        {
            return Ok(AclStatus::Blacklisted);
        }

        if self
            .store
            .list_contains(ListKind::Whitelist, identifier)
            .await?
        {
            return Ok(AclStatus::Whitelisted);
        }

        Ok(AclStatus::Unlisted)
    }

    /// Add an identifier; returns whether membership changed.
    pub async fn add(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError> {
        self.store.list_add(list, identifier).await
    }

    /// Remove an identifier; returns whether membership changed.
    pub async fn remove(&self, list: ListKind, identifier: &str) -> Result<bool, StoreError> {
        self.store.list_remove(list, identifier).await
    }

    pub async fn len(&self, list: ListKind) -> Result<usize, StoreError> {
        self.store.list_len(list).await
    }
}
