//! Client key generation and identifier validation.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// Longest identifier accepted from callers.
pub const MAX_IDENTIFIER_LEN: usize = 512;

/// A key that uniquely identifies one logical counter: a caller under a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientKey {
    /// The rule this counter is evaluated against
    pub rule: String,
    /// Opaque caller identifier
    pub identifier: String,
}

/// The kind of object a store key points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Counter,
    Blocked,
}

impl KeyKind {
    fn segment(&self) -> &'static str {
        match self {
            KeyKind::Counter => "counter",
            KeyKind::Blocked => "blocked",
        }
    }
}

impl ClientKey {
    /// Create a new client key.
    pub fn new(identifier: &str, rule: &str) -> Self {
        Self {
            rule: rule.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Convert to a store key string.
    /// Format: "{prefix}:{kind}:{rule}:{identifier}"
    /// Rule names never contain ':' so the identifier may.
    pub fn store_key(&self, prefix: &str, kind: KeyKind) -> String {
        format!("{}:{}:{}:{}", prefix, kind.segment(), self.rule, self.identifier)
    }

    /// Glob pattern matching every key of `kind` under `prefix`.
    pub fn pattern(prefix: &str, kind: KeyKind) -> String {
        format!("{}:{}:*", prefix, kind.segment())
    }

    /// Parse from a store key string.
    pub fn from_store_key(prefix: &str, kind: KeyKind, key: &str) -> Option<Self> {
        let rest = key
            .strip_prefix(prefix)?
            .strip_prefix(':')?
            .strip_prefix(kind.segment())?
            .strip_prefix(':')?;

        let (rule, identifier) = rest.split_once(':')?;
        if rule.is_empty() || identifier.is_empty() {
            return None;
        }

        Some(Self::new(identifier, rule))
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.rule, self.identifier)
    }
}

/// Reject identifiers that are empty, oversized or carry control characters.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        return Err(WardenError::InvalidIdentifier(
            "identifier must not be empty".to_string(),
        ));
    }

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(WardenError::InvalidIdentifier(format!(
            "identifier exceeds {} bytes",
            MAX_IDENTIFIER_LEN
        )));
    }

    if identifier.chars().any(char::is_control) {
        return Err(WardenError::InvalidIdentifier(
            "identifier contains control characters".to_string(),
        ));
    }

    Ok(())
}
