//! Shared types for mapping cache backends.

use crate::migration::entity::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite key of one source-to-target mapping.
///
/// Rendered as `migration:<source>:<entity>_map:<source_id>`, which is the
/// persisted key format shared with earlier runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub source: String,
    pub entity: EntityId,
    pub source_id: i64,
}

impl MappingKey {
    pub fn new(source: impl Into<String>, entity: EntityId, source_id: i64) -> Self {
        Self {
            source: source.into(),
            entity,
            source_id,
        }
    }

    /// Key prefix shared by every mapping of one entity type.
    pub fn entity_prefix(source: &str, entity: EntityId) -> String {
        format!("migration:{}:{}_map:", source, entity)
    }

    /// Key of the "importer finished its pass" marker.
    pub fn completion(source: &str, entity: EntityId) -> String {
        format!("migration:{}:{}_completed", source, entity)
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "migration:{}:{}_map:{}",
            self.source, self.entity, self.source_id
        )
    }
}

/// How mappings of an entity type are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    /// Removed together by `flush(tag)`.
    Tagged(&'static str),
    /// Identity mappings kept across runs; only `forget_all` removes them.
    Forever,
    /// No mapping is written (pivot rows and other keyless records).
    None,
}

/// Value stored under a mapping key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredEntry {
    pub target_id: i64,
    /// Namespaced tag (`<source>:<tag>`), `None` for forever entries.
    pub tag: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Errors from mapping cache backends.
///
/// Any of these aborts the running importer: without the cache foreign keys
/// cannot be resolved safely.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),

    #[error("Cache version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializeError(String),

    #[error("Deserialization error: {0}")]
    DeserializeError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        CacheError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let key = MappingKey::new("invision", EntityId::FORUMS, 12);
        assert_eq!(key.to_string(), "migration:invision:forums_map:12");
        assert!(
            key.to_string()
                .starts_with(&MappingKey::entity_prefix("invision", EntityId::FORUMS))
        );
        assert_eq!(
            MappingKey::completion("invision", EntityId::USERS),
            "migration:invision:users_completed"
        );
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let entry = StoredEntry {
            target_id: 1,
            tag: None,
            expires_at: Some(now - chrono::Duration::seconds(1)),
        };
        assert!(entry.is_expired(now));

        let forever = StoredEntry {
            expires_at: None,
            ..entry
        };
        assert!(!forever.is_expired(now));
    }
}
