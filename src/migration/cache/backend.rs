use super::{CacheError, StoredEntry};
use async_trait::async_trait;

/// Storage behind a [`MappingCache`](super::MappingCache).
///
/// Keys are fully rendered mapping keys. Writes are upserts so a retried
/// write after a crash is harmless.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError>;

    async fn put(&self, key: String, entry: StoredEntry) -> Result<(), CacheError>;

    /// Remove the given keys, returning how many existed.
    async fn forget_many(&self, keys: &[String]) -> Result<usize, CacheError>;

    /// Remove every entry carrying `tag`.
    async fn flush_tag(&self, tag: &str) -> Result<usize, CacheError>;

    /// Number of live entries whose key starts with `prefix`.
    async fn count_prefix(&self, prefix: &str) -> Result<usize, CacheError>;

    /// Make everything written so far durable.
    async fn persist(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
