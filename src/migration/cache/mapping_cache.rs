use super::{CacheBackend, CacheError, CacheScope, MappingKey, StoredEntry};
use crate::migration::entity::EntityId;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Source-to-target id mappings for one legacy source system.
///
/// Passed explicitly to every importer. Keys are namespaced by the source
/// system id, so two legacy integrations sharing a backend never collide.
#[derive(Clone)]
pub struct MappingCache {
    source: String,
    backend: Arc<dyn CacheBackend>,
}

impl MappingCache {
    pub fn new(source: impl Into<String>, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            source: source.into(),
            backend,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn key(&self, entity: EntityId, source_id: i64) -> MappingKey {
        MappingKey::new(self.source.clone(), entity, source_id)
    }

    fn namespaced_tag(&self, tag: &str) -> String {
        format!("{}:{}", self.source, tag)
    }

    /// Record that `source_id` of `entity` became `target_id`.
    ///
    /// Upsert semantics; `CacheScope::None` writes nothing.
    pub async fn put(
        &self,
        entity: EntityId,
        source_id: i64,
        target_id: i64,
        scope: &CacheScope,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let tag = match scope {
            CacheScope::Tagged(tag) => Some(self.namespaced_tag(tag)),
            CacheScope::Forever => None,
            CacheScope::None => return Ok(()),
        };

        let expires_at = ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .map(|ttl| Utc::now() + ttl)
        });

        let key = self.key(entity, source_id);
        log::trace!("cache put {} -> {}", key, target_id);

        self.backend
            .put(
                key.to_string(),
                StoredEntry {
                    target_id,
                    tag,
                    expires_at,
                },
            )
            .await
    }

    /// Look up the target id for a source record.
    ///
    /// `Ok(None)` means no live mapping; a stored zero is returned as
    /// `Some(0)` and left to the caller to interpret.
    pub async fn get(&self, entity: EntityId, source_id: i64) -> Result<Option<i64>, CacheError> {
        let key = self.key(entity, source_id).to_string();
        let entry = self.backend.get(&key).await?;
        Ok(entry
            .filter(|entry| !entry.is_expired(Utc::now()))
            .map(|entry| entry.target_id))
    }

    /// Remove every mapping written with `CacheScope::Tagged(tag)`.
    pub async fn flush(&self, tag: &str) -> Result<usize, CacheError> {
        let removed = self.backend.flush_tag(&self.namespaced_tag(tag)).await?;
        log::info!("flushed {} mappings tagged '{}' for {}", removed, tag, self.source);
        Ok(removed)
    }

    /// Remove specific mappings regardless of scope.
    pub async fn forget_all(&self, keys: &[MappingKey]) -> Result<usize, CacheError> {
        let rendered: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.backend.forget_many(&rendered).await
    }

    /// Number of live mappings stored for `entity`.
    pub async fn count(&self, entity: EntityId) -> Result<usize, CacheError> {
        self.backend
            .count_prefix(&MappingKey::entity_prefix(&self.source, entity))
            .await
    }

    pub async fn is_completed(&self, entity: EntityId) -> Result<bool, CacheError> {
        let key = MappingKey::completion(&self.source, entity);
        Ok(self.backend.get(&key).await?.is_some())
    }

    /// Mark the importer for `entity` as having finished a full pass.
    pub async fn mark_completed(&self, entity: EntityId) -> Result<(), CacheError> {
        let key = MappingKey::completion(&self.source, entity);
        self.backend
            .put(
                key,
                StoredEntry {
                    target_id: Utc::now().timestamp(),
                    tag: None,
                    expires_at: None,
                },
            )
            .await
    }

    pub async fn clear_completed(&self, entity: EntityId) -> Result<bool, CacheError> {
        let key = MappingKey::completion(&self.source, entity);
        Ok(self.backend.forget_many(&[key]).await? > 0)
    }

    /// Make all writes so far durable. Called by the engine every few pages
    /// and by the orchestrator after a completion marker.
    pub async fn checkpoint(&self) -> Result<(), CacheError> {
        self.backend.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::cache::MemoryCacheBackend;

    fn cache(source: &str, backend: Arc<MemoryCacheBackend>) -> MappingCache {
        MappingCache::new(source, backend)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = cache("invision", Arc::new(MemoryCacheBackend::new()));
        cache
            .put(EntityId::USERS, 5, 500, &CacheScope::Forever, None)
            .await
            .unwrap();

        assert_eq!(cache.get(EntityId::USERS, 5).await.unwrap(), Some(500));
        assert_eq!(cache.get(EntityId::USERS, 6).await.unwrap(), None);
        assert_eq!(cache.get(EntityId::GROUPS, 5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_is_distinct_from_absent() {
        let cache = cache("invision", Arc::new(MemoryCacheBackend::new()));
        cache
            .put(EntityId::USERS, 1, 0, &CacheScope::Forever, None)
            .await
            .unwrap();

        assert_eq!(cache.get(EntityId::USERS, 1).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_scope_none_writes_nothing() {
        let cache = cache("invision", Arc::new(MemoryCacheBackend::new()));
        cache
            .put(EntityId::GROUP_MEMBERS, 1, 2, &CacheScope::None, None)
            .await
            .unwrap();

        assert_eq!(cache.get(EntityId::GROUP_MEMBERS, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_mapping_reads_as_absent() {
        let cache = cache("invision", Arc::new(MemoryCacheBackend::new()));
        cache
            .put(
                EntityId::TOPICS,
                1,
                10,
                &CacheScope::Tagged("topics"),
                Some(Duration::ZERO),
            )
            .await
            .unwrap();

        assert_eq!(cache.get(EntityId::TOPICS, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_flush_is_scoped_to_source_and_tag() {
        let backend = Arc::new(MemoryCacheBackend::new());
        let invision = cache("invision", backend.clone());
        let other = cache("other", backend.clone());

        invision
            .put(EntityId::FORUMS, 1, 10, &CacheScope::Tagged("forums"), None)
            .await
            .unwrap();
        invision
            .put(EntityId::USERS, 1, 20, &CacheScope::Forever, None)
            .await
            .unwrap();
        other
            .put(EntityId::FORUMS, 1, 30, &CacheScope::Tagged("forums"), None)
            .await
            .unwrap();

        assert_eq!(invision.flush("forums").await.unwrap(), 1);
        assert_eq!(invision.get(EntityId::FORUMS, 1).await.unwrap(), None);
        assert_eq!(invision.get(EntityId::USERS, 1).await.unwrap(), Some(20));
        assert_eq!(other.get(EntityId::FORUMS, 1).await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_forget_all_removes_forever_entries() {
        let cache = cache("invision", Arc::new(MemoryCacheBackend::new()));
        cache
            .put(EntityId::USERS, 1, 20, &CacheScope::Forever, None)
            .await
            .unwrap();

        let removed = cache
            .forget_all(&[cache.key(EntityId::USERS, 1)])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.count(EntityId::USERS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_completion_markers() {
        let cache = cache("invision", Arc::new(MemoryCacheBackend::new()));
        assert!(!cache.is_completed(EntityId::USERS).await.unwrap());

        cache.mark_completed(EntityId::USERS).await.unwrap();
        assert!(cache.is_completed(EntityId::USERS).await.unwrap());
        assert_eq!(cache.count(EntityId::USERS).await.unwrap(), 0);

        assert!(cache.clear_completed(EntityId::USERS).await.unwrap());
        assert!(!cache.is_completed(EntityId::USERS).await.unwrap());
    }
}
