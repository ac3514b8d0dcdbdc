//! Importer contract and the policy-driven importer.

use super::cache::{CacheError, CacheScope, MappingCache};
use super::dependency::ImporterDependency;
use super::engine;
use super::entity::EntityId;
use super::policy::EntityPolicy;
use super::report::ProgressReporter;
use super::result::ImportResult;
use super::source::SourceStore;
use super::target::TargetStore;
use crate::error::MigrationError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Parameters shared by every importer of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub batch_size: u64,
    /// Stop after this many records have been processed.
    pub limit: Option<u64>,
    /// Skip this many eligible records before processing.
    pub offset: u64,
    pub dry_run: bool,
    /// Persist the mapping cache after this many pages.
    pub checkpoint_every: u64,
}

impl RunOptions {
    /// Whether this run covers the whole source table.
    pub fn is_full_pass(&self) -> bool {
        self.limit.is_none() && self.offset == 0
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            limit: None,
            offset: 0,
            dry_run: false,
            checkpoint_every: 10,
        }
    }
}

#[derive(Default)]
struct OverlayState {
    next_id: i64,
    mappings: HashMap<(EntityId, i64), i64>,
    keys: HashMap<(EntityId, String), i64>,
}

/// Would-be mappings of a dry run.
///
/// Dry runs write nothing, yet later steps of the same run still need to
/// resolve the records earlier steps pretended to create. Those get
/// synthetic negative ids that can never clash with real target ids.
#[derive(Default)]
pub struct DryRunOverlay {
    state: Mutex<OverlayState>,
}

impl DryRunOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh synthetic id not tied to any mapping.
    pub fn synthetic_id(&self) -> i64 {
        let mut state = self.state.lock();
        state.next_id -= 1;
        state.next_id
    }

    /// Pretend to create a record: hand out a synthetic id and remember it
    /// as the mapping (and natural key, if any) of `source_id`.
    pub fn allocate(&self, entity: EntityId, source_id: i64, fingerprint: Option<String>) -> i64 {
        let mut state = self.state.lock();
        state.next_id -= 1;
        let id = state.next_id;
        state.mappings.insert((entity, source_id), id);
        if let Some(fingerprint) = fingerprint {
            state.keys.insert((entity, fingerprint), id);
        }
        id
    }

    pub fn remember(&self, entity: EntityId, source_id: i64, target_id: i64) {
        self.state.lock().mappings.insert((entity, source_id), target_id);
    }

    pub fn lookup(&self, entity: EntityId, source_id: i64) -> Option<i64> {
        self.state.lock().mappings.get(&(entity, source_id)).copied()
    }

    pub fn find_key(&self, entity: EntityId, fingerprint: &str) -> Option<i64> {
        self.state
            .lock()
            .keys
            .get(&(entity, fingerprint.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.state.lock().mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything an importer needs for one run.
pub struct ImportContext<'a> {
    pub source: &'a dyn SourceStore,
    pub target: &'a dyn TargetStore,
    pub cache: &'a MappingCache,
    pub reporter: &'a dyn ProgressReporter,
    pub options: RunOptions,
    pub overlay: DryRunOverlay,
}

impl<'a> ImportContext<'a> {
    pub fn new(
        source: &'a dyn SourceStore,
        target: &'a dyn TargetStore,
        cache: &'a MappingCache,
        reporter: &'a dyn ProgressReporter,
        options: RunOptions,
    ) -> Self {
        Self {
            source,
            target,
            cache,
            reporter,
            options,
            overlay: DryRunOverlay::new(),
        }
    }
}

/// Unit of work of a migration: imports one entity type (and any entities
/// that cannot exist without it) from the source store.
#[async_trait]
pub trait EntityImporter: Send + Sync {
    fn entity_name(&self) -> EntityId;

    /// Primary source collection, for logging.
    fn source_table(&self) -> &'static str;

    /// Every source collection read by this importer.
    fn source_tables(&self) -> Vec<&'static str> {
        vec![self.source_table()]
    }

    fn dependencies(&self) -> Vec<ImporterDependency>;

    /// Tags whose mappings belong to this importer.
    fn cache_tags(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Import all eligible source rows.
    ///
    /// Per-record problems end up in `result`; an error is returned only
    /// when the importer cannot continue at all.
    async fn import(
        &self,
        ctx: &ImportContext<'_>,
        result: &mut ImportResult,
    ) -> Result<(), MigrationError>;

    async fn is_completed(&self, cache: &MappingCache) -> Result<bool, CacheError> {
        cache.is_completed(self.entity_name()).await
    }

    async fn mark_completed(&self, cache: &MappingCache) -> Result<(), CacheError> {
        cache.mark_completed(self.entity_name()).await
    }

    /// Forget this importer's tagged mappings and completion marker so the
    /// next run starts from scratch.
    async fn cleanup(&self, cache: &MappingCache) -> Result<usize, CacheError> {
        let mut removed = 0;
        for tag in self.cache_tags() {
            removed += cache.flush(tag).await?;
        }
        cache.clear_completed(self.entity_name()).await?;
        Ok(removed)
    }
}

/// Importer made of one or more policies run in sequence.
///
/// Composite importers run prerequisite sub-imports (categories before
/// forums, for example) inside the same `import()` call.
pub struct PolicyImporter {
    entity: EntityId,
    dependencies: Vec<ImporterDependency>,
    steps: Vec<Box<dyn EntityPolicy>>,
}

impl PolicyImporter {
    pub fn single(policy: impl EntityPolicy + 'static, dependencies: Vec<ImporterDependency>) -> Self {
        Self {
            entity: policy.entity(),
            dependencies,
            steps: vec![Box::new(policy)],
        }
    }

    pub fn composite(
        entity: EntityId,
        steps: Vec<Box<dyn EntityPolicy>>,
        dependencies: Vec<ImporterDependency>,
    ) -> Self {
        Self {
            entity,
            dependencies,
            steps,
        }
    }
}

#[async_trait]
impl EntityImporter for PolicyImporter {
    fn entity_name(&self) -> EntityId {
        self.entity
    }

    fn source_table(&self) -> &'static str {
        self.steps
            .iter()
            .find(|step| step.entity() == self.entity)
            .or(self.steps.last())
            .map(|step| step.source().table)
            .unwrap_or("")
    }

    fn source_tables(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.source().table).collect()
    }

    fn dependencies(&self) -> Vec<ImporterDependency> {
        self.dependencies.clone()
    }

    fn cache_tags(&self) -> Vec<&'static str> {
        let mut tags = Vec::new();
        for step in &self.steps {
            if let CacheScope::Tagged(tag) = step.cache_scope() {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        tags
    }

    async fn import(
        &self,
        ctx: &ImportContext<'_>,
        result: &mut ImportResult,
    ) -> Result<(), MigrationError> {
        for step in &self.steps {
            engine::run_import(step.as_ref(), ctx, result).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_ids_are_negative_and_unique() {
        let overlay = DryRunOverlay::new();
        let a = overlay.allocate(EntityId::FORUMS, 1, Some("slug=\"a\"".into()));
        let b = overlay.allocate(EntityId::FORUMS, 2, None);

        assert!(a < 0 && b < 0);
        assert_ne!(a, b);
        assert_eq!(overlay.lookup(EntityId::FORUMS, 1), Some(a));
        assert_eq!(overlay.find_key(EntityId::FORUMS, "slug=\"a\""), Some(a));
        assert_eq!(overlay.lookup(EntityId::TOPICS, 1), None);
    }

    #[test]
    fn test_full_pass() {
        assert!(RunOptions::default().is_full_pass());
        assert!(
            !RunOptions {
                offset: 5,
                ..RunOptions::default()
            }
            .is_full_pass()
        );
    }
}
