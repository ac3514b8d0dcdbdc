//! Engine behavior: idempotence, partial failure, missing mappings, dry
//! runs, paging, checkpoints, link failures and cache outages.

use async_trait::async_trait;
use legacy_migrator::error::{MigrationError, RecordError, StoreError};
use legacy_migrator::invision::transform::fields;
use legacy_migrator::invision::{
    ForumCategoryPolicy, ForumPolicy, PostPolicy, TopicPolicy, UserPolicy,
};
use legacy_migrator::migration::cache::{
    CacheBackend, CacheError, CacheScope, MemoryCacheBackend, StoredEntry,
};
use legacy_migrator::migration::outcome::{Detail, detail};
use legacy_migrator::migration::report::NullReporter;
use legacy_migrator::migration::{
    EntityId, EntityImporter, EntityPolicy, FailureKind, ImportContext, ImportResult,
    MappingCache, NaturalKey, PolicyImporter, Reference, ResolvedRefs, RunOptions, SourceQuery,
    SourceRow, TargetRecord, TargetStore,
};
use legacy_migrator::migration::target::{Attachment, ChildRecords, Fields};
use legacy_migrator::test_support::{MemorySourceStore, MemoryTargetStore};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn members(source: &MemorySourceStore, count: i64) {
    for id in 1..=count {
        source.insert(
            "core_members",
            json!({
                "member_id": id,
                "name": format!("member{id}"),
                "email": format!("Member{id}@Example.com"),
                "joined": 1_600_000_000 + id,
            }),
        );
    }
}

fn forums(source: &MemorySourceStore) {
    source.insert_all(
        "forums_forums",
        [
            json!({"id": 1, "parent_id": -1, "name": "Community", "name_seo": "community"}),
            json!({"id": 2, "parent_id": 1, "name": "General", "name_seo": "general"}),
        ],
    );
    source.insert_all(
        "forums_topics",
        [
            json!({"tid": 10, "forum_id": 2, "starter_id": 1, "title": "Hello", "start_date": 1_600_000_100}),
            json!({"tid": 11, "forum_id": 2, "starter_id": 0, "title": "Guest topic", "start_date": 1_600_000_200}),
        ],
    );
}

fn users_importer() -> PolicyImporter {
    PolicyImporter::single(UserPolicy, vec![])
}

fn forums_importer() -> PolicyImporter {
    PolicyImporter::composite(
        EntityId::FORUMS,
        vec![Box::new(ForumCategoryPolicy), Box::new(ForumPolicy)],
        vec![],
    )
}

fn memory_cache() -> (MappingCache, Arc<MemoryCacheBackend>) {
    let backend = Arc::new(MemoryCacheBackend::new());
    (MappingCache::new("invision", backend.clone()), backend)
}

fn source_ids(result: &ImportResult, entity: EntityId) -> Vec<i64> {
    result
        .get(entity)
        .map(|tally| {
            tally
                .migrated_details
                .iter()
                .map(|d| d["source_id"].as_i64().unwrap())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn second_run_skips_every_record() {
    let source = MemorySourceStore::new();
    members(&source, 4);
    let target = MemoryTargetStore::new();
    let (cache, _) = memory_cache();
    let ctx = ImportContext::new(&source, &target, &cache, &NullReporter, RunOptions::default());

    let mut first = ImportResult::new();
    users_importer().import(&ctx, &mut first).await.unwrap();
    assert_eq!(first.migrated(EntityId::USERS), 4);

    let mut second = ImportResult::new();
    users_importer().import(&ctx, &mut second).await.unwrap();
    assert_eq!(second.migrated(EntityId::USERS), 0);
    assert_eq!(second.skipped(EntityId::USERS), 4);
    assert!(
        second.get(EntityId::USERS).unwrap().skipped_details
            .iter()
            .all(|d| d["reason"] == "Already exists.")
    );
    assert_eq!(target.count(EntityId::USERS), 4);
}

#[tokio::test]
async fn existing_records_are_mapped_even_with_an_empty_cache() {
    let source = MemorySourceStore::new();
    members(&source, 2);
    let target = MemoryTargetStore::new();
    let existing = target.seed(EntityId::USERS, json!({"email": "member2@example.com"}));
    let (cache, _) = memory_cache();
    let ctx = ImportContext::new(&source, &target, &cache, &NullReporter, RunOptions::default());

    let mut result = ImportResult::new();
    users_importer().import(&ctx, &mut result).await.unwrap();

    assert_eq!(result.migrated(EntityId::USERS), 1);
    assert_eq!(result.skipped(EntityId::USERS), 1);
    assert_eq!(cache.get(EntityId::USERS, 2).await.unwrap(), Some(existing));
}

/// Fails the transform of record 5 only.
struct FlakyPolicy;

const NUMBERS: EntityId = EntityId::new("numbers");

impl EntityPolicy for FlakyPolicy {
    fn entity(&self) -> EntityId {
        NUMBERS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("numbers", "id")
    }

    fn natural_key(&self, _row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new())
    }

    fn transform(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        let id = row.i64("id")?;
        if id == 5 {
            return Err(RecordError::Transform("cannot convert record 5".into()));
        }
        Ok(TargetRecord::new(fields(json!({"value": id * 10}))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("id", row.get("id").clone())])
    }
}

#[tokio::test]
async fn one_bad_record_does_not_abort_the_batch() {
    let source = MemorySourceStore::new();
    source.insert_all("numbers", (1..=10).map(|id| json!({"id": id})));
    let target = MemoryTargetStore::new();
    let (cache, _) = memory_cache();
    let ctx = ImportContext::new(&source, &target, &cache, &NullReporter, RunOptions::default());

    let mut result = ImportResult::new();
    PolicyImporter::single(FlakyPolicy, vec![])
        .import(&ctx, &mut result)
        .await
        .unwrap();

    assert_eq!(result.migrated(NUMBERS) + result.skipped(NUMBERS), 9);
    assert_eq!(result.failed(NUMBERS), 1);
    let failure = &result.get(NUMBERS).unwrap().failed_details[0];
    assert_eq!(failure["source_id"], 5);
    assert_eq!(failure["kind"], "transform");
    assert_eq!(target.count(NUMBERS), 9);
}

#[tokio::test]
async fn topic_without_forum_mapping_fails_with_reason() {
    let source = MemorySourceStore::new();
    source.insert(
        "forums_topics",
        json!({"tid": 7, "forum_id": 3, "starter_id": 0, "title": "Orphan", "start_date": 1}),
    );
    let target = MemoryTargetStore::new();
    let (cache, _) = memory_cache();
    let ctx = ImportContext::new(&source, &target, &cache, &NullReporter, RunOptions::default());

    let mut result = ImportResult::new();
    PolicyImporter::single(TopicPolicy, vec![])
        .import(&ctx, &mut result)
        .await
        .unwrap();

    assert_eq!(result.failed(EntityId::TOPICS), 1);
    let failure = &result.get(EntityId::TOPICS).unwrap().failed_details[0];
    assert!(failure["error"].as_str().unwrap().contains("forum not found"));
    assert_eq!(
        failure["kind"],
        serde_json::to_value(FailureKind::MissingMapping).unwrap()
    );
    assert_eq!(cache.get(EntityId::TOPICS, 7).await.unwrap(), None);
    assert_eq!(target.count(EntityId::TOPICS), 0);
}

#[tokio::test]
async fn dry_run_reports_without_writing() {
    let source = MemorySourceStore::new();
    members(&source, 1);
    forums(&source);
    let target = MemoryTargetStore::new();
    let (cache, backend) = memory_cache();
    let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };
    let ctx = ImportContext::new(&source, &target, &cache, &NullReporter, options);

    let mut result = ImportResult::new();
    users_importer().import(&ctx, &mut result).await.unwrap();
    forums_importer().import(&ctx, &mut result).await.unwrap();
    PolicyImporter::single(TopicPolicy, vec![])
        .import(&ctx, &mut result)
        .await
        .unwrap();

    assert_eq!(result.migrated(EntityId::USERS), 1);
    assert_eq!(result.migrated(EntityId::FORUM_CATEGORIES), 1);
    assert_eq!(result.migrated(EntityId::FORUMS), 1);
    // Topics resolve forums created earlier in the same dry run.
    assert_eq!(result.migrated(EntityId::TOPICS), 2);
    assert_eq!(result.total_failed(), 0);

    assert_eq!(target.total(), 0);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn offset_and_limit_split_a_run_without_gaps() {
    let source = MemorySourceStore::new();
    source.insert_all("numbers", (1..=12).rev().map(|id| json!({"id": id})));

    let run = |offset: u64, limit: u64| {
        let source = &source;
        async move {
            let target = MemoryTargetStore::new();
            let (cache, _) = memory_cache();
            let options = RunOptions {
                batch_size: 2,
                limit: Some(limit),
                offset,
                ..RunOptions::default()
            };
            let ctx = ImportContext::new(source, &target, &cache, &NullReporter, options);
            let mut result = ImportResult::new();
            PolicyImporter::single(FlakyPolicy, vec![])
                .import(&ctx, &mut result)
                .await
                .unwrap();
            let mut ids = source_ids(&result, NUMBERS);
            ids.extend(
                result
                    .get(NUMBERS)
                    .map(|t| t.failed_details.iter().map(|d| d["source_id"].as_i64().unwrap()).collect::<Vec<_>>())
                    .unwrap_or_default(),
            );
            ids.sort();
            ids
        }
    };

    let mut split = run(0, 5).await;
    split.extend(run(5, 5).await);
    let whole = run(0, 10).await;

    assert_eq!(split, whole);
    assert_eq!(whole, (1..=10).collect::<Vec<i64>>());
}

/// Backend whose every operation fails.
struct UnavailableBackend;

#[async_trait]
impl CacheBackend for UnavailableBackend {
    async fn get(&self, _key: &str) -> Result<Option<StoredEntry>, CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn put(&self, _key: String, _entry: StoredEntry) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn forget_many(&self, _keys: &[String]) -> Result<usize, CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn flush_tag(&self, _tag: &str) -> Result<usize, CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn count_prefix(&self, _prefix: &str) -> Result<usize, CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }
}

#[tokio::test]
async fn cache_outage_fails_the_importer() {
    let source = MemorySourceStore::new();
    forums(&source);
    let target = MemoryTargetStore::new();
    let cache = MappingCache::new("invision", Arc::new(UnavailableBackend));
    let ctx = ImportContext::new(&source, &target, &cache, &NullReporter, RunOptions::default());

    let mut result = ImportResult::new();
    let err = PolicyImporter::single(TopicPolicy, vec![])
        .import(&ctx, &mut result)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Cache(CacheError::Backend(_))));
    // The outage is not mistaken for a missing forum mapping.
    assert_eq!(result.failed(EntityId::TOPICS), 0);
}

/// Counts how often the cache is persisted.
#[derive(Default)]
struct CountingBackend {
    inner: MemoryCacheBackend,
    saves: AtomicUsize,
}

#[async_trait]
impl CacheBackend for CountingBackend {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: String, entry: StoredEntry) -> Result<(), CacheError> {
        self.inner.put(key, entry).await
    }

    async fn forget_many(&self, keys: &[String]) -> Result<usize, CacheError> {
        self.inner.forget_many(keys).await
    }

    async fn flush_tag(&self, tag: &str) -> Result<usize, CacheError> {
        self.inner.flush_tag(tag).await
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        self.inner.count_prefix(prefix).await
    }

    async fn persist(&self) -> Result<(), CacheError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.persist().await
    }
}

#[tokio::test]
async fn cache_is_checkpointed_every_few_pages_and_at_the_end() {
    let source = MemorySourceStore::new();
    source.insert_all("numbers", (1..=10).map(|id| json!({"id": id})));

    for (every, expected) in [(1, 5), (2, 3), (10, 1)] {
        let target = MemoryTargetStore::new();
        let backend = Arc::new(CountingBackend::default());
        let cache = MappingCache::new("invision", backend.clone());
        let options = RunOptions {
            batch_size: 2,
            checkpoint_every: every,
            ..RunOptions::default()
        };
        let ctx = ImportContext::new(&source, &target, &cache, &NullReporter, options);

        let mut result = ImportResult::new();
        PolicyImporter::single(FlakyPolicy, vec![])
            .import(&ctx, &mut result)
            .await
            .unwrap();

        assert_eq!(backend.saves.load(Ordering::SeqCst), expected, "every {every} pages");
        assert_eq!(cache.count(NUMBERS).await.unwrap(), 9);
    }
}

const WIDGETS: EntityId = EntityId::new("widgets");
const WIDGET_PARTS: EntityId = EntityId::new("widget_parts");
const WIDGET_TAGS: EntityId = EntityId::new("widget_tags");

/// A widget linked to tag 9, with one part.
struct WidgetPolicy;

impl EntityPolicy for WidgetPolicy {
    fn entity(&self) -> EntityId {
        WIDGETS
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("widgets", "id")
    }

    fn natural_key(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new().with("slug", row.str("slug")?))
    }

    fn transform(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        Ok(TargetRecord::new(fields(json!({"slug": row.str("slug")?})))
            .with_attachment(Attachment {
                relation: "widget_tags",
                owner_field: "widget_id",
                other_field: "tag_id",
                other_id: 9,
            })
            .with_children(ChildRecords {
                entity: WIDGET_PARTS,
                parent_field: "widget_id",
                rows: vec![fields(json!({"name": "bolt"}))],
            }))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("slug", row.get("slug").clone())])
    }
}

/// Target store whose first link attempt fails.
#[derive(Default)]
struct FirstLinkFails {
    inner: MemoryTargetStore,
    tripped: AtomicBool,
}

#[async_trait]
impl TargetStore for FirstLinkFails {
    async fn find_existing(
        &self,
        entity: EntityId,
        key: &NaturalKey,
    ) -> Result<Option<i64>, StoreError> {
        self.inner.find_existing(entity, key).await
    }

    async fn create(&self, entity: EntityId, fields: &Fields) -> Result<i64, StoreError> {
        self.inner.create(entity, fields).await
    }

    async fn attach(
        &self,
        relation: &str,
        owner: (&str, i64),
        other: (&str, i64),
    ) -> Result<(), StoreError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Other("deadlock detected".into()));
        }
        self.inner.attach(relation, owner, other).await
    }
}

#[tokio::test]
async fn failed_link_keeps_parent_and_children_and_is_repaired_on_rerun() {
    let source = MemorySourceStore::new();
    source.insert("widgets", json!({"id": 1, "slug": "sprocket"}));
    let target = FirstLinkFails::default();
    let (cache, _) = memory_cache();
    let ctx = ImportContext::new(&source, &target, &cache, &NullReporter, RunOptions::default());

    let mut first = ImportResult::new();
    PolicyImporter::single(WidgetPolicy, vec![])
        .import(&ctx, &mut first)
        .await
        .unwrap();

    assert_eq!(first.migrated(WIDGETS), 1);
    assert_eq!(first.failed(WIDGETS), 0);
    assert_eq!(first.migrated(WIDGET_PARTS), 1);
    assert_eq!(first.failed(WIDGET_TAGS), 1);
    let failure = &first.get(WIDGET_TAGS).unwrap().failed_details[0];
    assert_eq!(failure["source_id"], 1);
    assert!(failure["error"].as_str().unwrap().contains("deadlock detected"));
    assert_eq!(cache.get(WIDGETS, 1).await.unwrap(), Some(1));
    assert!(target.inner.links("widget_tags").is_empty());

    let mut second = ImportResult::new();
    PolicyImporter::single(WidgetPolicy, vec![])
        .import(&ctx, &mut second)
        .await
        .unwrap();

    assert_eq!(second.skipped(WIDGETS), 1);
    assert_eq!(second.total_failed(), 0);
    assert_eq!(target.inner.links("widget_tags"), vec![(1, 9)]);
    assert_eq!(target.inner.count(WIDGET_PARTS), 1);
}

const NOTES: EntityId = EntityId::new("notes");

/// Notes keyed by slug alone, with a required author.
struct NotePolicy;

impl EntityPolicy for NotePolicy {
    fn entity(&self) -> EntityId {
        NOTES
    }

    fn source(&self) -> SourceQuery {
        SourceQuery::new("notes", "id")
    }

    fn references(&self) -> Vec<Reference> {
        vec![Reference::required("author_id", EntityId::USERS, "user")]
    }

    fn key_uses_references(&self) -> bool {
        false
    }

    fn natural_key(&self, row: &SourceRow, _refs: &ResolvedRefs) -> Result<NaturalKey, RecordError> {
        Ok(NaturalKey::new().with("slug", row.str("slug")?))
    }

    fn transform(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError> {
        Ok(TargetRecord::new(fields(json!({
            "slug": row.str("slug")?,
            "user_id": refs.require("author_id")?,
        }))))
    }

    fn describe(&self, row: &SourceRow) -> Detail {
        detail([("slug", row.get("slug").clone())])
    }
}

#[tokio::test]
async fn existing_record_is_skipped_before_missing_mappings_fail_it() {
    let source = MemorySourceStore::new();
    source.insert_all(
        "notes",
        [
            json!({"id": 1, "slug": "welcome", "author_id": 4}),
            json!({"id": 2, "slug": "rules", "author_id": 4}),
        ],
    );
    let target = MemoryTargetStore::new();
    let existing = target.seed(NOTES, json!({"slug": "welcome", "user_id": 40}));
    let (cache, _) = memory_cache();
    let ctx = ImportContext::new(&source, &target, &cache, &NullReporter, RunOptions::default());

    let mut result = ImportResult::new();
    PolicyImporter::single(NotePolicy, vec![])
        .import(&ctx, &mut result)
        .await
        .unwrap();

    assert_eq!(result.skipped(NOTES), 1);
    assert_eq!(cache.get(NOTES, 1).await.unwrap(), Some(existing));
    assert_eq!(result.failed(NOTES), 1);
    let failure = &result.get(NOTES).unwrap().failed_details[0];
    assert_eq!(failure["source_id"], 2);
    assert!(failure["error"].as_str().unwrap().contains("user not found"));
    assert_eq!(target.count(NOTES), 1);
}

#[tokio::test]
async fn guest_posts_in_the_same_second_stay_distinct() {
    let source = MemorySourceStore::new();
    source.insert_all(
        "forums_posts",
        [
            json!({"pid": 1, "topic_id": 10, "author_id": 0, "author_name": "Visitor", "post": "<p>First!</p>", "post_date": 1_600_000_000}),
            json!({"pid": 2, "topic_id": 10, "author_id": 0, "author_name": "Visitor", "post": "<p>Second</p>", "post_date": 1_600_000_000}),
        ],
    );
    let target = MemoryTargetStore::new();
    let (cache, _) = memory_cache();
    cache
        .put(EntityId::TOPICS, 10, 70, &CacheScope::Tagged("topics"), None)
        .await
        .unwrap();
    let ctx = ImportContext::new(&source, &target, &cache, &NullReporter, RunOptions::default());

    let mut result = ImportResult::new();
    PolicyImporter::single(PostPolicy, vec![])
        .import(&ctx, &mut result)
        .await
        .unwrap();

    assert_eq!(result.migrated(EntityId::POSTS), 2);
    assert_eq!(result.skipped(EntityId::POSTS), 0);
    assert_eq!(target.count(EntityId::POSTS), 2);
}
