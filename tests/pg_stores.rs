//! Postgres-backed stores. Skipped unless `TEST_DATABASE_URL` points at a
//! scratch database.

use legacy_migrator::db;
use legacy_migrator::migration::cache::{CacheScope, PgCacheBackend};
use legacy_migrator::migration::source::{Filter, PgSourceStore};
use legacy_migrator::migration::target::PgTargetStore;
use legacy_migrator::migration::{
    EntityId, MappingCache, NaturalKey, SourceQuery, SourceStore, TargetStore, state,
};
use serde_json::json;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use std::sync::Arc;

static TEST_MIGRATOR: Migrator = sqlx::migrate!("./migrations");

async fn test_pool(test: &str) -> Option<PgPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("skipping {test}: TEST_DATABASE_URL not set");
        return None;
    };
    Some(db::connect(&url, 2).await.expect("connect to test database"))
}

async fn table_count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = $1",
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .expect("lookup succeeded")
}

#[tokio::test]
async fn state_schema_and_pg_cache() {
    let Some(pool) = test_pool("state schema test").await else {
        return;
    };

    state::run_migrations(&pool).await.expect("migrations run");
    TEST_MIGRATOR.undo(&pool, 0).await.expect("migrations revert");
    assert_eq!(table_count(&pool, "migration_mappings").await, 0);

    state::run_migrations(&pool).await.expect("migrations rerun");
    state::run_migrations(&pool).await.expect("migrations are idempotent");
    assert_eq!(table_count(&pool, "migration_mappings").await, 1);

    let source = format!("pgtest-{}", uuid::Uuid::new_v4());
    let cache = MappingCache::new(source, Arc::new(PgCacheBackend::new(pool.clone())));

    cache
        .put(EntityId::USERS, 1, 10, &CacheScope::Forever, None)
        .await
        .unwrap();
    cache
        .put(EntityId::FORUMS, 1, 20, &CacheScope::Tagged("forums"), None)
        .await
        .unwrap();
    cache
        .put(EntityId::FORUMS, 1, 21, &CacheScope::Tagged("forums"), None)
        .await
        .unwrap();

    assert_eq!(cache.get(EntityId::USERS, 1).await.unwrap(), Some(10));
    assert_eq!(cache.get(EntityId::FORUMS, 1).await.unwrap(), Some(21));
    assert_eq!(cache.count(EntityId::FORUMS).await.unwrap(), 1);

    assert_eq!(cache.flush("forums").await.unwrap(), 1);
    assert_eq!(cache.get(EntityId::FORUMS, 1).await.unwrap(), None);
    assert_eq!(cache.get(EntityId::USERS, 1).await.unwrap(), Some(10));

    cache.mark_completed(EntityId::USERS).await.unwrap();
    assert!(cache.is_completed(EntityId::USERS).await.unwrap());
    assert!(cache.clear_completed(EntityId::USERS).await.unwrap());
    assert!(!cache.is_completed(EntityId::USERS).await.unwrap());
}

#[tokio::test]
async fn pg_source_and_target_stores() {
    let Some(pool) = test_pool("store test").await else {
        return;
    };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let legacy = format!("legacy_topics_{suffix}");
    let topics = format!("topics_{suffix}");
    let links = format!("topic_tags_{suffix}");

    sqlx::query(&format!(
        "CREATE TABLE {legacy} (tid BIGINT PRIMARY KEY, title TEXT, approved INT)"
    ))
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(&format!(
        "INSERT INTO {legacy} VALUES (3, 'c', 1), (1, 'a', 1), (2, 'b', 0), (4, 'd', 1)"
    ))
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(&format!(
        "CREATE TABLE {topics} (id BIGSERIAL PRIMARY KEY, title TEXT NOT NULL, forum_id BIGINT)"
    ))
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(&format!(
        "CREATE TABLE {links} (topic_id BIGINT, tag_id BIGINT, PRIMARY KEY (topic_id, tag_id))"
    ))
    .execute(&pool)
    .await
    .unwrap();

    // Query tables are `&'static str`.
    let legacy_table: &'static str = Box::leak(legacy.clone().into_boxed_str());
    let source = PgSourceStore::new(pool.clone());
    let query = SourceQuery::new(legacy_table, "tid").filter(Filter::Eq("approved", json!(1)));

    assert!(source.table_exists(legacy_table).await.unwrap());
    assert!(!source.table_exists("no_such_table_here").await.unwrap());
    assert_eq!(source.count(&query).await.unwrap(), 3);

    let page = source.fetch_page(&query, 1, 5).await.unwrap();
    let ids: Vec<i64> = page.iter().map(|row| row.i64("tid").unwrap()).collect();
    assert_eq!(ids, vec![3, 4]);

    let target = PgTargetStore::new(pool.clone()).with_table(EntityId::TOPICS, topics.clone());
    let mut fields = serde_json::Map::new();
    fields.insert("title".into(), json!("Welcome"));
    fields.insert("forum_id".into(), json!(null));
    let id = target.create(EntityId::TOPICS, &fields).await.unwrap();

    let key = NaturalKey::new()
        .with("title", "Welcome")
        .with("forum_id", serde_json::Value::Null);
    assert_eq!(target.find_existing(EntityId::TOPICS, &key).await.unwrap(), Some(id));
    let other = NaturalKey::new().with("title", "Missing");
    assert_eq!(target.find_existing(EntityId::TOPICS, &other).await.unwrap(), None);

    target.attach(&links, ("topic_id", id), ("tag_id", 9)).await.unwrap();
    target.attach(&links, ("topic_id", id), ("tag_id", 9)).await.unwrap();
    let linked: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {links}"))
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(linked, 1);

    for table in [&legacy, &topics, &links] {
        sqlx::query(&format!("DROP TABLE {table}"))
            .execute(&pool)
            .await
            .unwrap();
    }
}
