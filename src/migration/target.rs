//! Write access to the target store.
//!
//! The target is treated as a generic entity store: find a record by a
//! natural key, create a record from field values, and link two records
//! through a relationship table.

use super::entity::EntityId;
use super::source::checked_identifier;
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;

/// Column values of a target record.
pub type Fields = Map<String, Value>;

/// Content-derived key identifying a target record that already represents
/// a source record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NaturalKey {
    fields: Vec<(&'static str, Value)>,
}

impl NaturalKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.fields.push((column, value.into()));
        self
    }

    pub fn fields(&self) -> &[(&'static str, Value)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether `record` carries the same values for every key column.
    pub fn matches(&self, record: &Fields) -> bool {
        self.fields
            .iter()
            .all(|(column, value)| record.get(*column).unwrap_or(&Value::Null) == value)
    }

    /// Stable text form, used to spot duplicates within a dry run.
    pub fn fingerprint(&self) -> String {
        self.fields
            .iter()
            .map(|(column, value)| format!("{}={}", column, value))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn as_object(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect()
    }
}

/// Dependent rows created together with their parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRecords {
    /// Result bucket and target collection of the children.
    pub entity: EntityId,
    /// Column receiving the parent's target id.
    pub parent_field: &'static str,
    pub rows: Vec<Fields>,
}

/// Link between a newly created record and an existing one.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub relation: &'static str,
    /// Column receiving the new record's id.
    pub owner_field: &'static str,
    pub other_field: &'static str,
    pub other_id: i64,
}

/// Everything written for one source record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetRecord {
    pub fields: Fields,
    pub children: Vec<ChildRecords>,
    pub attachments: Vec<Attachment>,
}

impl TargetRecord {
    pub fn new(fields: Fields) -> Self {
        Self {
            fields,
            children: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: ChildRecords) -> Self {
        self.children.push(children);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Id of an existing record of `entity` matching `key`.
    async fn find_existing(
        &self,
        entity: EntityId,
        key: &NaturalKey,
    ) -> Result<Option<i64>, StoreError>;

    /// Create a record and return its id.
    async fn create(&self, entity: EntityId, fields: &Fields) -> Result<i64, StoreError>;

    /// Link two records through `relation`. Linking twice is a no-op.
    async fn attach(
        &self,
        relation: &str,
        owner: (&str, i64),
        other: (&str, i64),
    ) -> Result<(), StoreError>;
}

/// Target store writing to Postgres tables.
///
/// Each entity maps to a table of the same name unless overridden. Field
/// values are passed as one JSON document and typed by Postgres through
/// `jsonb_populate_record`, so no per-entity row types are needed.
pub struct PgTargetStore {
    pool: PgPool,
    tables: HashMap<EntityId, String>,
}

impl PgTargetStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables: HashMap::new(),
        }
    }

    pub fn with_table(mut self, entity: EntityId, table: impl Into<String>) -> Self {
        self.tables.insert(entity, table.into());
        self
    }

    fn table(&self, entity: EntityId) -> Result<&str, StoreError> {
        let table = self
            .tables
            .get(&entity)
            .map(String::as_str)
            .unwrap_or(entity.as_str());
        checked_identifier(table)
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn find_existing(
        &self,
        entity: EntityId,
        key: &NaturalKey,
    ) -> Result<Option<i64>, StoreError> {
        if key.is_empty() {
            return Ok(None);
        }

        let table = self.table(entity)?;
        let mut sql: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT t.id::bigint FROM {table} t, jsonb_populate_record(NULL::{table}, "
        ));
        sql.push_bind(Json(key.as_object()));
        sql.push(") k WHERE ");
        for (i, (column, _)) in key.fields().iter().enumerate() {
            if i > 0 {
                sql.push(" AND ");
            }
            let column = checked_identifier(column)?;
            sql.push(format!("t.{column} IS NOT DISTINCT FROM k.{column}"));
        }
        sql.push(" ORDER BY t.id LIMIT 1");

        let id: Option<i64> = sql
            .build_query_scalar()
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn create(&self, entity: EntityId, fields: &Fields) -> Result<i64, StoreError> {
        let table = self.table(entity)?;

        if fields.is_empty() {
            let id: i64 = sqlx::query_scalar(&format!(
                "INSERT INTO {table} DEFAULT VALUES RETURNING id::bigint"
            ))
            .fetch_one(&self.pool)
            .await?;
            return Ok(id);
        }

        let columns = fields
            .keys()
            .map(|column| checked_identifier(column))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");

        let mut sql: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {table} ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table}, "
        ));
        sql.push_bind(Json(fields.clone()));
        sql.push(") RETURNING id::bigint");

        let id: i64 = sql.build_query_scalar().fetch_one(&self.pool).await?;
        log::trace!("created {} #{}", entity, id);
        Ok(id)
    }

    async fn attach(
        &self,
        relation: &str,
        owner: (&str, i64),
        other: (&str, i64),
    ) -> Result<(), StoreError> {
        let relation = checked_identifier(relation)?;
        let owner_field = checked_identifier(owner.0)?;
        let other_field = checked_identifier(other.0)?;

        sqlx::query(&format!(
            "INSERT INTO {relation} ({owner_field}, {other_field}) VALUES ($1, $2) ON CONFLICT DO NOTHING"
        ))
        .bind(owner.1)
        .bind(other.1)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_natural_key_matches_record() {
        let key = NaturalKey::new().with("email", "a@example.com").with("name", "A");

        let mut record = Fields::new();
        record.insert("email".into(), json!("a@example.com"));
        record.insert("name".into(), json!("A"));
        record.insert("id".into(), json!(3));
        assert!(key.matches(&record));

        record.insert("name".into(), json!("B"));
        assert!(!key.matches(&record));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = NaturalKey::new().with("slug", "news").with("parent_id", 4);
        assert_eq!(key.fingerprint(), "slug=\"news\"&parent_id=4");
    }
}
