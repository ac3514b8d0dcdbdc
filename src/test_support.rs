//! In-memory source and target stores.
//!
//! Used by the test suites and for rehearsing a migration against fixture
//! data without any database.

use crate::error::StoreError;
use crate::migration::entity::EntityId;
use crate::migration::source::{SourceQuery, SourceRow, SourceStore};
use crate::migration::target::{Fields, NaturalKey, TargetStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

/// Source store holding tables of JSON rows.
#[derive(Default)]
pub struct MemorySourceStore {
    tables: Mutex<HashMap<String, Vec<SourceRow>>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table; inserting also creates tables implicitly.
    pub fn create_table(&self, table: &str) {
        self.tables.lock().entry(table.to_string()).or_default();
    }

    /// Insert a row given as a JSON object. Non-object values are ignored.
    pub fn insert(&self, table: &str, row: Value) {
        if let Value::Object(columns) = row {
            self.tables
                .lock()
                .entry(table.to_string())
                .or_default()
                .push(SourceRow::new(columns));
        }
    }

    pub fn insert_all(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        for row in rows {
            self.insert(table, row);
        }
    }

    fn matching(&self, query: &SourceQuery) -> Result<Vec<SourceRow>, StoreError> {
        let tables = self.tables.lock();
        let rows = tables
            .get(query.table)
            .ok_or_else(|| StoreError::Other(format!("table {} does not exist", query.table)))?;

        let mut rows: Vec<SourceRow> = rows
            .iter()
            .filter(|row| query.filter.as_ref().is_none_or(|f| f.matches(row)))
            .cloned()
            .collect();
        rows.sort_by_key(|row| {
            row.opt_i64(query.primary_key)
                .ok()
                .flatten()
                .unwrap_or(i64::MIN)
        });
        Ok(rows)
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.tables.lock().contains_key(table))
    }

    async fn count(&self, query: &SourceQuery) -> Result<u64, StoreError> {
        Ok(self.matching(query)?.len() as u64)
    }

    async fn fetch_page(
        &self,
        query: &SourceQuery,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<SourceRow>, StoreError> {
        Ok(self
            .matching(query)?
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[derive(Default)]
struct TargetState {
    records: HashMap<EntityId, Vec<Fields>>,
    next_id: HashMap<EntityId, i64>,
    links: Vec<(String, (String, i64), (String, i64))>,
}

/// Target store keeping created records in memory.
///
/// Ids are assigned per entity starting at 1 and written into the `id`
/// field of each record.
#[derive(Default)]
pub struct MemoryTargetStore {
    state: Mutex<TargetState>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record as if it had been created earlier, returning its id.
    pub fn seed(&self, entity: EntityId, fields: Value) -> i64 {
        let fields = match fields {
            Value::Object(fields) => fields,
            _ => Fields::new(),
        };
        self.insert(entity, fields)
    }

    fn insert(&self, entity: EntityId, mut fields: Fields) -> i64 {
        let mut state = self.state.lock();
        let next = state.next_id.entry(entity).or_insert(0);
        *next += 1;
        let id = *next;
        fields.insert("id".to_string(), id.into());
        state.records.entry(entity).or_default().push(fields);
        id
    }

    pub fn count(&self, entity: EntityId) -> usize {
        self.state.lock().records.get(&entity).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.state.lock().records.values().map(Vec::len).sum()
    }

    pub fn records(&self, entity: EntityId) -> Vec<Fields> {
        self.state
            .lock()
            .records
            .get(&entity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record(&self, entity: EntityId, id: i64) -> Option<Fields> {
        self.records(entity)
            .into_iter()
            .find(|fields| fields.get("id").and_then(Value::as_i64) == Some(id))
    }

    /// Links created through `relation`, as `(owner id, other id)`.
    pub fn links(&self, relation: &str) -> Vec<(i64, i64)> {
        self.state
            .lock()
            .links
            .iter()
            .filter(|(name, _, _)| name == relation)
            .map(|(_, owner, other)| (owner.1, other.1))
            .collect()
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn find_existing(
        &self,
        entity: EntityId,
        key: &NaturalKey,
    ) -> Result<Option<i64>, StoreError> {
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self.state.lock().records.get(&entity).and_then(|records| {
            records
                .iter()
                .find(|fields| key.matches(fields))
                .and_then(|fields| fields.get("id").and_then(Value::as_i64))
        }))
    }

    async fn create(&self, entity: EntityId, fields: &Fields) -> Result<i64, StoreError> {
        Ok(self.insert(entity, fields.clone()))
    }

    async fn attach(
        &self,
        relation: &str,
        owner: (&str, i64),
        other: (&str, i64),
    ) -> Result<(), StoreError> {
        let link = (
            relation.to_string(),
            (owner.0.to_string(), owner.1),
            (other.0.to_string(), other.1),
        );
        let mut state = self.state.lock();
        if !state.links.contains(&link) {
            state.links.push(link);
        }
        Ok(())
    }
}
