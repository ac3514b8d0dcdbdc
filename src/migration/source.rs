//! Read-only access to the legacy source store.
//!
//! The engine only needs three things from a source: whether a table
//! exists, how many rows match a filter, and a page of matching rows in
//! ascending primary-key order.

use crate::error::{RecordError, StoreError};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid regex")
});

/// Reject anything that is not a plain (optionally schema-qualified) SQL
/// identifier. Table and column names are interpolated, never bound.
pub(crate) fn checked_identifier(name: &str) -> Result<&str, StoreError> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Row predicate applied by the source store.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(&'static str, Value),
    Ne(&'static str, Value),
    Gt(&'static str, Value),
    In(&'static str, Vec<Value>),
    IsNull(&'static str),
    NotNull(&'static str),
    And(Vec<Filter>),
}

impl Filter {
    /// Evaluate the predicate against an in-memory row.
    pub fn matches(&self, row: &SourceRow) -> bool {
        match self {
            Filter::Eq(column, value) => json_eq(row.get(column), value),
            Filter::Ne(column, value) => !json_eq(row.get(column), value),
            Filter::Gt(column, value) => match (row.get(column), value) {
                (Value::Number(a), Value::Number(b)) => {
                    a.as_f64().unwrap_or(f64::NAN) > b.as_f64().unwrap_or(f64::NAN)
                }
                (Value::String(a), Value::String(b)) => a > b,
                _ => false,
            },
            Filter::In(column, values) => values.iter().any(|v| json_eq(row.get(column), v)),
            Filter::IsNull(column) => row.get(column).is_null(),
            Filter::NotNull(column) => !row.get(column).is_null(),
            Filter::And(filters) => filters.iter().all(|f| f.matches(row)),
        }
    }

    fn render(&self, sql: &mut QueryBuilder<'_, Postgres>) -> Result<(), StoreError> {
        match self {
            Filter::Eq(column, value) => {
                sql.push(format!("to_jsonb(t.{}) = ", checked_identifier(column)?));
                sql.push_bind(Json(value.clone()));
                sql.push("::jsonb");
            }
            Filter::Ne(column, value) => {
                sql.push(format!(
                    "to_jsonb(t.{}) IS DISTINCT FROM ",
                    checked_identifier(column)?
                ));
                sql.push_bind(Json(value.clone()));
                sql.push("::jsonb");
            }
            Filter::Gt(column, value) => {
                sql.push(format!("to_jsonb(t.{}) > ", checked_identifier(column)?));
                sql.push_bind(Json(value.clone()));
                sql.push("::jsonb");
            }
            Filter::In(column, values) => {
                if values.is_empty() {
                    sql.push("FALSE");
                    return Ok(());
                }
                let column = checked_identifier(column)?;
                sql.push("(");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        sql.push(" OR ");
                    }
                    sql.push(format!("to_jsonb(t.{}) = ", column));
                    sql.push_bind(Json(value.clone()));
                    sql.push("::jsonb");
                }
                sql.push(")");
            }
            Filter::IsNull(column) => {
                sql.push(format!("t.{} IS NULL", checked_identifier(column)?));
            }
            Filter::NotNull(column) => {
                sql.push(format!("t.{} IS NOT NULL", checked_identifier(column)?));
            }
            Filter::And(filters) => {
                if filters.is_empty() {
                    sql.push("TRUE");
                    return Ok(());
                }
                sql.push("(");
                for (i, filter) in filters.iter().enumerate() {
                    if i > 0 {
                        sql.push(" AND ");
                    }
                    filter.render(sql)?;
                }
                sql.push(")");
            }
        }
        Ok(())
    }
}

/// Numbers compare by value so `1` matches `1.0`.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// The collection an entity is scanned from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    pub table: &'static str,
    pub primary_key: &'static str,
    pub filter: Option<Filter>,
}

impl SourceQuery {
    pub fn new(table: &'static str, primary_key: &'static str) -> Self {
        Self {
            table,
            primary_key,
            filter: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// One row read from the source store, column name to JSON value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRow(Map<String, Value>);

static NULL: Value = Value::Null;

impl SourceRow {
    pub fn new(columns: Map<String, Value>) -> Self {
        Self(columns)
    }

    /// Column value; missing columns read as null.
    pub fn get(&self, column: &str) -> &Value {
        self.0.get(column).unwrap_or(&NULL)
    }

    pub fn columns(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Integer column, accepting numeric strings as legacy schemas often
    /// store ids as text.
    pub fn opt_i64(&self, column: &str) -> Result<Option<i64>, RecordError> {
        match self.get(column) {
            Value::Null => Ok(None),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| RecordError::invalid_field(column, "not an integer")),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| RecordError::invalid_field(column, format!("'{}' is not an integer", s))),
            Value::Bool(b) => Ok(Some(i64::from(*b))),
            other => Err(RecordError::invalid_field(
                column,
                format!("unexpected value {}", other),
            )),
        }
    }

    pub fn i64(&self, column: &str) -> Result<i64, RecordError> {
        self.opt_i64(column)?
            .ok_or_else(|| RecordError::invalid_field(column, "missing value"))
    }

    pub fn opt_f64(&self, column: &str) -> Result<Option<f64>, RecordError> {
        match self.get(column) {
            Value::Null => Ok(None),
            Value::Number(n) => Ok(n.as_f64()),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| RecordError::invalid_field(column, format!("'{}' is not a number", s))),
            other => Err(RecordError::invalid_field(
                column,
                format!("unexpected value {}", other),
            )),
        }
    }

    pub fn opt_str(&self, column: &str) -> Option<&str> {
        self.get(column).as_str()
    }

    pub fn str(&self, column: &str) -> Result<&str, RecordError> {
        self.opt_str(column)
            .ok_or_else(|| RecordError::invalid_field(column, "missing text value"))
    }

    /// Truthy flag column (`1`, `true`, `"1"`).
    pub fn flag(&self, column: &str) -> bool {
        match self.get(column) {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => matches!(s.as_str(), "1" | "true" | "yes"),
            _ => false,
        }
    }
}

impl From<Map<String, Value>> for SourceRow {
    fn from(columns: Map<String, Value>) -> Self {
        Self(columns)
    }
}

/// Generic tabular reader over the legacy schema.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    /// Number of rows matching the query's filter.
    async fn count(&self, query: &SourceQuery) -> Result<u64, StoreError>;

    /// Rows matching the filter, ascending by primary key, skipping
    /// `offset` and returning at most `limit`.
    async fn fetch_page(
        &self,
        query: &SourceQuery,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<SourceRow>, StoreError>;
}

/// Source store reading a legacy schema loaded into Postgres.
pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn push_where(sql: &mut QueryBuilder<'_, Postgres>, query: &SourceQuery) -> Result<(), StoreError> {
        if let Some(filter) = &query.filter {
            sql.push(" WHERE ");
            filter.render(sql)?;
        }
        Ok(())
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let table = checked_identifier(table)?;
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn count(&self, query: &SourceQuery) -> Result<u64, StoreError> {
        let mut sql = QueryBuilder::new(format!(
            "SELECT COUNT(*) FROM {} t",
            checked_identifier(query.table)?
        ));
        Self::push_where(&mut sql, query)?;

        let count: i64 = sql.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_page(
        &self,
        query: &SourceQuery,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<SourceRow>, StoreError> {
        let mut sql = QueryBuilder::new(format!(
            "SELECT to_jsonb(t) FROM {} t",
            checked_identifier(query.table)?
        ));
        Self::push_where(&mut sql, query)?;
        sql.push(format!(
            " ORDER BY t.{} ASC LIMIT ",
            checked_identifier(query.primary_key)?
        ));
        sql.push_bind(limit as i64);
        sql.push(" OFFSET ");
        sql.push_bind(offset as i64);

        let rows: Vec<Json<Map<String, Value>>> =
            sql.build_query_scalar().fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|Json(row)| SourceRow(row)).collect())
    }
}
