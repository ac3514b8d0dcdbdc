//! Per-entity import policy.
//!
//! A policy describes *what* to import for one entity type: where rows come
//! from, which foreign keys must be resolved, how duplicates are recognised
//! and how a row becomes target fields. The shared [`engine`] decides *how*.
//!
//! [`engine`]: super::engine

use super::cache::CacheScope;
use super::entity::EntityId;
use super::outcome::Detail;
use super::source::{SourceQuery, SourceRow};
use super::target::{NaturalKey, TargetRecord};
use crate::error::RecordError;
use std::collections::HashMap;
use std::time::Duration;

/// A foreign key held by a source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// Source column holding the legacy id.
    pub field: &'static str,
    /// Entity whose mappings resolve the id.
    pub entity: EntityId,
    /// Singular name used in failure messages ("forum not found").
    pub label: &'static str,
    pub required: bool,
}

impl Reference {
    pub const fn required(field: &'static str, entity: EntityId, label: &'static str) -> Self {
        Self {
            field,
            entity,
            label,
            required: true,
        }
    }

    pub const fn optional(field: &'static str, entity: EntityId, label: &'static str) -> Self {
        Self {
            field,
            entity,
            label,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedReference {
    reference: Reference,
    source_id: Option<i64>,
    target_id: Option<i64>,
}

/// Target ids resolved for a row's references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedRefs {
    resolved: Vec<ResolvedReference>,
    lookups: HashMap<(EntityId, i64), i64>,
}

impl ResolvedRefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, reference: Reference, source_id: Option<i64>, target_id: Option<i64>) {
        self.resolved.push(ResolvedReference {
            reference,
            source_id,
            target_id,
        });
    }

    pub(crate) fn push_lookup(&mut self, entity: EntityId, source_id: i64, target_id: i64) {
        self.lookups.insert((entity, source_id), target_id);
    }

    /// Target id of an extra lookup requested through
    /// [`EntityPolicy::lookups`].
    pub fn lookup(&self, entity: EntityId, source_id: i64) -> Option<i64> {
        self.lookups.get(&(entity, source_id)).copied()
    }

    /// Target id for the reference stored in `field`, if resolved.
    pub fn get(&self, field: &str) -> Option<i64> {
        self.resolved
            .iter()
            .find(|r| r.reference.field == field)
            .and_then(|r| r.target_id)
    }

    /// Target id for `field`, failing the record when it is unresolved.
    pub fn require(&self, field: &str) -> Result<i64, RecordError> {
        let entry = self
            .resolved
            .iter()
            .find(|r| r.reference.field == field)
            .ok_or_else(|| RecordError::Transform(format!("reference {} not declared", field)))?;

        entry.target_id.ok_or(RecordError::MissingMapping {
            label: entry.reference.label,
            field: entry.reference.field,
            source_id: entry.source_id.unwrap_or(0),
        })
    }

    /// First required reference without a mapping, as a record error.
    pub fn ensure_required(&self) -> Result<(), RecordError> {
        match self
            .resolved
            .iter()
            .find(|r| r.reference.required && r.target_id.is_none())
        {
            Some(missing) => Err(RecordError::MissingMapping {
                label: missing.reference.label,
                field: missing.reference.field,
                source_id: missing.source_id.unwrap_or(0),
            }),
            None => Ok(()),
        }
    }
}

/// What to import for one entity type.
pub trait EntityPolicy: Send + Sync {
    /// Result bucket and mapping namespace of the imported records.
    fn entity(&self) -> EntityId;

    fn source(&self) -> SourceQuery;

    fn cache_scope(&self) -> CacheScope {
        CacheScope::Tagged(self.entity().as_str())
    }

    fn mapping_ttl(&self) -> Option<Duration> {
        None
    }

    fn references(&self) -> Vec<Reference> {
        Vec::new()
    }

    /// Additional ids to resolve that do not live in a single column, such
    /// as product ids embedded in a JSON list. Unresolved lookups are simply
    /// absent from [`ResolvedRefs::lookup`].
    fn lookups(&self, _row: &SourceRow) -> Result<Vec<(EntityId, i64)>, RecordError> {
        Ok(Vec::new())
    }

    /// Whether [`natural_key`](Self::natural_key) reads resolved
    /// references. When it does not, the duplicate check runs before
    /// missing required mappings fail the record.
    fn key_uses_references(&self) -> bool {
        true
    }

    /// Key used to find a target record that already represents `row`.
    /// An empty key disables the duplicate check.
    fn natural_key(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<NaturalKey, RecordError>;

    fn transform(&self, row: &SourceRow, refs: &ResolvedRefs) -> Result<TargetRecord, RecordError>;

    /// Human-readable fields for the report.
    fn describe(&self, row: &SourceRow) -> Detail;
}
