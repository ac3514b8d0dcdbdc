//! Import result accounting.
//!
//! Tracks migrated/skipped/failed counts and detail rows per entity name
//! across every importer of a run.

use super::entity::EntityId;
use super::outcome::{Detail, ImportOutcome};
use serde::Serialize;

/// Counts and detail rows for a single entity name.
#[derive(Debug, Clone, Serialize)]
pub struct EntityTally {
    pub entity: EntityId,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub migrated_details: Vec<Detail>,
    pub skipped_details: Vec<Detail>,
    pub failed_details: Vec<Detail>,
}

impl EntityTally {
    fn new(entity: EntityId) -> Self {
        Self {
            entity,
            migrated: 0,
            skipped: 0,
            failed: 0,
            migrated_details: Vec::new(),
            skipped_details: Vec::new(),
            failed_details: Vec::new(),
        }
    }

    pub fn processed(&self) -> usize {
        self.migrated + self.skipped + self.failed
    }
}

/// Accumulated outcome of a migration run.
///
/// Counters only ever grow. Buckets keep the order in which entities were
/// first touched so reports read in import order.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ImportResult {
    buckets: Vec<EntityTally>,
}

impl ImportResult {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&mut self, entity: EntityId) -> &mut EntityTally {
        let index = match self.buckets.iter().position(|t| t.entity == entity) {
            Some(index) => index,
            None => {
                self.buckets.push(EntityTally::new(entity));
                self.buckets.len() - 1
            }
        };
        &mut self.buckets[index]
    }

    pub fn increment_migrated(&mut self, entity: EntityId) {
        self.bucket(entity).migrated += 1;
    }

    pub fn increment_skipped(&mut self, entity: EntityId) {
        self.bucket(entity).skipped += 1;
    }

    pub fn increment_failed(&mut self, entity: EntityId) {
        self.bucket(entity).failed += 1;
    }

    pub fn record_migrated(&mut self, entity: EntityId, detail: Detail) {
        self.bucket(entity).migrated_details.push(detail);
    }

    pub fn record_skipped(&mut self, entity: EntityId, detail: Detail) {
        self.bucket(entity).skipped_details.push(detail);
    }

    pub fn record_failed(&mut self, entity: EntityId, detail: Detail) {
        self.bucket(entity).failed_details.push(detail);
    }

    /// Count and record one outcome.
    pub fn record(&mut self, entity: EntityId, outcome: ImportOutcome) {
        match outcome {
            ImportOutcome::Migrated { .. } => {
                self.increment_migrated(entity);
                self.record_migrated(entity, outcome.into_detail());
            }
            ImportOutcome::Skipped { .. } => {
                self.increment_skipped(entity);
                self.record_skipped(entity, outcome.into_detail());
            }
            ImportOutcome::Failed { .. } => {
                self.increment_failed(entity);
                self.record_failed(entity, outcome.into_detail());
            }
        }
    }

    pub fn get(&self, entity: EntityId) -> Option<&EntityTally> {
        self.buckets.iter().find(|t| t.entity == entity)
    }

    pub fn migrated(&self, entity: EntityId) -> usize {
        self.get(entity).map_or(0, |t| t.migrated)
    }

    pub fn skipped(&self, entity: EntityId) -> usize {
        self.get(entity).map_or(0, |t| t.skipped)
    }

    pub fn failed(&self, entity: EntityId) -> usize {
        self.get(entity).map_or(0, |t| t.failed)
    }

    pub fn tallies(&self) -> impl Iterator<Item = &EntityTally> {
        self.buckets.iter()
    }

    pub fn total_failed(&self) -> usize {
        self.buckets.iter().map(|t| t.failed).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.total_failed() > 0
    }

    /// Merge another result into this one by summing counts and appending
    /// detail rows.
    pub fn merge(&mut self, other: ImportResult) {
        for tally in other.buckets {
            let bucket = self.bucket(tally.entity);
            bucket.migrated += tally.migrated;
            bucket.skipped += tally.skipped;
            bucket.failed += tally.failed;
            bucket.migrated_details.extend(tally.migrated_details);
            bucket.skipped_details.extend(tally.skipped_details);
            bucket.failed_details.extend(tally.failed_details);
        }
    }
}
