//! Progress reporting and run summaries.

use super::entity::EntityId;
use super::result::ImportResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Receives progress from the engine. Purely informational.
pub trait ProgressReporter: Send + Sync {
    fn start(&self, entity: EntityId, total: u64);

    fn advance(&self, entity: EntityId, processed: u64);

    fn record_error(&self, entity: EntityId, source_id: i64, message: &str);

    fn finish(&self, entity: EntityId, processed: u64);
}

/// Reports progress through the `log` facade, one line every `every`
/// records. Failures are already logged by the engine, so they are only
/// counted here and summarized when the entity finishes.
pub struct LogReporter {
    every: u64,
    errors: Mutex<HashMap<EntityId, u64>>,
}

impl LogReporter {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            errors: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LogReporter {
    fn default() -> Self {
        Self::new(250)
    }
}

impl ProgressReporter for LogReporter {
    fn start(&self, entity: EntityId, total: u64) {
        log::info!("{}: importing {} records", entity, total);
    }

    fn advance(&self, entity: EntityId, processed: u64) {
        if processed % self.every == 0 {
            log::info!("{}: {} records processed", entity, processed);
        }
    }

    fn record_error(&self, entity: EntityId, _source_id: i64, _message: &str) {
        *self.errors.lock().entry(entity).or_default() += 1;
    }

    fn finish(&self, entity: EntityId, processed: u64) {
        let errors = self.errors.lock().remove(&entity).unwrap_or(0);
        log::info!(
            "{}: done, {} records processed, {} errors",
            entity,
            processed,
            errors
        );
    }
}

/// Discards all progress.
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn start(&self, _: EntityId, _: u64) {}

    fn advance(&self, _: EntityId, _: u64) {}

    fn record_error(&self, _: EntityId, _: i64, _: &str) {}

    fn finish(&self, _: EntityId, _: u64) {}
}

/// Plain-text table of per-entity counts followed by every failure.
pub fn render_summary(result: &ImportResult) -> String {
    let mut out = String::new();
    let width = result
        .tallies()
        .map(|t| t.entity.as_str().len())
        .max()
        .unwrap_or(6)
        .max(6);

    let _ = writeln!(
        out,
        "{:<width$}  {:>8}  {:>8}  {:>8}",
        "entity", "migrated", "skipped", "failed"
    );
    for tally in result.tallies() {
        let _ = writeln!(
            out,
            "{:<width$}  {:>8}  {:>8}  {:>8}",
            tally.entity.as_str(),
            tally.migrated,
            tally.skipped,
            tally.failed
        );
    }

    for tally in result.tallies().filter(|t| t.failed > 0) {
        let _ = writeln!(out, "\n{} failures:", tally.entity);
        for detail in &tally.failed_details {
            let source_id = detail.get("source_id").cloned().unwrap_or_default();
            let error = detail
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown error");
            let _ = writeln!(out, "  #{}: {}", source_id, error);
        }
    }

    out
}
