//! Dependency-ordered, resumable batch import engine.
//!
//! ## Architecture
//!
//! - [`entity`]: `EntityId`, the one name used for graph nodes, cache keys
//!   and result buckets
//! - [`dependency`] / [`ordering`]: importer dependencies and run order
//! - [`cache`]: durable source-to-target id mappings
//! - [`source`] / [`target`]: narrow interfaces to the legacy and destination
//!   stores
//! - [`policy`] / [`engine`]: per-entity policy and the shared import loop
//! - [`importer`]: the importer contract and policy-backed importers
//! - [`orchestrator`]: planning and sequential execution of a run
//!
//! Content-level problems never abort anything: each record ends up
//! migrated, skipped or failed in an [`ImportResult`].

pub mod cache;
pub mod dependency;
pub mod engine;
pub mod entity;
pub mod importer;
pub mod orchestrator;
pub mod ordering;
pub mod outcome;
pub mod policy;
pub mod report;
pub mod result;
pub mod source;
pub mod state;
pub mod target;

pub use cache::{CacheScope, MappingCache};
pub use dependency::{DependencyKind, ImporterDependency};
pub use entity::EntityId;
pub use importer::{EntityImporter, ImportContext, PolicyImporter, RunOptions};
pub use orchestrator::{ImporterState, MigrationOrchestrator, MigrationReport, RunPlan};
pub use outcome::{FailureKind, ImportOutcome};
pub use policy::{EntityPolicy, Reference, ResolvedRefs};
pub use result::ImportResult;
pub use source::{Filter, SourceQuery, SourceRow, SourceStore};
pub use target::{NaturalKey, TargetRecord, TargetStore};
