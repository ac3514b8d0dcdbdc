//! Run planning and execution across importers.
//!
//! ## Design
//!
//! The orchestrator owns the registered importers. A run happens in two
//! steps so nothing is touched before the whole plan is known to be valid:
//!
//! 1. [`MigrationOrchestrator::plan`] selects importers, pulls in follow-ups
//!    and resolves the dependency order. Cycles and unknown entities fail
//!    here.
//! 2. [`MigrationOrchestrator::run`] validates source tables and external
//!    prerequisites, then runs importers one at a time.
//!
//! Importers run sequentially in plan order. A setup-level failure of one
//! importer aborts the rest of the run: its dependents would only fail
//! their foreign-key lookups.

use super::cache::MappingCache;
use super::dependency::{DependencyKind, ImporterDependency};
use super::entity::EntityId;
use super::importer::{EntityImporter, ImportContext};
use super::ordering::{DependencyGraph, resolve_order};
use super::result::ImportResult;
use crate::error::{ConfigError, MigrationError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// Lifecycle of one importer within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImporterState {
    NotStarted,
    Running,
    /// Finished with zero failed records.
    Completed,
    /// Finished, with failed records in the result.
    PartiallyFailed,
    /// Skipped because a completion marker exists.
    AlreadyCompleted,
    /// Stopped by a setup-level error.
    Aborted,
}

/// One importer selected for a run.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub entity: EntityId,
    pub dependencies: Vec<ImporterDependency>,
    /// Pulled in through another importer's post dependency.
    pub follow_up: bool,
}

/// Required prerequisite that is not part of the run and must already be
/// completed.
#[derive(Debug, Clone)]
pub struct ExternalRequirement {
    pub entity: EntityId,
    pub dependency: ImporterDependency,
}

/// Ordered importers of a run.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub steps: Vec<PlannedStep>,
    pub external: Vec<ExternalRequirement>,
}

impl RunPlan {
    pub fn entities(&self) -> Vec<EntityId> {
        self.steps.iter().map(|step| step.entity).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Per-importer record of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ImporterRun {
    pub entity: EntityId,
    pub state: ImporterState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl ImporterRun {
    fn new(entity: EntityId) -> Self {
        Self {
            entity,
            state: ImporterState::NotStarted,
            started_at: None,
            finished_at: None,
            migrated: 0,
            skipped: 0,
            failed: 0,
            error: None,
        }
    }
}

/// Everything a run produced, serializable as the JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub source: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub importers: Vec<ImporterRun>,
    pub result: ImportResult,
    /// Setup error that stopped the run early.
    pub aborted: Option<String>,
}

impl MigrationReport {
    pub fn has_failures(&self) -> bool {
        self.result.has_failures()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn state(&self, entity: EntityId) -> Option<ImporterState> {
        self.importers
            .iter()
            .find(|run| run.entity == entity)
            .map(|run| run.state)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Plans and runs registered importers in dependency order.
#[derive(Default)]
pub struct MigrationOrchestrator {
    importers: Vec<Box<dyn EntityImporter>>,
}

impl MigrationOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an importer. Registration order is the declaration order
    /// used to break ordering ties.
    pub fn register(&mut self, importer: Box<dyn EntityImporter>) -> Result<(), ConfigError> {
        let entity = importer.entity_name();
        if self.importer(entity).is_some() {
            return Err(ConfigError::DuplicateImporter(entity.to_string()));
        }
        self.importers.push(importer);
        Ok(())
    }

    pub fn with_importers(
        importers: impl IntoIterator<Item = Box<dyn EntityImporter>>,
    ) -> Result<Self, ConfigError> {
        let mut orchestrator = Self::new();
        for importer in importers {
            orchestrator.register(importer)?;
        }
        Ok(orchestrator)
    }

    pub fn importer(&self, entity: EntityId) -> Option<&dyn EntityImporter> {
        self.importers
            .iter()
            .find(|importer| importer.entity_name() == entity)
            .map(|importer| importer.as_ref())
    }

    pub fn entities(&self) -> Vec<EntityId> {
        self.importers.iter().map(|i| i.entity_name()).collect()
    }

    fn lookup(&self, name: &str) -> Result<EntityId, ConfigError> {
        self.importers
            .iter()
            .map(|importer| importer.entity_name())
            .find(|entity| entity.as_str() == name)
            .ok_or_else(|| ConfigError::UnknownEntity(name.to_string()))
    }

    /// Resolve which importers run, and in which order.
    ///
    /// # Arguments
    /// * `selection` - Entity names to run; empty selects every importer
    /// * `with_follow_ups` - Also pull in optional post dependencies
    ///
    /// Required post dependencies of selected importers are always pulled
    /// in. The full registered set is checked for required cycles even when
    /// only part of it is selected.
    pub fn plan(&self, selection: &[String], with_follow_ups: bool) -> Result<RunPlan, ConfigError> {
        let all: Vec<(EntityId, Vec<ImporterDependency>)> = self
            .importers
            .iter()
            .map(|importer| (importer.entity_name(), importer.dependencies()))
            .collect();
        resolve_order(&all)?;

        let mut selected: HashSet<EntityId> = HashSet::new();
        let mut follow_ups: HashSet<EntityId> = HashSet::new();
        let mut pending: Vec<EntityId> = if selection.is_empty() {
            self.entities()
        } else {
            selection
                .iter()
                .map(|name| self.lookup(name))
                .collect::<Result<_, _>>()?
        };
        for entity in &pending {
            selected.insert(*entity);
        }

        while let Some(entity) = pending.pop() {
            let Some(importer) = self.importer(entity) else {
                continue;
            };
            for dep in importer.dependencies() {
                let wanted = match dep.kind {
                    DependencyKind::RequiredPost => true,
                    DependencyKind::OptionalPost => with_follow_ups,
                    DependencyKind::RequiredPre | DependencyKind::OptionalPre => false,
                };
                if !wanted || selected.contains(&dep.entity) {
                    continue;
                }
                if self.importer(dep.entity).is_none() {
                    log::warn!(
                        "{}: follow-up {} has no registered importer",
                        entity,
                        dep.entity
                    );
                    continue;
                }
                log::debug!("{}: pulling in follow-up {} ({})", entity, dep.entity, dep.reason);
                selected.insert(dep.entity);
                follow_ups.insert(dep.entity);
                pending.push(dep.entity);
            }
        }

        let nodes: Vec<(EntityId, Vec<ImporterDependency>)> = all
            .into_iter()
            .filter(|(entity, _)| selected.contains(entity))
            .collect();
        let order = DependencyGraph::build(&nodes)?.order();

        let mut external = Vec::new();
        for (entity, deps) in &nodes {
            for dep in deps {
                if dep.kind == DependencyKind::RequiredPre && !selected.contains(&dep.entity) {
                    external.push(ExternalRequirement {
                        entity: *entity,
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let steps = order
            .into_iter()
            .map(|entity| PlannedStep {
                entity,
                dependencies: nodes
                    .iter()
                    .find(|(e, _)| *e == entity)
                    .map(|(_, deps)| deps.clone())
                    .unwrap_or_default(),
                follow_up: follow_ups.contains(&entity),
            })
            .collect();

        Ok(RunPlan { steps, external })
    }

    /// Execute a plan.
    ///
    /// Configuration problems (missing source tables, unsatisfied external
    /// prerequisites) fail before any importer runs. A setup error inside an
    /// importer stops the run; the report returned then has `aborted` set
    /// and the remaining importers left as `NotStarted`.
    pub async fn run(
        &self,
        plan: &RunPlan,
        ctx: &ImportContext<'_>,
        skip_completed: bool,
    ) -> Result<MigrationReport, MigrationError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        log::info!(
            "run {}: {} importers planned ({})",
            run_id,
            plan.steps.len(),
            plan.entities()
                .iter()
                .map(|e| e.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.preflight(plan, ctx).await?;

        let mut report = MigrationReport {
            run_id,
            source: ctx.cache.source().to_string(),
            dry_run: ctx.options.dry_run,
            started_at,
            finished_at: started_at,
            importers: plan.steps.iter().map(|s| ImporterRun::new(s.entity)).collect(),
            result: ImportResult::new(),
            aborted: None,
        };

        for (position, step) in plan.steps.iter().enumerate() {
            let importer = self
                .importer(step.entity)
                .ok_or_else(|| ConfigError::UnknownEntity(step.entity.to_string()))?;
            let run = &mut report.importers[position];

            if skip_completed && importer.is_completed(ctx.cache).await? {
                log::info!("{}: already completed, skipping", step.entity);
                run.state = ImporterState::AlreadyCompleted;
                continue;
            }

            log::info!("{}: starting import from {}", step.entity, importer.source_table());
            run.state = ImporterState::Running;
            run.started_at = Some(Utc::now());

            let mut local = ImportResult::new();
            let outcome = importer.import(ctx, &mut local).await;
            run.finished_at = Some(Utc::now());
            run.migrated = local.migrated(step.entity);
            run.skipped = local.skipped(step.entity);
            run.failed = local.failed(step.entity);
            let failed = local.total_failed();
            report.result.merge(local);

            if let Err(err) = outcome {
                log::error!("{}: import aborted: {}", step.entity, err);
                run.state = ImporterState::Aborted;
                run.error = Some(err.to_string());
                report.aborted = Some(format!("{}: {}", step.entity, err));
                break;
            }

            run.state = if failed == 0 {
                ImporterState::Completed
            } else {
                ImporterState::PartiallyFailed
            };

            if run.state == ImporterState::Completed
                && ctx.options.is_full_pass()
                && !ctx.options.dry_run
            {
                importer.mark_completed(ctx.cache).await?;
                ctx.cache.checkpoint().await?;
                log::debug!("{}: marked completed", step.entity);
            }
        }

        report.finished_at = Utc::now();
        log::info!(
            "run {}: finished in {}s, {} failed records{}",
            run_id,
            (report.finished_at - report.started_at).num_seconds(),
            report.result.total_failed(),
            if report.is_aborted() { ", aborted" } else { "" }
        );
        Ok(report)
    }

    /// Check source tables and external prerequisites before any writes.
    async fn preflight(&self, plan: &RunPlan, ctx: &ImportContext<'_>) -> Result<(), MigrationError> {
        for step in &plan.steps {
            let importer = self
                .importer(step.entity)
                .ok_or_else(|| ConfigError::UnknownEntity(step.entity.to_string()))?;
            for table in importer.source_tables() {
                let exists = ctx
                    .source
                    .table_exists(table)
                    .await
                    .map_err(MigrationError::Source)?;
                if !exists {
                    return Err(ConfigError::UnknownSourceTable {
                        entity: step.entity.to_string(),
                        table: table.to_string(),
                    }
                    .into());
                }
            }
        }

        for requirement in &plan.external {
            let dependency = requirement.dependency.entity;
            if !ctx.cache.is_completed(dependency).await? {
                return Err(MigrationError::DependencyNotSatisfied {
                    entity: requirement.entity.to_string(),
                    dependency: dependency.to_string(),
                    reason: requirement.dependency.reason.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Forget tagged mappings and completion markers of the selected
    /// importers (every importer when `selection` is empty).
    pub async fn cleanup(
        &self,
        selection: &[String],
        cache: &MappingCache,
    ) -> Result<Vec<(EntityId, usize)>, MigrationError> {
        let entities = if selection.is_empty() {
            self.entities()
        } else {
            selection
                .iter()
                .map(|name| self.lookup(name))
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut removed = Vec::with_capacity(entities.len());
        for entity in entities {
            if let Some(importer) = self.importer(entity) {
                let count = importer.cleanup(cache).await?;
                log::info!("{}: removed {} mappings", entity, count);
                removed.push((entity, count));
            }
        }
        cache.checkpoint().await?;
        Ok(removed)
    }
}
