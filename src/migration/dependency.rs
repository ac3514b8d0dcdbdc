//! Ordering constraints between importers.

use super::entity::EntityId;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// The named entity must be imported before this one.
    RequiredPre,
    /// Import the named entity first when both are part of the run.
    OptionalPre,
    /// The named entity must run after this one whenever this one runs.
    RequiredPost,
    /// The named entity is a suggested follow-up import.
    OptionalPost,
}

impl DependencyKind {
    pub fn is_required(self) -> bool {
        matches!(self, DependencyKind::RequiredPre | DependencyKind::RequiredPost)
    }
}

/// A single dependency declared by an importer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImporterDependency {
    pub entity: EntityId,
    pub kind: DependencyKind,
    pub reason: &'static str,
}

impl ImporterDependency {
    pub fn required_pre(entity: EntityId, reason: &'static str) -> Self {
        Self {
            entity,
            kind: DependencyKind::RequiredPre,
            reason,
        }
    }

    pub fn optional_pre(entity: EntityId, reason: &'static str) -> Self {
        Self {
            entity,
            kind: DependencyKind::OptionalPre,
            reason,
        }
    }

    pub fn required_post(entity: EntityId, reason: &'static str) -> Self {
        Self {
            entity,
            kind: DependencyKind::RequiredPost,
            reason,
        }
    }

    pub fn optional_post(entity: EntityId, reason: &'static str) -> Self {
        Self {
            entity,
            kind: DependencyKind::OptionalPost,
            reason,
        }
    }
}
