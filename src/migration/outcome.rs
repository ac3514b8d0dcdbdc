//! Per-record outcomes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form, human-readable detail attached to an outcome.
///
/// Diagnostic only; the engine never branches on it.
pub type Detail = Map<String, Value>;

/// Why a record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A referenced record has no mapping yet.
    MissingMapping,
    /// The source row could not be turned into target fields.
    Transform,
    /// The target store rejected a query or write.
    Store,
}

/// Result of processing exactly one source record.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    Migrated {
        source_id: i64,
        target_id: i64,
        detail: Detail,
    },
    Skipped {
        source_id: i64,
        reason: String,
        detail: Detail,
    },
    Failed {
        source_id: i64,
        kind: FailureKind,
        error: String,
        detail: Detail,
    },
}

impl ImportOutcome {
    pub fn source_id(&self) -> i64 {
        match self {
            ImportOutcome::Migrated { source_id, .. }
            | ImportOutcome::Skipped { source_id, .. }
            | ImportOutcome::Failed { source_id, .. } => *source_id,
        }
    }

    /// Flatten the outcome into the detail row stored in the result.
    pub fn into_detail(self) -> Detail {
        match self {
            ImportOutcome::Migrated {
                source_id,
                target_id,
                mut detail,
            } => {
                detail.insert("source_id".into(), source_id.into());
                detail.insert("target_id".into(), target_id.into());
                detail
            }
            ImportOutcome::Skipped {
                source_id,
                reason,
                mut detail,
            } => {
                detail.insert("source_id".into(), source_id.into());
                detail.insert("reason".into(), reason.into());
                detail
            }
            ImportOutcome::Failed {
                source_id,
                kind,
                error,
                mut detail,
            } => {
                detail.insert("source_id".into(), source_id.into());
                detail.insert(
                    "kind".into(),
                    serde_json::to_value(kind).unwrap_or(Value::Null),
                );
                detail.insert("error".into(), error.into());
                detail
            }
        }
    }
}

/// Build a [`Detail`] from key/value pairs.
pub fn detail<I, K, V>(pairs: I) -> Detail
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
