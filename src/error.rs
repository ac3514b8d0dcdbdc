use crate::migration::cache::CacheError;
use crate::migration::outcome::FailureKind;
use thiserror::Error;

/// Errors that abort a whole run or a whole importer.
///
/// Content-level problems never show up here; they are absorbed into
/// [`ImportResult`](crate::migration::ImportResult) as failed outcomes.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("source store error: {0}")]
    Source(StoreError),
    #[error("mapping cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("{entity} requires {dependency} to be imported first ({reason})")]
    DependencyNotSatisfied {
        entity: String,
        dependency: String,
        reason: String,
    },
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Problems with the importer set or run parameters, detected before any
/// importer executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required dependency cycle: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("source table '{table}' used by {entity} does not exist")]
    UnknownSourceTable { entity: String, table: String },
    #[error("importer for '{0}' registered twice")]
    DuplicateImporter(String),
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by source and target store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("{0}")]
    Other(String),
}

/// Failure of a single source record.
///
/// Always converted into a `Failed` outcome by the engine; processing then
/// continues with the next record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{label} not found ({field}={source_id})")]
    MissingMapping {
        label: &'static str,
        field: &'static str,
        source_id: i64,
    },
    #[error("invalid field {field}: {message}")]
    InvalidField { field: String, message: String },
    #[error("transform failed: {0}")]
    Transform(String),
    #[error("target store error: {0}")]
    Store(#[from] StoreError),
}

impl RecordError {
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        RecordError::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            RecordError::MissingMapping { .. } => FailureKind::MissingMapping,
            RecordError::InvalidField { .. } | RecordError::Transform(_) => FailureKind::Transform,
            RecordError::Store(_) => FailureKind::Store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_mapping_message_names_the_entity() {
        let err = RecordError::MissingMapping {
            label: "forum",
            field: "forum_id",
            source_id: 42,
        };

        assert_eq!(err.to_string(), "forum not found (forum_id=42)");
        assert_eq!(err.kind(), FailureKind::MissingMapping);
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = ConfigError::DependencyCycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };

        assert_eq!(err.to_string(), "required dependency cycle: a -> b -> a");
    }
}
