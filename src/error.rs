//! Error types for entity resolution
//!
//! One `thiserror` enum per concern, folded into [`ResolutionError`] for the
//! engine and worker. The worker records `ResolutionError`'s display text as a
//! failed job's `exc_info`, so messages are written to be read by operators.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for a single resolution job
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Problems with a job's `config_json`
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config_json is not valid resolution config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("threshold must be a finite number in [0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("{field} contains a blank field name")]
    BlankFieldName { field: &'static str },

    #[error(
        "no matching strategy enabled: joinKeys and semanticFields are both empty and createIfNoMatch is false"
    )]
    NoMatchStrategy,

    #[error("record {index} has an unusable source_record_id: {reason}")]
    InvalidRecordId { index: usize, reason: String },
}

/// Failures of the embedding collaborator
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Embedding service returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    #[error("Embedding row {row} has dimension {got}, expected {expected}")]
    DimensionMismatch {
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("Embedding row {row} is a zero vector and cannot be normalized")]
    ZeroVector { row: usize },
}

/// Failures of the entity, mapping, provenance and job stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown job: {0}")]
    UnknownJob(Uuid),

    #[error("Job {job_id} is {actual}, expected {expected}")]
    UnexpectedJobStatus {
        job_id: Uuid,
        expected: &'static str,
        actual: String,
    },

    #[error("Invalid column value for {column}: {value}")]
    InvalidColumn { column: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text_is_operator_readable() {
        let err: ResolutionError = ConfigError::InvalidThreshold(1.5).into();
        assert_eq!(
            err.to_string(),
            "Configuration error: threshold must be a finite number in [0, 1], got 1.5"
        );
    }

    #[test]
    fn test_store_error_wraps_into_resolution_error() {
        let id = Uuid::nil();
        let err: ResolutionError = StoreError::UnknownJob(id).into();
        assert!(matches!(err, ResolutionError::Store(StoreError::UnknownJob(_))));
        assert!(err.to_string().contains("00000000-0000-0000-0000-000000000000"));
    }
}
