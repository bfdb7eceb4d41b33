use std::io;

use feature_usage_limits::RepositoryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
    #[error("usage record {0} not found")]
    RecordNotFound(String),
    #[error("invalid timestamp {value}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("{units} units for limit {limit_id} exceed the storable range")]
    UnitsOutOfRange { limit_id: String, units: u64 },
    #[error("usage record {record_id} holds negative units {units}")]
    NegativeUnits { record_id: String, units: i64 },
    #[error("connection poisoned")]
    ConnectionPoisoned,
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<StorageError> for RepositoryError {
    fn from(err: StorageError) -> Self {
        RepositoryError::with_source("sqlite usage store", err)
    }
}
