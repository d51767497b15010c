//! Error types for the resolution engine.
//!
//! `EngineError` is what library calls return. Failures from the external
//! collaborators (identity registry, media library) are reported separately
//! as `ExternalError` so callers can retry them or degrade to PENDING /
//! NotFound instead of failing the whole operation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A uniqueness invariant would be broken (duplicate song, bucket key collision).
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// Input that cannot be processed at all, e.g. an artist name that normalizes to nothing.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Map SQLite constraint failures to `DataIntegrity`, everything else to `Storage`.
    pub fn from_write(err: rusqlite::Error, what: &str) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, ref msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::DataIntegrity(format!(
                    "{}: {}",
                    what,
                    msg.clone().unwrap_or_else(|| "constraint violation".to_string())
                ))
            }
            other => Self::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure reported by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    /// Network failure, timeout, throttling or a 5xx response. Worth retrying.
    #[error("transient external failure: {0}")]
    Transient(String),

    /// The collaborator answered but the request cannot succeed as sent.
    #[error("external request rejected: {0}")]
    Permanent(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExternalError::Transient(_))
    }
}
