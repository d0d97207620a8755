//! Error types for emuval-state

use thiserror::Error;

/// Errors produced by the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("run already exists: {run_id}")]
    RunExists { run_id: String },

    #[error("run {run_id} is sealed and can no longer be modified")]
    RunSealed { run_id: String },

    #[error("outcome for candidate {candidate_hash} already recorded in run {run_id}")]
    OutcomeExists {
        run_id: String,
        candidate_hash: String,
    },

    #[error("invalid run state for {run_id}: {detail}")]
    InvalidRunState { run_id: String, detail: String },

    /// Keys become file names, so path separators and dot segments are refused.
    #[error("invalid storage key: {key:?}")]
    InvalidKey { key: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Reject keys that cannot safely be used as a single path component.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    let bad = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0');
    if bad {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}
