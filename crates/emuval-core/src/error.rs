//! Batch-fatal errors.
//!
//! Anything that goes wrong for a single candidate becomes an outcome
//! state, not an [`EngineError`]. Only conditions that make the whole
//! batch meaningless surface here.

use emuval_state::StoreError;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),

    #[error("cannot allocate any environment: {required} slot(s) required, {available} available")]
    ResourcesExhausted { required: usize, available: usize },

    #[error("need {needed} sealed run(s), found {found}")]
    NotEnoughRuns { needed: usize, found: usize },

    #[error("catalog error at {path}: {detail}")]
    Catalog { path: String, detail: String },
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
