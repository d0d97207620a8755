//! emuval-state: persisted records for validation runs.
//!
//! A [`RunRecord`] is created when a batch starts and sealed once every
//! candidate has produced its [`ValidationOutcome`]. Outcomes are written
//! exactly once per (candidate, run) pair and never mutated afterwards.
//!
//! ## Key Components
//!
//! - [`RunStore`]: backend-agnostic persistence trait
//! - [`FsRunStore`]: JSON-file backend with atomic writes
//! - [`fakes::MemoryRunStore`]: in-memory backend for tests

mod error;
pub mod fakes;
pub mod fs_store;
pub mod records;
pub mod storage_traits;

pub use error::{StoreError, StoreResult};
pub use fs_store::FsRunStore;
pub use records::{
    elapsed_ms, DeploymentResult, OutcomeState, RunId, RunRecord, RunSettings, RunSnapshot,
    RunStatus, RunSummary, TestCaseResult, TestCaseStatus, TestResult, ValidationOutcome,
};
pub use storage_traits::{load_snapshot, RunStore};
