//! Storage trait for validation runs.
//!
//! The engine writes one [`RunRecord`] when a batch starts, one
//! [`ValidationOutcome`] per candidate as results arrive, and seals the
//! record once the batch completes or is aborted. Readers (comparison,
//! history, stability analysis) only ever see sealed runs.

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::records::{RunId, RunRecord, RunSnapshot, ValidationOutcome};

/// Run persistence.
///
/// Guarantees:
/// - `record_outcome` succeeds at most once per (run, candidate hash).
/// - A run transitions Running → Completed | Aborted (terminal) via `seal_run`.
/// - Sealed runs reject further writes.
/// - `list_outcomes` is sorted by candidate hash; `list_runs` by run id.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a freshly started run. Fails if the id already exists.
    async fn create_run(&self, record: &RunRecord) -> StoreResult<()>;

    /// Persist one candidate's outcome into its (running) run.
    async fn record_outcome(&self, outcome: &ValidationOutcome) -> StoreResult<()>;

    /// Replace the running record with its sealed form.
    async fn seal_run(&self, record: &RunRecord) -> StoreResult<()>;

    /// Retrieve a run record by id.
    async fn get_run(&self, run_id: &RunId) -> StoreResult<RunRecord>;

    /// All outcomes recorded for a run, sorted by candidate hash.
    async fn list_outcomes(&self, run_id: &RunId) -> StoreResult<Vec<ValidationOutcome>>;

    /// All runs, oldest first.
    async fn list_runs(&self) -> StoreResult<Vec<RunRecord>>;
}

/// Load a sealed run with its outcomes.
pub async fn load_snapshot(store: &dyn RunStore, run_id: &RunId) -> StoreResult<RunSnapshot> {
    let record = store.get_run(run_id).await?;
    if !record.status.is_sealed() {
        return Err(StoreError::InvalidRunState {
            run_id: run_id.to_string(),
            detail: "run is still in progress".to_string(),
        });
    }
    let outcomes = store.list_outcomes(run_id).await?;
    Ok(RunSnapshot { record, outcomes })
}

/// Shared precondition checks for `seal_run` implementations.
pub(crate) fn check_seal(existing: &RunRecord, incoming: &RunRecord) -> StoreResult<()> {
    if existing.status.is_sealed() {
        return Err(StoreError::RunSealed {
            run_id: existing.run_id.to_string(),
        });
    }
    if !incoming.status.is_sealed() {
        return Err(StoreError::InvalidRunState {
            run_id: incoming.run_id.to_string(),
            detail: "seal_run called with a running record".to_string(),
        });
    }
    Ok(())
}
