//! In-memory fake for the storage trait (testing only)
//!
//! `MemoryRunStore` satisfies the `RunStore` contract without touching the
//! filesystem.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{validate_key, StoreError, StoreResult};
use crate::records::{RunId, RunRecord, ValidationOutcome};
use crate::storage_traits::{check_seal, RunStore};

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    outcomes: BTreeMap<String, ValidationOutcome>,
}

/// In-memory run store backed by a `BTreeMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<BTreeMap<RunId, RunState>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RunId, RunState>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, record: &RunRecord) -> StoreResult<()> {
        let mut runs = self.lock();
        if runs.contains_key(&record.run_id) {
            return Err(StoreError::RunExists {
                run_id: record.run_id.to_string(),
            });
        }
        runs.insert(
            record.run_id.clone(),
            RunState {
                record: record.clone(),
                outcomes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn record_outcome(&self, outcome: &ValidationOutcome) -> StoreResult<()> {
        validate_key(&outcome.candidate_hash)?;
        let mut runs = self.lock();
        let state = runs
            .get_mut(&outcome.run_id)
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: outcome.run_id.to_string(),
            })?;
        if state.record.status.is_sealed() {
            return Err(StoreError::RunSealed {
                run_id: outcome.run_id.to_string(),
            });
        }
        if state.outcomes.contains_key(&outcome.candidate_hash) {
            return Err(StoreError::OutcomeExists {
                run_id: outcome.run_id.to_string(),
                candidate_hash: outcome.candidate_hash.clone(),
            });
        }
        state
            .outcomes
            .insert(outcome.candidate_hash.clone(), outcome.clone());
        Ok(())
    }

    async fn seal_run(&self, record: &RunRecord) -> StoreResult<()> {
        let mut runs = self.lock();
        let state = runs
            .get_mut(&record.run_id)
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: record.run_id.to_string(),
            })?;
        check_seal(&state.record, record)?;
        state.record = record.clone();
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StoreResult<RunRecord> {
        self.lock()
            .get(run_id)
            .map(|s| s.record.clone())
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn list_outcomes(&self, run_id: &RunId) -> StoreResult<Vec<ValidationOutcome>> {
        self.lock()
            .get(run_id)
            .map(|s| s.outcomes.values().cloned().collect())
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn list_runs(&self) -> StoreResult<Vec<RunRecord>> {
        Ok(self.lock().values().map(|s| s.record.clone()).collect())
    }
}
