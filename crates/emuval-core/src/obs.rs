//! Structured lifecycle events.
//!
//! Every event carries an `event = "<name>"` field so log pipelines can
//! filter on it. Spans scope a batch (`emuval.run`) and a single candidate
//! (`emuval.candidate`).

use emuval_state::{OutcomeState, RunSummary};
use tracing::{info, warn};

use crate::environment::EnvironmentState;

/// RAII guard that enters a run-scoped span on the current thread.
///
/// For async work use [`run_span`] with `Instrument` instead; an entered
/// guard must not be held across an `.await` in a spawned task.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("emuval.run", run_id = %run_id)
}

pub fn candidate_span(candidate_hash: &str) -> tracing::Span {
    tracing::info_span!("emuval.candidate", candidate = %candidate_hash)
}

pub fn emit_batch_started(run_id: &str, candidates: usize, concurrency: usize, emulator_version: &str) {
    info!(
        event = "batch.started",
        run_id = %run_id,
        candidates,
        concurrency,
        emulator_version = %emulator_version,
    );
}

pub fn emit_candidate_started(candidate_hash: &str, capabilities: &[String]) {
    info!(
        event = "candidate.started",
        candidate = %candidate_hash,
        capabilities = %capabilities.join(","),
    );
}

pub fn emit_environment_started(instance: &str, endpoint: &str, attempts: u32) {
    info!(event = "environment.started", instance = %instance, endpoint = %endpoint, attempts);
}

pub fn emit_teardown_finished(instance: &str, from_state: EnvironmentState, failures: usize) {
    if failures == 0 {
        info!(event = "environment.torn_down", instance = %instance, from_state = %from_state);
    } else {
        warn!(
            event = "environment.teardown_failed",
            instance = %instance,
            from_state = %from_state,
            failures,
        );
    }
}

pub fn emit_outcome_recorded(candidate_hash: &str, state: OutcomeState, duration_ms: u64) {
    info!(
        event = "outcome.recorded",
        candidate = %candidate_hash,
        state = %state,
        duration_ms,
    );
}

pub fn emit_outcome_persist_error(run_id: &str, candidate_hash: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "outcome.persist_error",
        run_id = %run_id,
        candidate = %candidate_hash,
        error = %error,
    );
}

pub fn emit_batch_aborted(run_id: &str, unfinished: usize) {
    warn!(event = "batch.aborted", run_id = %run_id, unfinished);
}

pub fn emit_batch_sealed(run_id: &str, summary: &RunSummary, aborted: bool) {
    info!(
        event = "batch.sealed",
        run_id = %run_id,
        total = summary.total,
        passed = summary.passed,
        partial = summary.partial,
        failed = summary.failed,
        timeout = summary.timeout,
        error = summary.error,
        duration_ms = summary.duration_ms,
        aborted,
    );
}

pub fn emit_regression_detected(candidate_hash: &str, previous: OutcomeState, current: OutcomeState) {
    warn!(
        event = "regression.detected",
        candidate = %candidate_hash,
        previous = %previous,
        current = %current,
    );
}

pub fn emit_fix_detected(candidate_hash: &str, previous: OutcomeState, current: OutcomeState) {
    info!(
        event = "fix.detected",
        candidate = %candidate_hash,
        previous = %previous,
        current = %current,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_enter() {
        let _span = RunSpan::enter("0191e5a0-run");
        emit_candidate_started("abcd", &["s3".to_string()]);
    }

    #[test]
    fn test_emitters_do_not_panic_without_subscriber() {
        emit_batch_started("r", 3, 2, "3.8");
        emit_outcome_recorded("abcd", OutcomeState::Passed, 10);
        emit_teardown_finished("i", EnvironmentState::InUse, 1);
        emit_batch_sealed("r", &RunSummary::default(), false);
        emit_regression_detected("abcd", OutcomeState::Passed, OutcomeState::Failed);
    }
}
