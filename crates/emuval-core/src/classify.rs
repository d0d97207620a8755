//! Outcome classification.
//!
//! [`classify`] reduces a finished deployment and its tests to an
//! [`OutcomeState`]. [`classify_termination`] adds how the validation
//! ended: a deadline or an infrastructure fault overrides whatever partial
//! data was collected.

use emuval_state::{DeploymentResult, OutcomeState, TestResult};

/// How a candidate's validation stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Every stage ran to its natural end.
    Completed,
    /// The per-candidate deadline fired.
    TimedOut,
    /// Infrastructure prevented a verdict (environment, harness crash, panic).
    Fault { detail: String, retryable: bool },
    /// The batch was cancelled while this candidate was in flight.
    Aborted,
}

/// Classify a deployment and its test run.
///
/// Tests are never consulted when the deployment failed. A successful
/// deployment with no executed tests has no verifiable result and is
/// `Error`.
pub fn classify(deployment: &DeploymentResult, tests: Option<&TestResult>) -> OutcomeState {
    if !deployment.success {
        return OutcomeState::Failed;
    }
    let Some(tests) = tests else {
        return OutcomeState::Error;
    };
    if tests.executed() == 0 {
        return OutcomeState::Error;
    }
    match (tests.passed, tests.failed) {
        (_, 0) => OutcomeState::Passed,
        (0, _) => OutcomeState::Failed,
        _ => OutcomeState::Partial,
    }
}

/// Classify with termination precedence: `TimedOut` beats everything,
/// then faults and aborts, then the deployment/test data.
pub fn classify_termination(
    termination: &Termination,
    deployment: Option<&DeploymentResult>,
    tests: Option<&TestResult>,
) -> OutcomeState {
    match termination {
        Termination::TimedOut => OutcomeState::Timeout,
        Termination::Fault { .. } | Termination::Aborted => OutcomeState::Error,
        Termination::Completed => match deployment {
            Some(d) => classify(d, tests),
            None => OutcomeState::Error,
        },
    }
}
