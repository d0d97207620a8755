//! Test harness execution.
//!
//! A [`HarnessRunner`] runs a candidate's tests against a live endpoint and
//! returns per-test results. Individual test failures, including a test
//! hitting its own ceiling, are data in the returned [`TestResult`]; only a
//! harness that could not produce any verdict is a [`HarnessError`].

pub mod pytest;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use emuval_state::TestResult;

use crate::candidate::TestHarness;
use crate::process::ProcessError;

pub use pytest::{parse_pytest_output, PytestRunner};

/// The harness could not run to a verdict.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("harness entry point {entry_point} is missing")]
    MissingEntryPoint { entry_point: String },

    #[error("dependency installation failed: {detail}")]
    DependencyInstall { detail: String },

    #[error("harness could not be launched: {0}")]
    Launch(#[from] ProcessError),

    #[error("harness exited with code {exit_code} before reporting any test: {detail}")]
    NoResults { exit_code: i32, detail: String },
}

impl HarnessError {
    /// Whether the failure looks environmental rather than a broken harness.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HarnessError::DependencyInstall { .. } | HarnessError::Launch(_)
        )
    }
}

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// Runs a harness that has already been copied into `workdir`.
#[async_trait]
pub trait HarnessRunner: Send + Sync {
    async fn run(
        &self,
        endpoint: &str,
        workdir: &Path,
        harness: &TestHarness,
        per_test_timeout: Duration,
    ) -> HarnessResult<TestResult>;
}
