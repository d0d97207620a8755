//! One candidate's validation, from environment start to teardown.
//!
//! [`Validator::validate`] never fails: every exit path, including the
//! deadline firing, a batch abort and a panic inside a stage, ends with
//! teardown and exactly one [`ValidationOutcome`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use emuval_state::{elapsed_ms, DeploymentResult, OutcomeState, RunId, TestResult, ValidationOutcome};
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::candidate::{Candidate, TestHarness};
use crate::classify::{classify_termination, Termination};
use crate::config::EngineConfig;
use crate::deploy::{prepare_workspace, DeploymentTool};
use crate::environment::{EnvironmentHandle, EnvironmentManager};
use crate::harness::HarnessRunner;
use crate::metrics::METRICS;
use crate::obs;

/// Upper bound on fetching environment logs for a non-passing outcome.
const LOG_CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// A candidate paired with its harness, ready to validate.
#[derive(Debug, Clone)]
pub struct ValidationJob {
    pub candidate: Candidate,
    pub harness: Option<TestHarness>,
}

impl ValidationJob {
    pub fn new(candidate: Candidate, harness: Option<TestHarness>) -> Self {
        Self { candidate, harness }
    }

    pub fn hash(&self) -> &str {
        self.candidate.hash()
    }
}

/// Timing knobs for one validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub emulator_version: String,
    /// Hard deadline covering environment start through the last test.
    pub candidate_timeout: Duration,
    pub health_timeout: Duration,
    pub test_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            emulator_version: config.emulator_version.clone(),
            candidate_timeout: config.candidate_timeout(),
            health_timeout: config.health_timeout(),
            test_timeout: config.test_timeout(),
        }
    }
}

/// Data collected by the stages before they stopped.
#[derive(Debug, Default)]
struct Progress {
    deployment: Option<DeploymentResult>,
    tests: Option<TestResult>,
    fault: Option<(String, bool)>,
}

impl Progress {
    fn fault(&mut self, detail: impl Into<String>, retryable: bool) {
        self.fault = Some((detail.into(), retryable));
    }
}

pub struct Validator {
    manager: Arc<EnvironmentManager>,
    deployer: Arc<dyn DeploymentTool>,
    harness_runner: Arc<dyn HarnessRunner>,
    settings: PipelineSettings,
}

impl Validator {
    pub fn new(
        manager: Arc<EnvironmentManager>,
        deployer: Arc<dyn DeploymentTool>,
        harness_runner: Arc<dyn HarnessRunner>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            manager,
            deployer,
            harness_runner,
            settings,
        }
    }

    pub fn manager(&self) -> &EnvironmentManager {
        &self.manager
    }

    /// Validate one candidate. `cancel` flips to `true` on batch abort.
    pub async fn validate(
        &self,
        job: &ValidationJob,
        run_id: &RunId,
        mut cancel: watch::Receiver<bool>,
    ) -> ValidationOutcome {
        let started_at = Utc::now();
        let hash = job.hash();
        let capabilities = job.candidate.capabilities().to_vec();
        obs::emit_candidate_started(hash, &capabilities);

        let mut handle = match self.manager.provision(hash, run_id) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(candidate = %hash, error = %e, "could not provision environment");
                let mut outcome =
                    ValidationOutcome::error(hash, run_id.clone(), capabilities, started_at, e.to_string());
                outcome.retryable = e.is_retryable();
                return outcome;
            }
        };

        let mut progress = Progress::default();
        let termination = {
            let stages = AssertUnwindSafe(self.run_stages(job, &mut handle, &mut progress)).catch_unwind();
            tokio::select! {
                res = tokio::time::timeout(self.settings.candidate_timeout, stages) => match res {
                    Ok(Ok(())) => Termination::Completed,
                    Ok(Err(panic)) => Termination::Fault {
                        detail: format!("validation panicked: {}", panic_message(panic.as_ref())),
                        retryable: false,
                    },
                    Err(_) => Termination::TimedOut,
                },
                _ = cancelled(&mut cancel) => Termination::Aborted,
            }
        };
        let termination = match (termination, progress.fault.take()) {
            (Termination::Completed, Some((detail, retryable))) => Termination::Fault { detail, retryable },
            (termination, _) => termination,
        };

        let state = classify_termination(&termination, progress.deployment.as_ref(), progress.tests.as_ref());
        let mut logs = if state == OutcomeState::Passed {
            String::new()
        } else {
            tokio::time::timeout(LOG_CAPTURE_TIMEOUT, self.manager.capture_logs(&handle))
                .await
                .unwrap_or_default()
        };

        let report = self
            .manager
            .teardown(&mut handle, Some(self.deployer.as_ref()))
            .await;
        if !report.is_clean() {
            if !logs.is_empty() {
                logs.push('\n');
            }
            logs.push_str(&report.summary_lines());
        }

        let (error, retryable) = match &termination {
            Termination::Completed => (None, false),
            Termination::TimedOut => {
                METRICS.inc_timeouts();
                (
                    Some(format!(
                        "validation exceeded {}s deadline",
                        self.settings.candidate_timeout.as_secs()
                    )),
                    true,
                )
            }
            Termination::Fault { detail, retryable } => (Some(detail.clone()), *retryable),
            Termination::Aborted => (Some("validation aborted".to_string()), true),
        };

        let completed_at = Utc::now();
        ValidationOutcome {
            candidate_hash: hash.to_string(),
            run_id: run_id.clone(),
            state,
            capabilities,
            started_at,
            completed_at,
            duration_ms: elapsed_ms(started_at, completed_at),
            deployment: progress.deployment,
            tests: progress.tests,
            logs,
            error,
            retryable,
        }
    }

    async fn run_stages(
        &self,
        job: &ValidationJob,
        handle: &mut EnvironmentHandle,
        progress: &mut Progress,
    ) {
        let candidate = &job.candidate;
        if let Err(e) = self
            .manager
            .start(handle, &self.settings.emulator_version, candidate.capabilities())
            .await
        {
            progress.fault(e.to_string(), e.is_retryable());
            return;
        }
        if let Err(e) = self
            .manager
            .await_healthy(handle, self.settings.health_timeout)
            .await
        {
            progress.fault(e.to_string(), e.is_retryable());
            return;
        }
        if let Err(e) = self.manager.mark_in_use(handle) {
            progress.fault(e.to_string(), false);
            return;
        }
        let Some(endpoint) = handle.endpoint() else {
            progress.fault("environment has no endpoint", false);
            return;
        };

        if let Err(e) = prepare_workspace(handle.workdir(), candidate, job.harness.as_ref(), &endpoint) {
            progress.fault(format!("workspace preparation failed: {e}"), false);
            return;
        }

        handle.mark_deployed();
        let deployment = self.deployer.apply(&endpoint, handle.workdir()).await;
        let deployed = deployment.success;
        debug!(candidate = %candidate.hash(), success = deployed, "deployment finished");
        progress.deployment = Some(deployment);
        if !deployed {
            return;
        }

        let Some(harness) = job.harness.as_ref() else {
            progress.fault("candidate has no test harness", false);
            return;
        };
        match self
            .harness_runner
            .run(&endpoint, handle.workdir(), harness, self.settings.test_timeout)
            .await
        {
            Ok(tests) => progress.tests = Some(tests),
            Err(e) => progress.fault(format!("test execution fault: {e}"), e.is_retryable()),
        }
    }
}

/// Resolves once `cancel` reads `true`. Never resolves if the sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
