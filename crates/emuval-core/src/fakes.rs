//! Scriptable fakes for the engine seams (testing only)
//!
//! `FakeProvider`, `FakeDeployer` and `FakeHarnessRunner` satisfy the
//! provider, deployment and harness traits without containers, tools or
//! interpreters. Behaviour is configured with builder methods and every
//! call is counted so tests can assert on cleanup.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use emuval_state::{DeploymentResult, TestCaseResult, TestCaseStatus, TestResult};

use crate::candidate::TestHarness;
use crate::deploy::{DeployError, DeployResult, DeploymentTool};
use crate::environment::{EnvResult, EnvironmentError, EnvironmentProvider, LaunchSpec};
use crate::harness::{HarnessError, HarnessResult, HarnessRunner};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// FakeProvider
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ProviderState {
    live: BTreeSet<String>,
    peak_live: usize,
    stops: BTreeMap<String, usize>,
    stale: Vec<String>,
}

/// In-process emulator provider.
#[derive(Debug, Default)]
pub struct FakeProvider {
    failing_launches: AtomicUsize,
    launch_attempts: AtomicUsize,
    never_ready: bool,
    failing_stop: bool,
    launch_delay: Duration,
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` launches fail.
    pub fn failing_launches(self, n: usize) -> Self {
        self.failing_launches.store(n, Ordering::SeqCst);
        self
    }

    /// Readiness probes always report not ready.
    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    /// Every stop fails.
    pub fn failing_stop(mut self) -> Self {
        self.failing_stop = true;
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// Instances reported by `list_stale`.
    pub fn with_stale<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.state).stale = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn launch_attempts(&self) -> usize {
        self.launch_attempts.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self, instance_name: &str) -> usize {
        lock(&self.state).stops.get(instance_name).copied().unwrap_or(0)
    }

    pub fn total_stop_calls(&self) -> usize {
        lock(&self.state).stops.values().sum()
    }

    /// Instances launched and not yet stopped.
    pub fn live_instances(&self) -> usize {
        lock(&self.state).live.len()
    }

    /// Most instances alive at the same time.
    pub fn peak_live(&self) -> usize {
        lock(&self.state).peak_live
    }
}

#[async_trait]
impl EnvironmentProvider for FakeProvider {
    async fn launch(&self, spec: &LaunchSpec) -> EnvResult<()> {
        self.launch_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        let failed = self
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EnvironmentError::Provider(format!(
                "fake launch failure for {}",
                spec.instance_name
            )));
        }
        let mut state = lock(&self.state);
        state.live.insert(spec.instance_name.clone());
        state.peak_live = state.peak_live.max(state.live.len());
        Ok(())
    }

    async fn is_ready(&self, spec: &LaunchSpec) -> bool {
        !self.never_ready && lock(&self.state).live.contains(&spec.instance_name)
    }

    async fn stop(&self, instance_name: &str) -> EnvResult<()> {
        let mut state = lock(&self.state);
        *state.stops.entry(instance_name.to_string()).or_insert(0) += 1;
        if self.failing_stop {
            return Err(EnvironmentError::Provider(format!(
                "fake stop failure for {instance_name}"
            )));
        }
        state.live.remove(instance_name);
        Ok(())
    }

    async fn logs(&self, instance_name: &str) -> Option<String> {
        Some(format!("fake emulator log for {instance_name}"))
    }

    async fn list_stale(&self) -> EnvResult<Vec<String>> {
        Ok(lock(&self.state).stale.clone())
    }
}

// ---------------------------------------------------------------------------
// FakeDeployer
// ---------------------------------------------------------------------------

/// Deployment tool returning a fixed result.
#[derive(Debug)]
pub struct FakeDeployer {
    apply_result: DeploymentResult,
    failing_for: BTreeSet<String>,
    failing_destroy: bool,
    apply_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl FakeDeployer {
    /// Every apply succeeds with `resources` created.
    pub fn succeeding(resources: u32) -> Self {
        Self {
            apply_result: DeploymentResult {
                success: true,
                resources_created: resources,
                log: format!("Apply complete! Resources: {resources} added, 0 changed, 0 destroyed."),
                ..Default::default()
            },
            failing_for: BTreeSet::new(),
            failing_destroy: false,
            apply_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        }
    }

    /// Every apply fails with `error`.
    pub fn failing(error: impl Into<String>) -> Self {
        let error = error.into();
        let mut deployer = Self::succeeding(0);
        deployer.apply_result = DeploymentResult {
            errors: vec![error.clone()],
            ..DeploymentResult::failed(error)
        };
        deployer
    }

    /// Applies in a working directory whose path contains `marker` fail.
    ///
    /// Working directories are named after the candidate's short hash.
    pub fn failing_for(mut self, marker: impl Into<String>) -> Self {
        self.failing_for.insert(marker.into());
        self
    }

    pub fn failing_destroy(mut self) -> Self {
        self.failing_destroy = true;
        self
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeploymentTool for FakeDeployer {
    async fn apply(&self, _endpoint: &str, workdir: &Path) -> DeploymentResult {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let path = workdir.to_string_lossy();
        if self.failing_for.iter().any(|m| path.contains(m.as_str())) {
            let detail = "Error: creating resource: fake deployment failure";
            return DeploymentResult {
                errors: vec![detail.to_string()],
                ..DeploymentResult::failed(detail)
            };
        }
        self.apply_result.clone()
    }

    async fn destroy(&self, _endpoint: &str, _workdir: &Path) -> DeployResult<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_destroy {
            return Err(DeployError::StepFailed {
                step: "destroy".to_string(),
                exit_code: 1,
                detail: "fake destroy failure".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeHarnessRunner
// ---------------------------------------------------------------------------

/// Scripted behaviour for one candidate's harness.
#[derive(Debug, Clone)]
pub enum HarnessScript {
    /// Return `result` after `delay`.
    Report { result: TestResult, delay: Duration },
    /// Fail without any verdict.
    Fault { detail: String },
    Panic,
}

impl HarnessScript {
    pub fn report(result: TestResult) -> Self {
        Self::Report {
            result,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(result: TestResult, delay: Duration) -> Self {
        Self::Report { result, delay }
    }
}

/// Build a result with `passed` passing and `failed` failing tests.
pub fn test_result(passed: usize, failed: usize) -> TestResult {
    let passing = (0..passed).map(|i| TestCaseResult {
        name: format!("test_app.py::test_ok_{i}"),
        status: TestCaseStatus::Passed,
        duration_secs: Some(0.1),
        timed_out: false,
        error_message: None,
    });
    let failing = (0..failed).map(|i| TestCaseResult {
        name: format!("test_app.py::test_broken_{i}"),
        status: TestCaseStatus::Failed,
        duration_secs: Some(0.1),
        timed_out: false,
        error_message: Some("AssertionError".to_string()),
    });
    TestResult::from_cases(passing.chain(failing).collect(), "")
}

/// Harness runner keyed by candidate hash.
#[derive(Debug)]
pub struct FakeHarnessRunner {
    default: HarnessScript,
    scripts: Mutex<BTreeMap<String, HarnessScript>>,
    runs: AtomicUsize,
}

impl Default for FakeHarnessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHarnessRunner {
    /// Candidates without a script report three passing tests.
    pub fn new() -> Self {
        Self {
            default: HarnessScript::report(test_result(3, 0)),
            scripts: Mutex::new(BTreeMap::new()),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn with_default(mut self, script: HarnessScript) -> Self {
        self.default = script;
        self
    }

    pub fn script(self, candidate_hash: impl Into<String>, script: HarnessScript) -> Self {
        lock(&self.scripts).insert(candidate_hash.into(), script);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HarnessRunner for FakeHarnessRunner {
    async fn run(
        &self,
        _endpoint: &str,
        _workdir: &Path,
        harness: &TestHarness,
        _per_test_timeout: Duration,
    ) -> HarnessResult<TestResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let script = lock(&self.scripts)
            .get(&harness.candidate_hash)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        match script {
            HarnessScript::Report { result, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(result)
            }
            HarnessScript::Fault { detail } => Err(HarnessError::NoResults {
                exit_code: 2,
                detail,
            }),
            HarnessScript::Panic => panic!("fake harness panic for {}", harness.candidate_hash),
        }
    }
}
