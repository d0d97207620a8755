//! Environment lifecycle manager.
//!
//! The manager owns the provider and the shared [`PortAllocator`]. A
//! candidate's environment is represented by an [`EnvironmentHandle`] that
//! exists before anything is launched, so [`EnvironmentManager::teardown`]
//! can always run, whatever stage the validation reached.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use emuval_state::RunId;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::allocator::{PortAllocator, ResourceSet};
use crate::config::EngineConfig;
use crate::deploy::DeploymentTool;
use crate::environment::error::{EnvResult, EnvironmentError};
use crate::environment::provider::{EnvironmentProvider, LaunchSpec};
use crate::environment::state::EnvironmentState;
use crate::metrics::METRICS;
use crate::obs;
use crate::process::tail_chars;

/// Label marking instances owned by this engine.
pub const MANAGED_LABEL: &str = "emuval.managed";
/// Label carrying the run id that launched an instance.
pub const RUN_LABEL: &str = "emuval.run";
/// Upper bound on captured instance logs.
pub const LOG_TAIL_CHARS: usize = 5_000;

/// Lifecycle tuning taken from [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub image: String,
    pub health_poll_interval: Duration,
    /// Retries after the first failed launch.
    pub start_retries: u32,
    pub start_backoff: Duration,
    /// Budget for each asynchronous teardown step.
    pub teardown_timeout: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            image: config.emulator_image.clone(),
            health_poll_interval: config.health_poll_interval(),
            start_retries: config.start_retries,
            start_backoff: Duration::from_millis(config.start_backoff_ms),
            teardown_timeout: config.teardown_timeout(),
        }
    }
}

/// One candidate's environment.
///
/// Dropping a handle that was never torn down releases its port slot and
/// logs a warning; the emulator instance itself can only be stopped by
/// [`EnvironmentManager::teardown`].
#[derive(Debug)]
pub struct EnvironmentHandle {
    instance_name: String,
    candidate_hash: String,
    run_id: RunId,
    state: EnvironmentState,
    resources: Option<ResourceSet>,
    workdir: Option<TempDir>,
    workdir_path: PathBuf,
    launch: Option<LaunchSpec>,
    deployed: bool,
    counted_in_use: bool,
    torn_down: bool,
    allocator: Arc<PortAllocator>,
}

impl EnvironmentHandle {
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn candidate_hash(&self) -> &str {
        &self.candidate_hash
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    pub fn resources(&self) -> Option<&ResourceSet> {
        self.resources.as_ref()
    }

    /// Emulator endpoint, while resources are held.
    pub fn endpoint(&self) -> Option<String> {
        self.resources.as_ref().map(ResourceSet::endpoint)
    }

    /// Per-candidate working directory.
    pub fn workdir(&self) -> &Path {
        &self.workdir_path
    }

    /// Record that infrastructure may exist and needs destroying.
    pub fn mark_deployed(&mut self) {
        self.deployed = true;
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    fn transition(&mut self, next: EnvironmentState) -> EnvResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(EnvironmentError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(event = "environment.transition", instance = %self.instance_name, from = %self.state, to = %next, "environment transition");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self) {
        if let Err(e) = self.transition(EnvironmentState::Failed) {
            warn!(instance = %self.instance_name, error = %e, "could not mark environment failed");
        }
    }
}

impl Drop for EnvironmentHandle {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        warn!(
            instance = %self.instance_name,
            state = %self.state,
            "environment handle dropped without teardown"
        );
        if let Some(resources) = self.resources.take() {
            self.allocator.release(&resources);
        }
    }
}

/// A teardown step that can fail without affecting the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    DestroyInfrastructure,
    StopInstance,
    RemoveWorkdir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownFailure {
    pub step: TeardownStep,
    pub detail: String,
}

/// What happened during teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub instance_name: String,
    /// State the environment was in when teardown began.
    pub from_state: EnvironmentState,
    pub failures: Vec<TeardownFailure>,
    /// Teardown had already run for this handle; nothing was done.
    pub already_torn_down: bool,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: TeardownStep, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(instance = %self.instance_name, ?step, %detail, "teardown step failed");
        self.failures.push(TeardownFailure { step, detail });
    }

    /// One line per failure, for outcome logs.
    pub fn summary_lines(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("teardown {:?}: {}", f.step, f.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Creates, probes and tears down environments.
pub struct EnvironmentManager {
    provider: Arc<dyn EnvironmentProvider>,
    allocator: Arc<PortAllocator>,
    settings: LifecycleSettings,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
}

impl EnvironmentManager {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        allocator: Arc<PortAllocator>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            provider,
            allocator,
            settings,
            in_use: AtomicUsize::new(0),
            peak_in_use: AtomicUsize::new(0),
        }
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    /// Environments currently in use.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously in-use environments observed.
    pub fn peak_in_use(&self) -> usize {
        self.peak_in_use.load(Ordering::SeqCst)
    }

    /// Claim resources and a working directory for one candidate.
    ///
    /// Fails immediately when the allocator is exhausted.
    pub fn provision(&self, candidate_hash: &str, run_id: &RunId) -> EnvResult<EnvironmentHandle> {
        let resources = self.allocator.acquire()?;
        let short = &candidate_hash[..12.min(candidate_hash.len())];
        let workdir = match tempfile::Builder::new()
            .prefix(&format!("emuval_{short}_"))
            .tempdir()
        {
            Ok(dir) => dir,
            Err(e) => {
                self.allocator.release(&resources);
                return Err(e.into());
            }
        };
        let run = run_id.as_str();
        let run_suffix = &run[run.len().saturating_sub(12)..];

        Ok(EnvironmentHandle {
            instance_name: format!("emuval-{short}-{run_suffix}"),
            candidate_hash: candidate_hash.to_string(),
            run_id: run_id.clone(),
            state: EnvironmentState::Creating,
            resources: Some(resources),
            workdir_path: workdir.path().to_path_buf(),
            workdir: Some(workdir),
            launch: None,
            deployed: false,
            counted_in_use: false,
            torn_down: false,
            allocator: Arc::clone(&self.allocator),
        })
    }

    /// Launch the emulator at the pinned version, retrying with
    /// exponential backoff. On final failure the handle is `Failed`.
    pub async fn start(
        &self,
        handle: &mut EnvironmentHandle,
        version: &str,
        capabilities: &[String],
    ) -> EnvResult<()> {
        let resources = handle
            .resources
            .clone()
            .ok_or(EnvironmentError::InvalidTransition {
                from: handle.state,
                to: EnvironmentState::Healthy,
            })?;
        let labels = BTreeMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (RUN_LABEL.to_string(), handle.run_id.to_string()),
        ]);
        let spec = LaunchSpec {
            instance_name: handle.instance_name.clone(),
            image: self.settings.image.clone(),
            version: version.to_string(),
            resources,
            capabilities: capabilities.to_vec(),
            labels,
        };
        handle.launch = Some(spec.clone());

        let max_attempts = self.settings.start_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.provider.launch(&spec).await {
                Ok(()) => {
                    METRICS.inc_environments_started();
                    obs::emit_environment_started(&spec.instance_name, &spec.endpoint(), attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!(instance = %spec.instance_name, attempt, error = %e, "environment launch failed");
                    last_error = e.to_string();
                    if let Err(stop_err) = self.provider.stop(&spec.instance_name).await {
                        debug!(instance = %spec.instance_name, error = %stop_err, "cleanup after failed launch");
                    }
                    if attempt < max_attempts {
                        let delay = self.settings.start_backoff * 2u32.pow(attempt - 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        METRICS.inc_environment_start_failures();
        handle.fail();
        Err(EnvironmentError::Start {
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// Poll readiness until healthy or `timeout` elapses.
    pub async fn await_healthy(
        &self,
        handle: &mut EnvironmentHandle,
        timeout: Duration,
    ) -> EnvResult<()> {
        let spec = handle
            .launch
            .clone()
            .ok_or(EnvironmentError::InvalidTransition {
                from: handle.state,
                to: EnvironmentState::Healthy,
            })?;
        let deadline = Instant::now() + timeout;
        loop {
            if self.provider.is_ready(&spec).await {
                handle.transition(EnvironmentState::Healthy)?;
                info!(instance = %spec.instance_name, endpoint = %spec.endpoint(), "environment healthy");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                handle.fail();
                return Err(EnvironmentError::HealthCheckTimeout {
                    instance: spec.instance_name,
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.settings.health_poll_interval.min(deadline - now)).await;
        }
    }

    /// Hand a healthy environment to the deployment and test stages.
    pub fn mark_in_use(&self, handle: &mut EnvironmentHandle) -> EnvResult<()> {
        handle.transition(EnvironmentState::InUse)?;
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_use.fetch_max(now, Ordering::SeqCst);
        METRICS.observe_in_use(now as u64);
        handle.counted_in_use = true;
        Ok(())
    }

    /// Tail of the instance logs, empty if nothing was launched.
    pub async fn capture_logs(&self, handle: &EnvironmentHandle) -> String {
        if handle.launch.is_none() || handle.torn_down {
            return String::new();
        }
        self.provider
            .logs(&handle.instance_name)
            .await
            .map(|logs| tail_chars(&logs, LOG_TAIL_CHARS))
            .unwrap_or_default()
    }

    /// Release everything the handle owns. Runs at most once per handle.
    ///
    /// Order: destroy deployed infrastructure, stop the instance, release
    /// the port slot, remove the working directory. Each step runs even
    /// when an earlier one failed; failures are reported, never raised.
    pub async fn teardown(
        &self,
        handle: &mut EnvironmentHandle,
        deployer: Option<&dyn DeploymentTool>,
    ) -> TeardownReport {
        let mut report = TeardownReport {
            instance_name: handle.instance_name.clone(),
            from_state: handle.state,
            failures: Vec::new(),
            already_torn_down: handle.torn_down,
        };
        if handle.torn_down {
            debug!(instance = %handle.instance_name, "teardown already done");
            return report;
        }
        handle.torn_down = true;
        if let Err(e) = handle.transition(EnvironmentState::TearingDown) {
            warn!(instance = %handle.instance_name, error = %e, "forcing teardown");
            handle.state = EnvironmentState::TearingDown;
        }
        if handle.counted_in_use {
            self.in_use.fetch_sub(1, Ordering::SeqCst);
            handle.counted_in_use = false;
        }
        let budget = self.settings.teardown_timeout;

        if handle.deployed {
            if let (Some(deployer), Some(endpoint)) = (deployer, handle.endpoint()) {
                match tokio::time::timeout(budget, deployer.destroy(&endpoint, &handle.workdir_path))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => report.record(TeardownStep::DestroyInfrastructure, e.to_string()),
                    Err(_) => report.record(
                        TeardownStep::DestroyInfrastructure,
                        format!("timed out after {}s", budget.as_secs()),
                    ),
                }
            }
        }

        if handle.launch.is_some() {
            match tokio::time::timeout(budget, self.provider.stop(&handle.instance_name)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => report.record(TeardownStep::StopInstance, e.to_string()),
                Err(_) => report.record(
                    TeardownStep::StopInstance,
                    format!("timed out after {}s", budget.as_secs()),
                ),
            }
        }

        if let Some(resources) = handle.resources.take() {
            self.allocator.release(&resources);
        }

        if let Some(dir) = handle.workdir.take() {
            if let Err(e) = dir.close() {
                report.record(TeardownStep::RemoveWorkdir, e.to_string());
            }
        }

        if let Err(e) = handle.transition(EnvironmentState::Gone) {
            warn!(instance = %handle.instance_name, error = %e, "unexpected state after teardown");
            handle.state = EnvironmentState::Gone;
        }
        METRICS.inc_teardowns();
        if !report.is_clean() {
            METRICS.inc_teardown_failures();
        }
        obs::emit_teardown_finished(&report.instance_name, report.from_state, report.failures.len());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeDeployer, FakeProvider};

    fn settings() -> LifecycleSettings {
        LifecycleSettings {
            image: "emulator".to_string(),
            health_poll_interval: Duration::from_millis(100),
            start_retries: 2,
            start_backoff: Duration::from_millis(10),
            teardown_timeout: Duration::from_secs(5),
        }
    }

    fn manager(provider: Arc<FakeProvider>, slots: usize) -> EnvironmentManager {
        EnvironmentManager::new(provider, Arc::new(PortAllocator::new(5100, 10, slots)), settings())
    }

    fn caps() -> Vec<String> {
        vec!["s3".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_reaches_gone() {
        let provider = Arc::new(FakeProvider::new());
        let mgr = manager(Arc::clone(&provider), 2);
        let mut handle = mgr.provision("abcdef0123456789", &RunId::new()).unwrap();
        let workdir = handle.workdir().to_path_buf();
        assert!(workdir.exists());

        mgr.start(&mut handle, "3.8", &caps()).await.unwrap();
        mgr.await_healthy(&mut handle, Duration::from_secs(5)).await.unwrap();
        mgr.mark_in_use(&mut handle).unwrap();
        assert_eq!(mgr.in_use(), 1);

        let report = mgr.teardown(&mut handle, None).await;
        assert!(report.is_clean());
        assert_eq!(report.from_state, EnvironmentState::InUse);
        assert_eq!(handle.state(), EnvironmentState::Gone);
        assert_eq!(mgr.in_use(), 0);
        assert_eq!(mgr.allocator().in_use(), 0);
        assert!(!workdir.exists());
        assert_eq!(provider.stop_calls(handle.instance_name()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_runs_once() {
        let provider = Arc::new(FakeProvider::new());
        let mgr = manager(Arc::clone(&provider), 1);
        let mut handle = mgr.provision("abcdef0123456789", &RunId::new()).unwrap();
        mgr.start(&mut handle, "3.8", &caps()).await.unwrap();

        let first = mgr.teardown(&mut handle, None).await;
        let second = mgr.teardown(&mut handle, None).await;
        assert!(!first.already_torn_down);
        assert!(second.already_torn_down);
        assert_eq!(provider.stop_calls(handle.instance_name()), 1);
        assert_eq!(mgr.allocator().in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_retries_then_fails() {
        let provider = Arc::new(FakeProvider::new().failing_launches(10));
        let mgr = manager(Arc::clone(&provider), 1);
        let mut handle = mgr.provision("abcdef0123456789", &RunId::new()).unwrap();

        let err = mgr.start(&mut handle, "3.8", &caps()).await.unwrap_err();
        assert!(matches!(err, EnvironmentError::Start { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(provider.launch_attempts(), 3);
        assert_eq!(handle.state(), EnvironmentState::Failed);

        let report = mgr.teardown(&mut handle, None).await;
        assert_eq!(report.from_state, EnvironmentState::Failed);
        assert_eq!(handle.state(), EnvironmentState::Gone);
        assert_eq!(mgr.allocator().in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_succeeds_after_transient_failure() {
        let provider = Arc::new(FakeProvider::new().failing_launches(1));
        let mgr = manager(Arc::clone(&provider), 1);
        let mut handle = mgr.provision("abcdef0123456789", &RunId::new()).unwrap();
        mgr.start(&mut handle, "3.8", &caps()).await.unwrap();
        assert_eq!(provider.launch_attempts(), 2);
        mgr.teardown(&mut handle, None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_timeout_marks_failed() {
        let provider = Arc::new(FakeProvider::new().never_ready());
        let mgr = manager(Arc::clone(&provider), 1);
        let mut handle = mgr.provision("abcdef0123456789", &RunId::new()).unwrap();
        mgr.start(&mut handle, "3.8", &caps()).await.unwrap();

        let err = mgr
            .await_healthy(&mut handle, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvironmentError::HealthCheckTimeout { timeout_secs: 2, .. }));
        assert_eq!(handle.state(), EnvironmentState::Failed);
        mgr.teardown(&mut handle, None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_failures_are_reported_not_raised() {
        let provider = Arc::new(FakeProvider::new().failing_stop());
        let deployer = FakeDeployer::succeeding(1).failing_destroy();
        let mgr = manager(Arc::clone(&provider), 1);
        let mut handle = mgr.provision("abcdef0123456789", &RunId::new()).unwrap();
        mgr.start(&mut handle, "3.8", &caps()).await.unwrap();
        mgr.await_healthy(&mut handle, Duration::from_secs(1)).await.unwrap();
        mgr.mark_in_use(&mut handle).unwrap();
        handle.mark_deployed();

        let report = mgr.teardown(&mut handle, Some(&deployer)).await;
        let steps: Vec<TeardownStep> = report.failures.iter().map(|f| f.step).collect();
        assert_eq!(
            steps,
            vec![TeardownStep::DestroyInfrastructure, TeardownStep::StopInstance]
        );
        assert_eq!(mgr.allocator().in_use(), 0);
        assert_eq!(handle.state(), EnvironmentState::Gone);
    }

    #[tokio::test]
    async fn test_provision_fails_fast_when_exhausted() {
        let provider = Arc::new(FakeProvider::new());
        let mgr = manager(provider, 1);
        let mut first = mgr.provision("aaaa", &RunId::new()).unwrap();
        let err = mgr.provision("bbbb", &RunId::new()).unwrap_err();
        assert!(matches!(err, EnvironmentError::Allocation(_)));
        mgr.teardown(&mut first, None).await;
        assert!(mgr.provision("bbbb", &RunId::new()).is_ok());
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_slot() {
        let provider = Arc::new(FakeProvider::new());
        let mgr = manager(provider, 1);
        {
            let _handle = mgr.provision("aaaa", &RunId::new()).unwrap();
            assert_eq!(mgr.allocator().in_use(), 1);
        }
        assert_eq!(mgr.allocator().in_use(), 0);
    }
}
