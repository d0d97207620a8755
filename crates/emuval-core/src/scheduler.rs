//! Bounded-parallel batch driver.
//!
//! Each candidate runs in its own task behind a [`Semaphore`] permit and
//! reports exactly one outcome over an mpsc channel. The aggregator
//! persists outcomes as they arrive, so an aborted or partially failed
//! batch keeps everything already finished. Tasks never see each other's
//! failures: a panic, timeout or fault is converted to an outcome inside
//! the task, and a task that dies without reporting gets a synthesized
//! `ERROR` outcome after join.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use emuval_state::{
    OutcomeState, RunRecord, RunSnapshot, RunStore, StoreError, ValidationOutcome,
};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};

use crate::allocator::PortAllocator;
use crate::config::EngineConfig;
use crate::deploy::DeploymentTool;
use crate::environment::{EnvironmentManager, EnvironmentProvider, LifecycleSettings};
use crate::error::{EngineError, EngineResult};
use crate::harness::HarnessRunner;
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::{cancelled, PipelineSettings, ValidationJob, Validator};

/// Detail recorded for candidates that never started because of an abort.
pub const ABORTED_BEFORE_START: &str = "aborted before start";

/// Cancels a running batch.
///
/// In-flight candidates stop at their next suspension point, tear down and
/// record `ERROR`; queued candidates record `ERROR` without starting. Once
/// triggered the flag stays set for the scheduler's lifetime.
#[derive(Debug, Clone)]
pub struct BatchAbort {
    tx: Arc<watch::Sender<bool>>,
}

impl BatchAbort {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        if !self.tx.send_replace(true) {
            warn!("batch abort requested");
        }
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

pub struct Scheduler {
    config: EngineConfig,
    validator: Arc<Validator>,
    store: Arc<dyn RunStore>,
    abort: BatchAbort,
}

impl Scheduler {
    /// Build a scheduler. An invalid configuration is rejected here.
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn EnvironmentProvider>,
        deployer: Arc<dyn DeploymentTool>,
        harness_runner: Arc<dyn HarnessRunner>,
        store: Arc<dyn RunStore>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let allocator = Arc::new(PortAllocator::new(
            config.port_base,
            config.port_stride,
            config.port_slots,
        ));
        let manager = Arc::new(EnvironmentManager::new(
            provider,
            allocator,
            LifecycleSettings::from_config(&config),
        ));
        let validator = Arc::new(Validator::new(
            manager,
            deployer,
            harness_runner,
            PipelineSettings::from_config(&config),
        ));
        Ok(Self {
            config,
            validator,
            store,
            abort: BatchAbort::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &EnvironmentManager {
        self.validator.manager()
    }

    pub fn abort_handle(&self) -> BatchAbort {
        self.abort.clone()
    }

    /// Validate every job and seal the run.
    ///
    /// Jobs with a duplicate candidate hash are validated once. The
    /// returned snapshot's outcomes are sorted by candidate hash.
    pub async fn run_batch(&self, jobs: Vec<ValidationJob>) -> EngineResult<RunSnapshot> {
        let allocator = self.manager().allocator();
        let available = allocator.capacity().saturating_sub(allocator.in_use());
        if !jobs.is_empty() && available == 0 {
            return Err(EngineError::ResourcesExhausted {
                required: self.config.concurrency.min(jobs.len()),
                available,
            });
        }

        let jobs = dedupe(jobs);
        let record = RunRecord::start(self.config.run_settings());
        self.store.create_run(&record).await?;
        let span = obs::run_span(record.run_id.as_str());
        self.drive(record, jobs).instrument(span).await
    }

    async fn drive(&self, mut record: RunRecord, jobs: Vec<ValidationJob>) -> EngineResult<RunSnapshot> {
        let run_id = record.run_id.clone();
        obs::emit_batch_started(
            run_id.as_str(),
            jobs.len(),
            self.config.concurrency,
            &self.config.emulator_version,
        );

        let expected: Vec<(String, Vec<String>)> = jobs
            .iter()
            .map(|j| (j.hash().to_string(), j.candidate.capabilities().to_vec()))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let (tx, mut rx) = mpsc::channel::<ValidationOutcome>(jobs.len().max(1));
        let mut tasks = JoinSet::new();

        for job in jobs {
            let semaphore = Arc::clone(&semaphore);
            let validator = Arc::clone(&self.validator);
            let tx = tx.clone();
            let mut cancel = self.abort.subscribe();
            let run_id = run_id.clone();
            let span = obs::candidate_span(job.hash());

            tasks.spawn(
                async move {
                    let queued_at = Utc::now();
                    let permit = tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let outcome = match permit {
                        Some(_permit) => validator.validate(&job, &run_id, cancel).await,
                        None => {
                            let mut outcome = ValidationOutcome::error(
                                job.hash(),
                                run_id.clone(),
                                job.candidate.capabilities().to_vec(),
                                queued_at,
                                ABORTED_BEFORE_START,
                            );
                            outcome.retryable = true;
                            outcome
                        }
                    };
                    if tx.send(outcome).await.is_err() {
                        warn!("outcome receiver closed before delivery");
                    }
                }
                .instrument(span),
            );
        }
        drop(tx);

        let mut collected: BTreeMap<String, ValidationOutcome> = BTreeMap::new();
        let mut persist_error: Option<StoreError> = None;
        while let Some(outcome) = rx.recv().await {
            self.accept(outcome, &mut collected, &mut persist_error).await;
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "validation task ended abnormally");
            }
        }

        for (hash, capabilities) in expected {
            if collected.contains_key(&hash) {
                continue;
            }
            warn!(candidate = %hash, "no outcome reported; recording ERROR");
            let outcome = ValidationOutcome::error(
                hash,
                run_id.clone(),
                capabilities,
                Utc::now(),
                "validation task terminated without an outcome",
            );
            self.accept(outcome, &mut collected, &mut persist_error).await;
        }

        let aborted = self.abort.is_aborted();
        let outcomes: Vec<ValidationOutcome> = collected.into_values().collect();
        if aborted {
            let unfinished = outcomes
                .iter()
                .filter(|o| o.state == OutcomeState::Error && o.retryable)
                .count();
            obs::emit_batch_aborted(run_id.as_str(), unfinished);
        }

        record.seal(&outcomes, aborted);
        self.store.seal_run(&record).await?;
        METRICS.flush();
        if let Some(summary) = &record.summary {
            obs::emit_batch_sealed(run_id.as_str(), summary, aborted);
        }
        info!(run_id = %run_id, peak_in_use = self.manager().peak_in_use(), "batch complete");

        if let Some(e) = persist_error {
            return Err(e.into());
        }
        Ok(RunSnapshot { record, outcomes })
    }

    async fn accept(
        &self,
        outcome: ValidationOutcome,
        collected: &mut BTreeMap<String, ValidationOutcome>,
        persist_error: &mut Option<StoreError>,
    ) {
        if collected.contains_key(&outcome.candidate_hash) {
            warn!(candidate = %outcome.candidate_hash, "duplicate outcome ignored");
            return;
        }
        match self.store.record_outcome(&outcome).await {
            Ok(()) => METRICS.inc_outcomes_recorded(),
            Err(e) => {
                obs::emit_outcome_persist_error(outcome.run_id.as_str(), &outcome.candidate_hash, &e);
                persist_error.get_or_insert(e);
            }
        }
        obs::emit_outcome_recorded(&outcome.candidate_hash, outcome.state, outcome.duration_ms);
        collected.insert(outcome.candidate_hash.clone(), outcome);
    }
}

fn dedupe(jobs: Vec<ValidationJob>) -> Vec<ValidationJob> {
    let mut seen = BTreeSet::new();
    jobs.into_iter()
        .filter(|job| {
            let fresh = seen.insert(job.hash().to_string());
            if !fresh {
                warn!(candidate = %job.hash(), "duplicate candidate skipped");
            }
            fresh
        })
        .collect()
}

