//! End-to-end batch scenarios against injected fakes.
//!
//! Every test runs on a paused clock, so candidate deadlines and harness
//! delays elapse instantly while keeping their ordering.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use emuval_core::fakes::{test_result, FakeDeployer, FakeHarnessRunner, FakeProvider, HarnessScript};
use emuval_core::scheduler::ABORTED_BEFORE_START;
use emuval_core::{
    compare_stored_runs, Candidate, EngineConfig, EngineError, Scheduler, TestHarness,
    ValidationJob,
};
use emuval_state::fakes::MemoryRunStore;
use emuval_state::{OutcomeState, RunStatus, RunStore};

fn job(name: &str, service: &str) -> ValidationJob {
    let tf = format!("resource \"aws_{service}_thing\" \"{name}\" {{\n  name = \"{name}\"\n}}\n");
    let candidate = Candidate::new(BTreeMap::from([("main.tf".to_string(), tf)]), None, format!("local:{name}"));
    let harness = TestHarness::new(
        candidate.hash(),
        BTreeMap::from([("test_app.py".to_string(), "def test_ok():\n    pass\n".to_string())]),
    );
    ValidationJob::new(candidate, Some(harness))
}

fn config(concurrency: usize, candidate_timeout_secs: u64) -> EngineConfig {
    EngineConfig {
        concurrency,
        candidate_timeout_secs,
        test_timeout_secs: 10,
        emulator_version: "3.8".to_string(),
        health_poll_interval_ms: 100,
        start_backoff_ms: 10,
        port_slots: 8,
        ..Default::default()
    }
}

struct Bench {
    provider: Arc<FakeProvider>,
    deployer: Arc<FakeDeployer>,
    store: Arc<MemoryRunStore>,
    scheduler: Scheduler,
}

fn bench(config: EngineConfig, provider: FakeProvider, deployer: FakeDeployer, runner: FakeHarnessRunner) -> Bench {
    bench_with_store(config, provider, deployer, runner, Arc::new(MemoryRunStore::new()))
}

fn bench_with_store(
    config: EngineConfig,
    provider: FakeProvider,
    deployer: FakeDeployer,
    runner: FakeHarnessRunner,
    store: Arc<MemoryRunStore>,
) -> Bench {
    let provider = Arc::new(provider);
    let deployer = Arc::new(deployer);
    let scheduler = Scheduler::new(
        config,
        provider.clone(),
        deployer.clone(),
        Arc::new(runner),
        store.clone(),
    )
    .unwrap();
    Bench {
        provider,
        deployer,
        store,
        scheduler,
    }
}

fn short(job: &ValidationJob) -> String {
    job.hash()[..12].to_string()
}

#[tokio::test(start_paused = true)]
async fn mixed_batch_records_one_outcome_per_candidate() {
    let passing = job("alpha", "s3");
    let broken = job("beta", "sqs");
    let slow = job("gamma", "lambda");

    let runner = FakeHarnessRunner::new().script(
        slow.hash(),
        HarnessScript::delayed(test_result(3, 0), Duration::from_secs(600)),
    );
    let b = bench(
        config(3, 30),
        FakeProvider::new(),
        FakeDeployer::succeeding(1).failing_for(short(&broken)),
        runner,
    );

    let snapshot = b
        .scheduler
        .run_batch(vec![passing.clone(), broken.clone(), slow.clone()])
        .await
        .unwrap();

    assert_eq!(snapshot.outcomes.len(), 3);
    assert_eq!(snapshot.record.status, RunStatus::Completed);

    let ok = snapshot.outcome(passing.hash()).unwrap();
    assert_eq!(ok.state, OutcomeState::Passed);
    assert!(ok.logs.is_empty());

    let failed = snapshot.outcome(broken.hash()).unwrap();
    assert_eq!(failed.state, OutcomeState::Failed);
    assert!(failed.tests.is_none());
    assert!(!failed.deployment.as_ref().unwrap().success);
    assert!(failed.logs.contains("fake emulator log"));

    let timed_out = snapshot.outcome(slow.hash()).unwrap();
    assert_eq!(timed_out.state, OutcomeState::Timeout);
    assert!(timed_out.retryable);
    assert!(timed_out.error.as_deref().unwrap().contains("30s"));

    let summary = snapshot.record.summary.as_ref().unwrap();
    assert_eq!((summary.passed, summary.failed, summary.timeout), (1, 1, 1));

    let stored = b.store.list_outcomes(snapshot.run_id()).await.unwrap();
    assert_eq!(stored, snapshot.outcomes);

    assert_eq!(b.provider.live_instances(), 0);
    assert_eq!(b.provider.total_stop_calls(), 3);
    assert_eq!(b.scheduler.manager().allocator().in_use(), 0);
    assert_eq!(b.scheduler.manager().in_use(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_limit() {
    let jobs: Vec<ValidationJob> = (0..6).map(|i| job(&format!("c{i}"), "s3")).collect();
    let runner = FakeHarnessRunner::new().with_default(HarnessScript::delayed(test_result(1, 0), Duration::from_secs(5)));
    let b = bench(config(2, 60), FakeProvider::new(), FakeDeployer::succeeding(1), runner);

    let snapshot = b.scheduler.run_batch(jobs).await.unwrap();
    assert_eq!(snapshot.outcomes.len(), 6);
    assert!(snapshot.outcomes.iter().all(|o| o.state == OutcomeState::Passed));
    assert_eq!(b.scheduler.manager().peak_in_use(), 2);
    assert!(b.provider.peak_live() <= 2);
}

#[tokio::test(start_paused = true)]
async fn panic_and_harness_fault_are_isolated() {
    let fine = job("fine", "s3");
    let panics = job("panics", "s3");
    let crashes = job("crashes", "s3");
    let runner = FakeHarnessRunner::new()
        .script(panics.hash(), HarnessScript::Panic)
        .script(
            crashes.hash(),
            HarnessScript::Fault {
                detail: "ImportError: boto3".to_string(),
            },
        );
    let b = bench(config(3, 60), FakeProvider::new(), FakeDeployer::succeeding(1), runner);

    let snapshot = b
        .scheduler
        .run_batch(vec![fine.clone(), panics.clone(), crashes.clone()])
        .await
        .unwrap();

    assert_eq!(snapshot.outcome(fine.hash()).unwrap().state, OutcomeState::Passed);
    let panicked = snapshot.outcome(panics.hash()).unwrap();
    assert_eq!(panicked.state, OutcomeState::Error);
    assert!(panicked.error.as_deref().unwrap().contains("panicked"));
    let crashed = snapshot.outcome(crashes.hash()).unwrap();
    assert_eq!(crashed.state, OutcomeState::Error);
    assert!(crashed.error.as_deref().unwrap().contains("ImportError"));

    assert_eq!(b.provider.live_instances(), 0);
    assert_eq!(b.deployer.destroy_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn teardown_runs_once_even_when_it_fails() {
    let jobs: Vec<ValidationJob> = (0..3).map(|i| job(&format!("t{i}"), "sns")).collect();
    let b = bench(
        config(2, 60),
        FakeProvider::new().failing_stop(),
        FakeDeployer::succeeding(1).failing_destroy(),
        FakeHarnessRunner::new(),
    );

    let snapshot = b.scheduler.run_batch(jobs).await.unwrap();
    assert_eq!(snapshot.outcomes.len(), 3);
    for outcome in &snapshot.outcomes {
        assert_eq!(outcome.state, OutcomeState::Passed);
        assert!(outcome.logs.contains("teardown"));
    }
    assert_eq!(b.provider.total_stop_calls(), 3);
    assert_eq!(b.deployer.destroy_calls(), 3);
    assert_eq!(b.scheduler.manager().allocator().in_use(), 0);
}

#[tokio::test(start_paused = true)]
async fn environment_start_failure_is_retryable_error() {
    let only = job("flaky-start", "s3");
    let b = bench(
        config(1, 60),
        FakeProvider::new().failing_launches(10),
        FakeDeployer::succeeding(1),
        FakeHarnessRunner::new(),
    );

    let snapshot = b.scheduler.run_batch(vec![only.clone()]).await.unwrap();
    let outcome = snapshot.outcome(only.hash()).unwrap();
    assert_eq!(outcome.state, OutcomeState::Error);
    assert!(outcome.retryable);
    assert!(outcome.deployment.is_none());
    assert_eq!(b.deployer.apply_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn abort_keeps_finished_work_and_seals_aborted() {
    let jobs: Vec<ValidationJob> = (0..3).map(|i| job(&format!("a{i}"), "s3")).collect();
    let runner = FakeHarnessRunner::new().with_default(HarnessScript::delayed(test_result(2, 0), Duration::from_secs(10)));
    let b = bench(config(1, 60), FakeProvider::new(), FakeDeployer::succeeding(1), runner);
    let abort = b.scheduler.abort_handle();

    let (result, ()) = tokio::join!(b.scheduler.run_batch(jobs), async {
        tokio::time::sleep(Duration::from_secs(15)).await;
        abort.abort();
    });
    let snapshot = result.unwrap();

    assert_eq!(snapshot.record.status, RunStatus::Aborted);
    assert_eq!(snapshot.outcomes.len(), 3);
    let states: Vec<OutcomeState> = snapshot.outcomes.iter().map(|o| o.state).collect();
    assert_eq!(states.iter().filter(|s| **s == OutcomeState::Passed).count(), 1);
    assert_eq!(states.iter().filter(|s| **s == OutcomeState::Error).count(), 2);

    let never_started = snapshot
        .outcomes
        .iter()
        .filter(|o| o.error.as_deref() == Some(ABORTED_BEFORE_START))
        .count();
    assert_eq!(never_started, 1);
    assert!(snapshot
        .outcomes
        .iter()
        .filter(|o| o.state == OutcomeState::Error)
        .all(|o| o.retryable));
    assert_eq!(b.provider.live_instances(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_jobs_are_validated_once() {
    let one = job("dup", "s3");
    let b = bench(config(2, 60), FakeProvider::new(), FakeDeployer::succeeding(1), FakeHarnessRunner::new());
    let snapshot = b.scheduler.run_batch(vec![one.clone(), one]).await.unwrap();
    assert_eq!(snapshot.outcomes.len(), 1);
    assert_eq!(b.deployer.apply_calls(), 1);
}

#[tokio::test]
async fn invalid_config_is_rejected_before_any_run() {
    let store = Arc::new(MemoryRunStore::new());
    let err = Scheduler::new(
        config(0, 60),
        Arc::new(FakeProvider::new()),
        Arc::new(FakeDeployer::succeeding(1)),
        Arc::new(FakeHarnessRunner::new()),
        store.clone(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, EngineError::Config(_)));
    assert!(store.list_runs().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn comparison_between_batches_flags_regression_and_fix() {
    let stays = job("stays", "s3");
    let breaks = job("breaks", "s3");
    let heals = job("heals", "sqs");
    let jobs = vec![stays.clone(), breaks.clone(), heals.clone()];
    let store = Arc::new(MemoryRunStore::new());

    let first = bench_with_store(
        config(3, 60),
        FakeProvider::new(),
        FakeDeployer::succeeding(1).failing_for(short(&heals)),
        FakeHarnessRunner::new(),
        store.clone(),
    );
    let previous = first.scheduler.run_batch(jobs.clone()).await.unwrap();

    let second = bench_with_store(
        config(3, 60),
        FakeProvider::new(),
        FakeDeployer::succeeding(1).failing_for(short(&breaks)),
        FakeHarnessRunner::new(),
        store.clone(),
    );
    let current = second.scheduler.run_batch(jobs).await.unwrap();

    let report = compare_stored_runs(store.as_ref(), current.run_id(), previous.run_id(), 2.0)
        .await
        .unwrap();
    assert!(report.has_regressions());
    assert_eq!(report.regressions.len(), 1);
    assert_eq!(report.regressions[0].candidate_hash, breaks.hash());
    assert_eq!(report.regressions[0].previous_state, OutcomeState::Passed);
    assert_eq!(report.regressions[0].current_state, OutcomeState::Failed);
    assert_eq!(report.fixes.len(), 1);
    assert_eq!(report.fixes[0].candidate_hash, heals.hash());

    let again = compare_stored_runs(store.as_ref(), current.run_id(), previous.run_id(), 2.0)
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_string(&report).unwrap(),
        serde_json::to_string(&again).unwrap()
    );
}
