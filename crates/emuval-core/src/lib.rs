//! emuval-core: validation engine for infrastructure definitions.
//!
//! Each candidate is deployed into its own short-lived emulator
//! environment, exercised by its test harness, classified into exactly one
//! outcome state and torn down. Sealed runs can be compared to surface
//! regressions, fixes and per-capability trends.
//!
//! ## Key Components
//!
//! - [`Scheduler`]: bounded-concurrency batch driver
//! - [`Validator`]: one candidate from environment start to teardown
//! - [`EnvironmentManager`]: environment state machine and teardown
//! - [`compare_runs`]: regression / fix / trend report between two runs
//! - [`diagnose_run`]: root-cause clusters for a run's failures

pub mod allocator;
pub mod candidate;
pub mod catalog;
pub mod classify;
pub mod compare;
pub mod config;
pub mod deploy;
pub mod diagnose;
pub mod environment;
pub mod error;
pub mod fakes;
pub mod harness;
pub mod history;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod process;
pub mod scheduler;
pub mod stability;
pub mod telemetry;

pub use allocator::{AllocationError, PortAllocator, ResourceSet};
pub use candidate::{Candidate, TestHarness};
pub use catalog::Catalog;
pub use classify::{classify, classify_termination, Termination};
pub use compare::{
    compare_runs, compare_stored_runs, CapabilityTrend, ComparisonReport, StatusChange,
    TrendDirection,
};
pub use config::{ConfigError, ConfigResult, EngineConfig};
pub use deploy::{DeployError, DeploymentTool, TerraformDeployer};
pub use diagnose::{
    diagnose_message, diagnose_run, Diagnosis, DiagnosisReport, ErrorCategory, ErrorCluster,
};
pub use environment::{
    clean_stale_environments, CleanupReport, DockerEmulator, EnvironmentError,
    EnvironmentManager, EnvironmentProvider, EnvironmentState, TeardownReport,
};
pub use error::{EngineError, EngineResult};
pub use harness::{HarnessError, HarnessRunner, PytestRunner};
pub use history::{
    capability_history, recent_sealed_runs, resolve_comparison_pair, CapabilityHistory,
    CapabilityHistoryEntry,
};
pub use metrics::METRICS;
pub use pipeline::{PipelineSettings, ValidationJob, Validator};
pub use scheduler::{BatchAbort, Scheduler};
pub use stability::{analyze_stability, flaky_tests, TestStability};
pub use telemetry::init_tracing;
