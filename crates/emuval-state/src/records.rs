//! Run and outcome records.
//!
//! These are the shapes written to and read from a [`crate::RunStore`].
//! Everything here is plain data; the engine that produces it lives in
//! `emuval-core`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique, time-ordered identifier for a validation run.
///
/// Generated as a UUIDv7, so the string form sorts in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new time-ordered RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 8 chars) for human-facing output.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// OutcomeState
// ---------------------------------------------------------------------------

/// Terminal state of one candidate's validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeState {
    Passed,
    Partial,
    Failed,
    Timeout,
    Error,
}

impl OutcomeState {
    pub const ALL: [OutcomeState; 5] = [
        OutcomeState::Passed,
        OutcomeState::Partial,
        OutcomeState::Failed,
        OutcomeState::Timeout,
        OutcomeState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeState::Passed => "PASSED",
            OutcomeState::Partial => "PARTIAL",
            OutcomeState::Failed => "FAILED",
            OutcomeState::Timeout => "TIMEOUT",
            OutcomeState::Error => "ERROR",
        }
    }

    /// PASSED or PARTIAL.
    pub fn is_passing(&self) -> bool {
        matches!(self, OutcomeState::Passed | OutcomeState::Partial)
    }

    /// FAILED, TIMEOUT or ERROR.
    pub fn is_failing(&self) -> bool {
        !self.is_passing()
    }
}

impl fmt::Display for OutcomeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutcomeState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown outcome state: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Deployment / test results
// ---------------------------------------------------------------------------

/// Structured result of applying a candidate into an environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
    /// Whether the tool exited zero and its output parsed cleanly.
    pub success: bool,
    /// Resources the tool reported as created.
    pub resources_created: u32,
    /// Declared outputs, by name.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Error lines extracted from the tool output.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Full textual log of the deployment.
    #[serde(default)]
    pub log: String,
}

impl DeploymentResult {
    /// A failed deployment carrying only its log.
    pub fn failed(log: impl Into<String>) -> Self {
        Self {
            success: false,
            log: log.into(),
            ..Self::default()
        }
    }
}

/// Status of an individual test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

/// A single test case result parsed from harness output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub name: String,
    pub status: TestCaseStatus,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    /// The test hit its own per-test ceiling. Always paired with `Failed`.
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Aggregate result of running a candidate's test harness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    #[serde(default)]
    pub cases: Vec<TestCaseResult>,
    /// Captured harness output.
    #[serde(default)]
    pub output: String,
}

impl TestResult {
    /// Build counts from individual cases. `Error` cases count as failures.
    pub fn from_cases(cases: Vec<TestCaseResult>, output: impl Into<String>) -> Self {
        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for case in &cases {
            match case.status {
                TestCaseStatus::Passed => passed += 1,
                TestCaseStatus::Failed | TestCaseStatus::Error => failed += 1,
                TestCaseStatus::Skipped => skipped += 1,
            }
        }
        Self {
            passed,
            failed,
            skipped,
            cases,
            output: output.into(),
        }
    }

    pub fn total(&self) -> u32 {
        self.passed + self.failed + self.skipped
    }

    /// Tests that produced a verdict (skips excluded).
    pub fn executed(&self) -> u32 {
        self.passed + self.failed
    }

    /// Number of cases that hit their per-test ceiling.
    pub fn timed_out_count(&self) -> usize {
        self.cases.iter().filter(|c| c.timed_out).count()
    }
}

// ---------------------------------------------------------------------------
// ValidationOutcome
// ---------------------------------------------------------------------------

/// The result of validating one candidate within one run. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub candidate_hash: String,
    pub run_id: RunId,
    pub state: OutcomeState,
    /// Capabilities the candidate exercises, sorted.
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub deployment: Option<DeploymentResult>,
    #[serde(default)]
    pub tests: Option<TestResult>,
    /// Environment logs captured for failure drill-down.
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub error: Option<String>,
    /// Whether re-running the candidate could plausibly change the result.
    #[serde(default)]
    pub retryable: bool,
}

impl ValidationOutcome {
    /// Outcome for a candidate that produced no verifiable result.
    pub fn error(
        candidate_hash: impl Into<String>,
        run_id: RunId,
        capabilities: Vec<String>,
        started_at: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            candidate_hash: candidate_hash.into(),
            run_id,
            state: OutcomeState::Error,
            capabilities,
            started_at,
            completed_at,
            duration_ms: elapsed_ms(started_at, completed_at),
            deployment: None,
            tests: None,
            logs: String::new(),
            error: Some(detail.into()),
            retryable: false,
        }
    }
}

/// Milliseconds between two timestamps, clamped at zero.
pub fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Per-state counts for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: u32,
    pub passed: u32,
    pub partial: u32,
    pub failed: u32,
    pub timeout: u32,
    pub error: u32,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn from_outcomes(outcomes: &[ValidationOutcome], duration_ms: u64) -> Self {
        let mut summary = RunSummary {
            duration_ms,
            ..Default::default()
        };
        for outcome in outcomes {
            summary.total += 1;
            match outcome.state {
                OutcomeState::Passed => summary.passed += 1,
                OutcomeState::Partial => summary.partial += 1,
                OutcomeState::Failed => summary.failed += 1,
                OutcomeState::Timeout => summary.timeout += 1,
                OutcomeState::Error => summary.error += 1,
            }
        }
        summary
    }

    pub fn count(&self, state: OutcomeState) -> u32 {
        match state {
            OutcomeState::Passed => self.passed,
            OutcomeState::Partial => self.partial,
            OutcomeState::Failed => self.failed,
            OutcomeState::Timeout => self.timeout,
            OutcomeState::Error => self.error,
        }
    }

    /// Percentage of candidates that fully passed.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.passed) / f64::from(self.total) * 100.0
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
}

impl RunStatus {
    /// Completed and Aborted runs are immutable.
    pub fn is_sealed(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Configuration snapshot pinned for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub concurrency: usize,
    pub candidate_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub emulator_version: String,
}

/// Full run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub settings: RunSettings,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    /// Candidate hashes with their states, sorted by hash. Filled on seal.
    #[serde(default)]
    pub outcome_index: Vec<(String, OutcomeState)>,
}

impl RunRecord {
    /// Open a new running record.
    pub fn start(settings: RunSettings) -> Self {
        Self {
            run_id: RunId::new(),
            started_at: Utc::now(),
            completed_at: None,
            settings,
            status: RunStatus::Running,
            summary: None,
            outcome_index: Vec::new(),
        }
    }

    pub fn emulator_version(&self) -> &str {
        &self.settings.emulator_version
    }

    /// Seal the record from its collected outcomes.
    ///
    /// The outcome index is sorted by candidate hash regardless of the
    /// order outcomes arrived in.
    pub fn seal(&mut self, outcomes: &[ValidationOutcome], aborted: bool) {
        let completed_at = Utc::now();
        let mut index: Vec<(String, OutcomeState)> = outcomes
            .iter()
            .map(|o| (o.candidate_hash.clone(), o.state))
            .collect();
        index.sort();

        self.summary = Some(RunSummary::from_outcomes(
            outcomes,
            elapsed_ms(self.started_at, completed_at),
        ));
        self.outcome_index = index;
        self.completed_at = Some(completed_at);
        self.status = if aborted {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
    }
}

/// A sealed run together with its outcomes, sorted by candidate hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub record: RunRecord,
    pub outcomes: Vec<ValidationOutcome>,
}

impl RunSnapshot {
    pub fn run_id(&self) -> &RunId {
        &self.record.run_id
    }

    pub fn outcome(&self, candidate_hash: &str) -> Option<&ValidationOutcome> {
        self.outcomes
            .binary_search_by(|o| o.candidate_hash.as_str().cmp(candidate_hash))
            .ok()
            .map(|idx| &self.outcomes[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(hash: &str, state: OutcomeState) -> ValidationOutcome {
        let now = Utc::now();
        ValidationOutcome {
            candidate_hash: hash.to_string(),
            run_id: RunId::from("run-a"),
            state,
            capabilities: vec![],
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            deployment: None,
            tests: None,
            logs: String::new(),
            error: None,
            retryable: false,
        }
    }

    fn settings() -> RunSettings {
        RunSettings {
            concurrency: 2,
            candidate_timeout_secs: 300,
            test_timeout_secs: 60,
            emulator_version: "3.0".to_string(),
        }
    }

    #[test]
    fn test_passing_and_failing_partition_states() {
        for state in OutcomeState::ALL {
            assert_ne!(state.is_passing(), state.is_failing(), "{state}");
        }
        assert!(OutcomeState::Partial.is_passing());
        assert!(OutcomeState::Timeout.is_failing());
    }

    #[test]
    fn test_outcome_state_serializes_upper_case() {
        let json = serde_json::to_string(&OutcomeState::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
        assert_eq!("partial".parse::<OutcomeState>().unwrap(), OutcomeState::Partial);
        assert!("bogus".parse::<OutcomeState>().is_err());
    }

    #[test]
    fn test_run_ids_sort_in_creation_order() {
        let first = RunId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = RunId::new();
        assert!(first < second);
    }

    #[test]
    fn test_test_result_counts_error_cases_as_failures() {
        let case = |name: &str, status| TestCaseResult {
            name: name.to_string(),
            status,
            duration_secs: None,
            timed_out: false,
            error_message: None,
        };
        let result = TestResult::from_cases(
            vec![
                case("a", TestCaseStatus::Passed),
                case("b", TestCaseStatus::Error),
                case("c", TestCaseStatus::Skipped),
            ],
            "",
        );
        assert_eq!(result.passed, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.executed(), 2);
    }

    #[test]
    fn test_summary_counts_every_state() {
        let outcomes = vec![
            outcome("a", OutcomeState::Passed),
            outcome("b", OutcomeState::Failed),
            outcome("c", OutcomeState::Timeout),
            outcome("d", OutcomeState::Passed),
        ];
        let summary = RunSummary::from_outcomes(&outcomes, 10);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.count(OutcomeState::Passed), 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timeout, 1);
        assert!((summary.pass_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_seal_sorts_index_independent_of_arrival_order() {
        let mut record = RunRecord::start(settings());
        record.seal(
            &[
                outcome("cc", OutcomeState::Passed),
                outcome("aa", OutcomeState::Error),
                outcome("bb", OutcomeState::Failed),
            ],
            false,
        );
        let hashes: Vec<&str> = record.outcome_index.iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(hashes, vec!["aa", "bb", "cc"]);
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_seal_aborted_marks_status() {
        let mut record = RunRecord::start(settings());
        record.seal(&[], true);
        assert_eq!(record.status, RunStatus::Aborted);
        assert!(record.status.is_sealed());
        assert_eq!(record.summary.unwrap().total, 0);
    }
}
