//! Test stability across runs.
//!
//! A test observed both passing and failing for the same candidate is
//! flaky. Flips count verdict changes between consecutive observations in
//! run order, so a test alternating every run scores higher than one that
//! broke once and stayed broken.

use std::collections::BTreeMap;

use emuval_state::{RunSnapshot, TestCaseStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStability {
    pub candidate_hash: String,
    pub test_name: String,
    pub passes: u32,
    pub failures: u32,
    pub flips: u32,
    /// Runs that executed this test to a verdict.
    pub observed_runs: u32,
}

impl TestStability {
    pub fn is_flaky(&self) -> bool {
        self.passes > 0 && self.failures > 0
    }

    pub fn pass_rate(&self) -> f64 {
        let total = self.passes + self.failures;
        if total == 0 {
            0.0
        } else {
            f64::from(self.passes) * 100.0 / f64::from(total)
        }
    }
}

/// Stability of every test seen in `runs`, sorted by candidate hash then
/// test name. `runs` may be in any order; observations are replayed by run id.
pub fn analyze_stability(runs: &[RunSnapshot]) -> Vec<TestStability> {
    let mut ordered: Vec<&RunSnapshot> = runs.iter().collect();
    ordered.sort_by(|a, b| a.run_id().cmp(b.run_id()));

    let mut stats: BTreeMap<(String, String), (TestStability, Option<bool>)> = BTreeMap::new();
    for run in ordered {
        for outcome in &run.outcomes {
            let Some(tests) = &outcome.tests else { continue };
            for case in &tests.cases {
                let passed = match case.status {
                    TestCaseStatus::Passed => true,
                    TestCaseStatus::Failed | TestCaseStatus::Error => false,
                    TestCaseStatus::Skipped => continue,
                };
                let key = (outcome.candidate_hash.clone(), case.name.clone());
                let (entry, last) = stats.entry(key).or_insert_with(|| {
                    (
                        TestStability {
                            candidate_hash: outcome.candidate_hash.clone(),
                            test_name: case.name.clone(),
                            passes: 0,
                            failures: 0,
                            flips: 0,
                            observed_runs: 0,
                        },
                        None,
                    )
                });
                if passed {
                    entry.passes += 1;
                } else {
                    entry.failures += 1;
                }
                entry.observed_runs += 1;
                if last.is_some_and(|prev| prev != passed) {
                    entry.flips += 1;
                }
                *last = Some(passed);
            }
        }
    }
    stats.into_values().map(|(s, _)| s).collect()
}

/// Only the flaky entries of [`analyze_stability`].
pub fn flaky_tests(runs: &[RunSnapshot]) -> Vec<TestStability> {
    analyze_stability(runs)
        .into_iter()
        .filter(TestStability::is_flaky)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use emuval_state::{
        OutcomeState, RunRecord, RunSettings, TestCaseResult, TestResult, ValidationOutcome,
    };

    fn run_with(cases: &[(&str, &str, TestCaseStatus)]) -> RunSnapshot {
        let mut record = RunRecord::start(RunSettings {
            concurrency: 1,
            candidate_timeout_secs: 300,
            test_timeout_secs: 60,
            emulator_version: "3.8".into(),
        });
        let mut by_hash: BTreeMap<&str, Vec<TestCaseResult>> = BTreeMap::new();
        for (hash, name, status) in cases {
            by_hash.entry(*hash).or_default().push(TestCaseResult {
                name: name.to_string(),
                status: *status,
                duration_secs: None,
                timed_out: false,
                error_message: None,
            });
        }
        let outcomes: Vec<ValidationOutcome> = by_hash
            .into_iter()
            .map(|(hash, cases)| {
                let mut o = ValidationOutcome::error(hash, record.run_id.clone(), vec![], Utc::now(), "");
                o.state = OutcomeState::Partial;
                o.tests = Some(TestResult::from_cases(cases, ""));
                o
            })
            .collect();
        record.seal(&outcomes, false);
        std::thread::sleep(std::time::Duration::from_millis(2));
        RunSnapshot { record, outcomes }
    }

    #[test]
    fn test_flaky_detected_with_flip_count() {
        use TestCaseStatus::*;
        let runs = vec![
            run_with(&[("a", "test_put", Passed), ("a", "test_get", Passed)]),
            run_with(&[("a", "test_put", Failed), ("a", "test_get", Passed)]),
            run_with(&[("a", "test_put", Passed), ("a", "test_get", Skipped)]),
        ];
        let all = analyze_stability(&runs);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].test_name, "test_get");
        assert!(!all[0].is_flaky());
        assert_eq!(all[0].observed_runs, 2);

        let flaky = flaky_tests(&runs);
        assert_eq!(flaky.len(), 1);
        assert_eq!(flaky[0].test_name, "test_put");
        assert_eq!((flaky[0].passes, flaky[0].failures, flaky[0].flips), (2, 1, 2));
    }

    #[test]
    fn test_input_order_does_not_matter() {
        use TestCaseStatus::*;
        let first = run_with(&[("b", "t", Passed)]);
        let second = run_with(&[("b", "t", Failed)]);
        let third = run_with(&[("b", "t", Failed)]);
        let forward = analyze_stability(&[first.clone(), second.clone(), third.clone()]);
        let reversed = analyze_stability(&[third, first, second]);
        assert_eq!(forward, reversed);
        assert_eq!(forward[0].flips, 1);
    }

    #[test]
    fn test_sorted_by_hash_then_name() {
        use TestCaseStatus::*;
        let runs = vec![run_with(&[("z", "a_test", Passed), ("b", "z_test", Passed), ("b", "a_test", Failed)])];
        let keys: Vec<(String, String)> = analyze_stability(&runs)
            .into_iter()
            .map(|s| (s.candidate_hash, s.test_name))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("b".to_string(), "a_test".to_string()),
                ("b".to_string(), "z_test".to_string()),
                ("z".to_string(), "a_test".to_string()),
            ]
        );
    }
}
