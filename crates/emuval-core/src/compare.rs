//! Regression and trend comparison between two sealed runs.
//!
//! [`compare_runs`] is pure: it reads two snapshots and returns a report
//! whose ordering depends only on the data (changes by candidate hash,
//! trends by capability name). It carries no timestamps, so two calls over
//! the same persisted runs serialize to identical bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use emuval_state::{OutcomeState, RunId, RunSnapshot, RunStore, ValidationOutcome};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::obs;

/// A candidate whose state crossed the passing/failing line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub candidate_hash: String,
    pub previous_run_id: RunId,
    pub current_run_id: RunId,
    pub previous_state: OutcomeState,
    pub current_state: OutcomeState,
    /// Capabilities the candidate exercises.
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrendDirection::Improving => "improving",
            TrendDirection::Stable => "stable",
            TrendDirection::Declining => "declining",
        })
    }
}

/// Per-capability pass rates across two runs, in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityTrend {
    pub capability: String,
    pub current_pass_rate: Option<f64>,
    pub previous_pass_rate: Option<f64>,
    /// Percentage-point change; `None` unless both runs exercised it.
    pub delta: Option<f64>,
    pub direction: TrendDirection,
    pub current_total: u32,
    pub previous_total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub current_run_id: RunId,
    pub previous_run_id: RunId,
    pub regressions: Vec<StatusChange>,
    pub fixes: Vec<StatusChange>,
    pub trends: Vec<CapabilityTrend>,
}

impl ComparisonReport {
    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }

    /// Plain-text rendering for terminals.
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "Comparing {} (current) against {} (previous)\n",
            self.current_run_id, self.previous_run_id
        );
        out.push_str(&format!("\nRegressions: {}\n", self.regressions.len()));
        for change in &self.regressions {
            out.push_str(&format!("  {}\n", render_change(change)));
        }
        out.push_str(&format!("\nFixes: {}\n", self.fixes.len()));
        for change in &self.fixes {
            out.push_str(&format!("  {}\n", render_change(change)));
        }
        out.push_str("\nCapability trends:\n");
        for trend in &self.trends {
            out.push_str(&format!(
                "  {:<20} {:>7} -> {:>7}  {}\n",
                trend.capability,
                render_rate(trend.previous_pass_rate),
                render_rate(trend.current_pass_rate),
                trend.direction
            ));
        }
        out
    }
}

fn render_change(change: &StatusChange) -> String {
    format!(
        "{}: {} -> {} [{}]",
        change.candidate_hash,
        change.previous_state,
        change.current_state,
        change.capabilities.join(",")
    )
}

fn render_rate(rate: Option<f64>) -> String {
    rate.map(|r| format!("{r:.1}%")).unwrap_or_else(|| "-".to_string())
}

/// `Improving` above `+dead_band`, `Declining` below `-dead_band`,
/// otherwise (or with no prior data) `Stable`.
pub fn classify_trend(delta: Option<f64>, dead_band: f64) -> TrendDirection {
    match delta {
        Some(d) if d > dead_band => TrendDirection::Improving,
        Some(d) if d < -dead_band => TrendDirection::Declining,
        _ => TrendDirection::Stable,
    }
}

/// (passed, total) per capability. Only `PASSED` counts as a pass.
pub fn capability_counts(outcomes: &[ValidationOutcome]) -> BTreeMap<String, (u32, u32)> {
    let mut counts: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    for outcome in outcomes {
        for capability in &outcome.capabilities {
            let entry = counts.entry(capability.clone()).or_default();
            entry.1 += 1;
            if outcome.state == OutcomeState::Passed {
                entry.0 += 1;
            }
        }
    }
    counts
}

pub(crate) fn pass_rate(passed: u32, total: u32) -> Option<f64> {
    (total > 0).then(|| f64::from(passed) * 100.0 / f64::from(total))
}

/// Diff `current` against `previous`.
///
/// Candidates present in only one run are ignored for regressions and
/// fixes but still contribute to capability pass rates.
pub fn compare_runs(current: &RunSnapshot, previous: &RunSnapshot, dead_band: f64) -> ComparisonReport {
    let previous_by_hash: BTreeMap<&str, &ValidationOutcome> = previous
        .outcomes
        .iter()
        .map(|o| (o.candidate_hash.as_str(), o))
        .collect();
    let current_by_hash: BTreeMap<&str, &ValidationOutcome> = current
        .outcomes
        .iter()
        .map(|o| (o.candidate_hash.as_str(), o))
        .collect();

    let mut regressions = Vec::new();
    let mut fixes = Vec::new();
    for (hash, now) in &current_by_hash {
        let Some(before) = previous_by_hash.get(hash) else {
            continue;
        };
        let change = || StatusChange {
            candidate_hash: hash.to_string(),
            previous_run_id: previous.run_id().clone(),
            current_run_id: current.run_id().clone(),
            previous_state: before.state,
            current_state: now.state,
            capabilities: if now.capabilities.is_empty() {
                before.capabilities.clone()
            } else {
                now.capabilities.clone()
            },
        };
        if before.state.is_passing() && now.state.is_failing() {
            regressions.push(change());
        } else if before.state.is_failing() && now.state.is_passing() {
            fixes.push(change());
        }
    }

    let current_counts = capability_counts(&current.outcomes);
    let previous_counts = capability_counts(&previous.outcomes);
    let capabilities: BTreeSet<&String> = current_counts.keys().chain(previous_counts.keys()).collect();
    let trends = capabilities
        .into_iter()
        .map(|capability| {
            let (cur_passed, cur_total) = current_counts.get(capability).copied().unwrap_or_default();
            let (prev_passed, prev_total) = previous_counts.get(capability).copied().unwrap_or_default();
            let current_pass_rate = pass_rate(cur_passed, cur_total);
            let previous_pass_rate = pass_rate(prev_passed, prev_total);
            let delta = current_pass_rate
                .zip(previous_pass_rate)
                .map(|(c, p)| c - p);
            CapabilityTrend {
                capability: capability.clone(),
                current_pass_rate,
                previous_pass_rate,
                delta,
                direction: classify_trend(delta, dead_band),
                current_total: cur_total,
                previous_total: prev_total,
            }
        })
        .collect();

    ComparisonReport {
        current_run_id: current.run_id().clone(),
        previous_run_id: previous.run_id().clone(),
        regressions,
        fixes,
        trends,
    }
}

/// Load two sealed runs from `store`, compare them and log every change.
pub async fn compare_stored_runs(
    store: &dyn RunStore,
    current: &RunId,
    previous: &RunId,
    dead_band: f64,
) -> EngineResult<ComparisonReport> {
    let current = emuval_state::load_snapshot(store, current).await?;
    let previous = emuval_state::load_snapshot(store, previous).await?;
    let report = compare_runs(&current, &previous, dead_band);
    for change in &report.regressions {
        obs::emit_regression_detected(&change.candidate_hash, change.previous_state, change.current_state);
    }
    for change in &report.fixes {
        obs::emit_fix_detected(&change.candidate_hash, change.previous_state, change.current_state);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use emuval_state::{RunRecord, RunSettings};

    fn outcome(run: &RunId, hash: &str, state: OutcomeState, caps: &[&str]) -> ValidationOutcome {
        let mut o = ValidationOutcome::error(
            hash,
            run.clone(),
            caps.iter().map(|c| c.to_string()).collect(),
            Utc::now(),
            "x",
        );
        o.state = state;
        o.error = None;
        o
    }

    fn snapshot(entries: &[(&str, OutcomeState, &[&str])]) -> RunSnapshot {
        let mut record = RunRecord::start(RunSettings {
            concurrency: 2,
            candidate_timeout_secs: 300,
            test_timeout_secs: 60,
            emulator_version: "3.8".into(),
        });
        let mut outcomes: Vec<ValidationOutcome> = entries
            .iter()
            .map(|(h, s, c)| outcome(&record.run_id, h, *s, c))
            .collect();
        outcomes.sort_by(|a, b| a.candidate_hash.cmp(&b.candidate_hash));
        record.seal(&outcomes, false);
        RunSnapshot { record, outcomes }
    }

    #[test]
    fn test_regression_and_fix_detected() {
        let previous = snapshot(&[("c1", OutcomeState::Passed, &["s3"]), ("c2", OutcomeState::Failed, &["sqs"])]);
        let current = snapshot(&[("c1", OutcomeState::Failed, &["s3"]), ("c2", OutcomeState::Passed, &["sqs"])]);
        let report = compare_runs(&current, &previous, 2.0);

        assert_eq!(report.regressions.len(), 1);
        assert_eq!(report.regressions[0].candidate_hash, "c1");
        assert_eq!(report.regressions[0].previous_state, OutcomeState::Passed);
        assert_eq!(report.regressions[0].current_state, OutcomeState::Failed);
        assert_eq!(report.fixes.len(), 1);
        assert_eq!(report.fixes[0].candidate_hash, "c2");
        assert_eq!(report.fixes[0].previous_run_id, *previous.run_id());
    }

    #[test]
    fn test_partial_counts_as_passing_and_timeout_as_failing() {
        let previous = snapshot(&[("a", OutcomeState::Partial, &[]), ("b", OutcomeState::Timeout, &[])]);
        let current = snapshot(&[("a", OutcomeState::Error, &[]), ("b", OutcomeState::Partial, &[])]);
        let report = compare_runs(&current, &previous, 2.0);
        assert_eq!(report.regressions.len(), 1);
        assert_eq!(report.fixes.len(), 1);
    }

    #[test]
    fn test_same_side_transitions_are_ignored() {
        let previous = snapshot(&[("a", OutcomeState::Passed, &[]), ("b", OutcomeState::Failed, &[])]);
        let current = snapshot(&[("a", OutcomeState::Partial, &[]), ("b", OutcomeState::Timeout, &[])]);
        let report = compare_runs(&current, &previous, 2.0);
        assert!(report.regressions.is_empty());
        assert!(report.fixes.is_empty());
    }

    #[test]
    fn test_candidates_in_one_run_only_are_not_diffed() {
        let previous = snapshot(&[("gone", OutcomeState::Passed, &["s3"])]);
        let current = snapshot(&[("new", OutcomeState::Failed, &["s3"])]);
        let report = compare_runs(&current, &previous, 2.0);
        assert!(report.regressions.is_empty());
        assert_eq!(report.trends[0].direction, TrendDirection::Declining);
    }

    #[test]
    fn test_trend_dead_band() {
        assert_eq!(classify_trend(Some(2.0), 2.0), TrendDirection::Stable);
        assert_eq!(classify_trend(Some(-2.0), 2.0), TrendDirection::Stable);
        assert_eq!(classify_trend(Some(2.5), 2.0), TrendDirection::Improving);
        assert_eq!(classify_trend(Some(-2.5), 2.0), TrendDirection::Declining);
        assert_eq!(classify_trend(None, 2.0), TrendDirection::Stable);
    }

    #[test]
    fn test_trends_sorted_by_capability_with_rates() {
        let previous = snapshot(&[
            ("a", OutcomeState::Passed, &["sqs", "lambda"]),
            ("b", OutcomeState::Failed, &["sqs"]),
        ]);
        let current = snapshot(&[
            ("a", OutcomeState::Passed, &["sqs", "lambda"]),
            ("b", OutcomeState::Passed, &["sqs"]),
            ("c", OutcomeState::Passed, &["dynamodb"]),
        ]);
        let report = compare_runs(&current, &previous, 2.0);
        let names: Vec<&str> = report.trends.iter().map(|t| t.capability.as_str()).collect();
        assert_eq!(names, vec!["dynamodb", "lambda", "sqs"]);

        let sqs = &report.trends[2];
        assert_eq!(sqs.previous_pass_rate, Some(50.0));
        assert_eq!(sqs.current_pass_rate, Some(100.0));
        assert_eq!(sqs.direction, TrendDirection::Improving);
        assert_eq!(report.trends[0].direction, TrendDirection::Stable);
    }

    #[test]
    fn test_output_is_deterministic() {
        let previous = snapshot(&[
            ("b", OutcomeState::Passed, &["s3"]),
            ("a", OutcomeState::Passed, &["s3"]),
        ]);
        let current = snapshot(&[
            ("a", OutcomeState::Failed, &["s3"]),
            ("b", OutcomeState::Error, &["s3"]),
        ]);
        let first = serde_json::to_string(&compare_runs(&current, &previous, 2.0)).unwrap();
        let second = serde_json::to_string(&compare_runs(&current, &previous, 2.0)).unwrap();
        assert_eq!(first, second);

        let report = compare_runs(&current, &previous, 2.0);
        let hashes: Vec<&str> = report.regressions.iter().map(|r| r.candidate_hash.as_str()).collect();
        assert_eq!(hashes, vec!["a", "b"]);
        assert!(report.render_text().contains("a: PASSED -> FAILED"));
    }
}
