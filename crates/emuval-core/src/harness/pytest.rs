//! pytest-backed [`HarnessRunner`].
//!
//! Tests run with `-v` so each case prints one status line, and with the
//! `pytest-timeout` plugin enforcing the per-test ceiling. A case that hit
//! the ceiling is reported `FAILED` with a `Timeout` marker in its failure
//! section; it is recorded as failed with `timed_out` set.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use emuval_state::{TestCaseResult, TestCaseStatus, TestResult};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::candidate::TestHarness;
use crate::deploy::terraform::emulator_env;
use crate::harness::{HarnessError, HarnessResult, HarnessRunner};
use crate::process::{run_command, tail_chars, CommandSpec};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const ERROR_EXCERPT_LINES: usize = 5;
const ERROR_EXCERPT_CHARS: usize = 500;

/// pytest exit code for "no tests were collected".
const EXIT_NO_TESTS: i32 = 5;

#[derive(Debug, Clone)]
pub struct PytestRunner {
    python: String,
}

impl PytestRunner {
    pub fn new() -> Self {
        Self {
            python: "python3".to_string(),
        }
    }

    pub fn with_python(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    fn env(endpoint: &str) -> BTreeMap<String, String> {
        let mut env = emulator_env(endpoint);
        env.insert("LOCALSTACK_ENDPOINT".to_string(), endpoint.to_string());
        env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
        env
    }

    async fn install(&self, manifest: &str, workdir: &Path, endpoint: &str) -> HarnessResult<()> {
        let spec = CommandSpec::new([
            self.python.as_str(),
            "-m",
            "pip",
            "install",
            "-q",
            "-r",
            manifest,
        ])
        .cwd(workdir)
        .envs(&Self::env(endpoint))
        .timeout(INSTALL_TIMEOUT);
        let out = run_command(&spec)
            .await
            .map_err(|e| HarnessError::DependencyInstall {
                detail: e.to_string(),
            })?;
        if !out.success() {
            return Err(HarnessError::DependencyInstall {
                detail: tail_chars(out.stderr.trim(), ERROR_EXCERPT_CHARS),
            });
        }
        debug!(manifest, "harness dependencies installed");
        Ok(())
    }
}

impl Default for PytestRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HarnessRunner for PytestRunner {
    async fn run(
        &self,
        endpoint: &str,
        workdir: &Path,
        harness: &TestHarness,
        per_test_timeout: Duration,
    ) -> HarnessResult<TestResult> {
        if !harness.has_entry_point() {
            return Err(HarnessError::MissingEntryPoint {
                entry_point: harness.entry_point.clone(),
            });
        }
        if let Some(manifest) = &harness.dependency_manifest {
            self.install(manifest, workdir, endpoint).await?;
        }

        let timeout_flag = format!("--timeout={}", per_test_timeout.as_secs().max(1));
        let spec = CommandSpec::new([
            self.python.as_str(),
            "-m",
            "pytest",
            harness.entry_point.as_str(),
            "-v",
            "--tb=short",
            "--durations=0",
            "-p",
            "no:cacheprovider",
            timeout_flag.as_str(),
        ])
        .cwd(workdir)
        .envs(&Self::env(endpoint));
        let out = run_command(&spec).await?;

        let cases = parse_pytest_output(&out.stdout);
        if cases.is_empty() && out.exit_code != 0 && out.exit_code != EXIT_NO_TESTS {
            warn!(exit_code = out.exit_code, "harness produced no test results");
            let detail = if out.stderr.trim().is_empty() {
                tail_chars(out.stdout.trim(), ERROR_EXCERPT_CHARS)
            } else {
                tail_chars(out.stderr.trim(), ERROR_EXCERPT_CHARS)
            };
            return Err(HarnessError::NoResults {
                exit_code: out.exit_code,
                detail,
            });
        }

        let result = TestResult::from_cases(cases, out.combined());
        info!(
            passed = result.passed,
            failed = result.failed,
            skipped = result.skipped,
            timed_out = result.timed_out_count(),
            "harness finished"
        );
        Ok(result)
    }
}

fn status_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(\S+?)::(\S+)\s+(PASSED|FAILED|SKIPPED|ERROR|XFAIL|XPASS)\b")
            .expect("static regex")
    })
}

fn section_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^_{3,}\s+(.+?)\s+_{3,}\s*$").expect("static regex"))
}

fn banner_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^={3,}").expect("static regex"))
}

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*([0-9]+(?:\.[0-9]+)?)s\s+call\s+\S+?::(\S+)\s*$").expect("static regex")
    })
}

/// Parse per-test results from verbose pytest output.
///
/// A test name appears once; the first status line wins so that a later
/// teardown `ERROR` line does not double count a test.
pub fn parse_pytest_output(output: &str) -> Vec<TestCaseResult> {
    let sections = failure_sections(output);
    let durations: BTreeMap<&str, f64> = duration_re()
        .captures_iter(output)
        .filter_map(|c| {
            let secs = c.get(1)?.as_str().parse().ok()?;
            Some((c.get(2)?.as_str(), secs))
        })
        .collect();

    let mut seen = std::collections::BTreeSet::new();
    let mut cases = Vec::new();
    for caps in status_line_re().captures_iter(output) {
        let name = caps[2].to_string();
        if !seen.insert(name.clone()) {
            continue;
        }
        let status = match &caps[3] {
            "PASSED" | "XFAIL" => TestCaseStatus::Passed,
            "FAILED" | "XPASS" => TestCaseStatus::Failed,
            "SKIPPED" => TestCaseStatus::Skipped,
            _ => TestCaseStatus::Error,
        };
        let section = sections.get(&section_key(&name)).map(String::as_str);
        let timed_out = matches!(status, TestCaseStatus::Failed | TestCaseStatus::Error)
            && section.is_some_and(|s| s.contains("Timeout"));
        let error_message = match status {
            TestCaseStatus::Failed | TestCaseStatus::Error => section.map(excerpt),
            _ => None,
        };
        cases.push(TestCaseResult {
            duration_secs: durations.get(name.as_str()).copied(),
            name,
            status: if timed_out {
                TestCaseStatus::Failed
            } else {
                status
            },
            timed_out,
            error_message,
        });
    }
    cases
}

/// Failure-section headers use `Class.test` where status lines use `Class::test`.
fn section_key(name: &str) -> String {
    name.replace("::", ".")
}

/// Map of section title to body for `____ name ____` blocks.
fn failure_sections(output: &str) -> BTreeMap<String, String> {
    let mut sections = BTreeMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    for line in output.lines() {
        if let Some(caps) = section_header_re().captures(line) {
            if let Some((title, body)) = current.take() {
                sections.insert(title, body.join("\n"));
            }
            let title = caps[1].trim_start_matches("ERROR at setup of ").to_string();
            current = Some((title, Vec::new()));
        } else if banner_re().is_match(line) {
            if let Some((title, body)) = current.take() {
                sections.insert(title, body.join("\n"));
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((title, body)) = current {
        sections.insert(title, body.join("\n"));
    }
    sections
}

fn excerpt(section: &str) -> String {
    let lines: Vec<&str> = section
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(ERROR_EXCERPT_LINES);
    lines[start..]
        .join("\n")
        .chars()
        .take(ERROR_EXCERPT_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
============================= test session starts ==============================
collected 4 items

test_app.py::test_put_object PASSED                                      [ 25%]
test_app.py::test_get_object FAILED                                      [ 50%]
test_app.py::test_slow_listing FAILED                                    [ 75%]
test_app.py::TestQueue::test_send SKIPPED (no queue)                     [100%]

=================================== FAILURES ===================================
_______________________________ test_get_object ________________________________
test_app.py:20: in test_get_object
    assert body == b\"hello\"
E   AssertionError: assert b'' == b'hello'
______________________________ test_slow_listing _______________________________
test_app.py:31: in test_slow_listing
    time.sleep(120)
E   Failed: Timeout >60.0s
============================= slowest durations ==============================
60.01s call     test_app.py::test_slow_listing
0.23s call     test_app.py::test_put_object
=========================== short test summary info ============================
FAILED test_app.py::test_get_object - AssertionError: assert b'' == b'hello'
FAILED test_app.py::test_slow_listing - Failed: Timeout >60.0s
==================== 2 failed, 1 passed, 1 skipped in 61.02s ====================
";

    #[test]
    fn test_status_lines_are_parsed() {
        let cases = parse_pytest_output(OUTPUT);
        let names: Vec<&str> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["test_put_object", "test_get_object", "test_slow_listing", "TestQueue::test_send"]
        );
        let result = TestResult::from_cases(cases, OUTPUT);
        assert_eq!((result.passed, result.failed, result.skipped), (1, 2, 1));
    }

    #[test]
    fn test_per_test_timeout_is_failed_with_marker() {
        let cases = parse_pytest_output(OUTPUT);
        let slow = cases.iter().find(|c| c.name == "test_slow_listing").unwrap();
        assert_eq!(slow.status, TestCaseStatus::Failed);
        assert!(slow.timed_out);
        let plain = cases.iter().find(|c| c.name == "test_get_object").unwrap();
        assert!(!plain.timed_out);
        assert!(plain
            .error_message
            .as_deref()
            .unwrap()
            .contains("AssertionError"));
    }

    #[test]
    fn test_durations_are_attached() {
        let cases = parse_pytest_output(OUTPUT);
        let put = cases.iter().find(|c| c.name == "test_put_object").unwrap();
        assert_eq!(put.duration_secs, Some(0.23));
        let get = cases.iter().find(|c| c.name == "test_get_object").unwrap();
        assert_eq!(get.duration_secs, None);
    }

    #[test]
    fn test_summary_lines_do_not_duplicate_cases() {
        let cases = parse_pytest_output(OUTPUT);
        assert_eq!(cases.len(), 4);
    }

    #[test]
    fn test_empty_output_yields_no_cases() {
        assert!(parse_pytest_output("collected 0 items\n").is_empty());
    }

    #[tokio::test]
    async fn test_missing_entry_point_is_a_fault() {
        let dir = tempfile::tempdir().unwrap();
        let harness = TestHarness::new("h", BTreeMap::new());
        let err = PytestRunner::new()
            .run("http://localhost:5100", dir.path(), &harness, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::MissingEntryPoint { .. }));
        assert!(!err.is_retryable());
    }
}
