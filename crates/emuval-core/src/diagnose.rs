//! Root-cause tagging for failed validations.
//!
//! Every outcome that did not pass is reduced to one failure message and
//! matched against a table of known error signatures. Matches within a run
//! are clustered so a report shows which causes account for most failures
//! and what usually fixes them. Messages no signature recognizes cluster
//! on their own leading text.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use emuval_state::{OutcomeState, RunId, RunSnapshot, TestCaseStatus, ValidationOutcome};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::process::tail_chars;

/// Samples kept per cluster.
pub const MAX_SAMPLES: usize = 5;
/// Characters kept per sample.
pub const SAMPLE_CHARS: usize = 500;
/// Leading characters that identify an unrecognized message.
const UNKNOWN_SIGNATURE_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The definition itself cannot be planned or applied.
    DefinitionConfig,
    /// The emulator rejected an API call.
    EmulatorApi,
    /// The emulator does not implement the feature.
    EmulatorFeatureGap,
    /// The feature needs a licensed emulator edition.
    EmulatorLicense,
    /// The environment was unreachable.
    Infrastructure,
    Timeout,
    /// A module or provider could not be resolved from its registry.
    Registry,
    MissingFiles,
    /// The batch was interrupted before the candidate finished.
    Interrupted,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::DefinitionConfig => "definition_config",
            ErrorCategory::EmulatorApi => "emulator_api",
            ErrorCategory::EmulatorFeatureGap => "emulator_feature_gap",
            ErrorCategory::EmulatorLicense => "emulator_license",
            ErrorCategory::Infrastructure => "infrastructure",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Registry => "registry",
            ErrorCategory::MissingFiles => "missing_files",
            ErrorCategory::Interrupted => "interrupted",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One known error signature.
#[derive(Debug)]
pub struct KnownSignature {
    /// Case-insensitive regular expression matched against the message.
    pub pattern: &'static str,
    pub category: ErrorCategory,
    pub root_cause: &'static str,
    pub suggested_fix: &'static str,
}

/// Checked in order; the first match wins.
pub const KNOWN_SIGNATURES: &[KnownSignature] = &[
    KnownSignature {
        pattern: r"missing required variable|no value for required variable",
        category: ErrorCategory::DefinitionConfig,
        root_cause: "definition requires input variables that were not provided",
        suggested_fix: "add the variables to terraform.tfvars or give them defaults",
    },
    KnownSignature {
        pattern: r"unsupported (provider )?endpoint",
        category: ErrorCategory::DefinitionConfig,
        root_cause: "provider does not recognize an endpoint name in the override",
        suggested_fix: "remove the endpoint from the provider override",
    },
    KnownSignature {
        pattern: r"failed to get shared config profile",
        category: ErrorCategory::DefinitionConfig,
        root_cause: "provider is configured with a credentials profile that does not exist",
        suggested_fix: "remove profile references from the provider block",
    },
    KnownSignature {
        pattern: r"invalid.*runtime|expected runtime to be one of",
        category: ErrorCategory::DefinitionConfig,
        root_cause: "Lambda runtime not supported by the pinned provider version",
        suggested_fix: "raise the AWS provider version or use a supported runtime",
    },
    KnownSignature {
        pattern: r"reference to undeclared resource",
        category: ErrorCategory::DefinitionConfig,
        root_cause: "definition references a resource that was removed or never declared",
        suggested_fix: "check for removed resources or missing module outputs",
    },
    KnownSignature {
        pattern: r"resourcenotfoundexception",
        category: ErrorCategory::EmulatorApi,
        root_cause: "resource was not created or was deleted before access",
        suggested_fix: "check the apply log; the resource may have failed to create",
    },
    KnownSignature {
        pattern: r"accessdeniedexception",
        category: ErrorCategory::EmulatorApi,
        root_cause: "IAM permissions are not configured as the harness expects",
        suggested_fix: "verify role and policy attachments in the definition",
    },
    KnownSignature {
        pattern: r"validationexception",
        category: ErrorCategory::EmulatorApi,
        root_cause: "API request carried an invalid parameter or configuration",
        suggested_fix: "check request parameters against the service API",
    },
    KnownSignature {
        pattern: r"not implemented|notimplementederror",
        category: ErrorCategory::EmulatorFeatureGap,
        root_cause: "feature is not implemented by the emulator",
        suggested_fix: "check the emulator coverage for this service operation",
    },
    KnownSignature {
        pattern: r"connection refused|econnrefused",
        category: ErrorCategory::Infrastructure,
        root_cause: "emulator container was not running or not ready",
        suggested_fix: "raise the health check timeout and inspect the emulator log",
    },
    KnownSignature {
        pattern: r"timed? ?out|deadline exceeded|exceeded \d+s deadline",
        category: ErrorCategory::Timeout,
        root_cause: "an operation did not complete in time",
        suggested_fix: "raise the timeout or check for a hanging resource creation",
    },
    KnownSignature {
        pattern: r"module.*not found|no available releases",
        category: ErrorCategory::Registry,
        root_cause: "module or provider release is not available in the registry",
        suggested_fix: "check the module source and its version constraint",
    },
    KnownSignature {
        pattern: r"backend.*initialization|backend configuration",
        category: ErrorCategory::DefinitionConfig,
        root_cause: "remote state backend is not reachable from the test environment",
        suggested_fix: "remove the backend configuration for local validation",
    },
    KnownSignature {
        pattern: r"archive.*missing|source.*not found",
        category: ErrorCategory::MissingFiles,
        root_cause: "source files for a function or archive were not found",
        suggested_fix: "provide the sources or let preparation stub them",
    },
    KnownSignature {
        pattern: r"circular dependency|cycle:",
        category: ErrorCategory::DefinitionConfig,
        root_cause: "resources depend on each other in a cycle",
        suggested_fix: "review resource dependencies and explicit depends_on",
    },
    KnownSignature {
        pattern: r"\bpro\b.*(required|feature)|license.*plan",
        category: ErrorCategory::EmulatorLicense,
        root_cause: "feature requires a licensed emulator edition",
        suggested_fix: "remove resources of services the community edition lacks",
    },
    KnownSignature {
        pattern: r"validation aborted|aborted before start",
        category: ErrorCategory::Interrupted,
        root_cause: "batch was interrupted before the candidate finished",
        suggested_fix: "validate the candidate again",
    },
];

fn compiled_signatures() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        KNOWN_SIGNATURES
            .iter()
            .map(|s| Regex::new(&format!("(?i){}", s.pattern)).expect("static regex"))
            .collect()
    })
}

/// Root cause assigned to one failure message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub category: ErrorCategory,
    /// Known pattern, or the leading text of an unrecognized message.
    pub signature: String,
    pub root_cause: Option<String>,
    pub suggested_fix: Option<String>,
}

impl Diagnosis {
    /// Stable identifier for the signature.
    pub fn cluster_id(&self) -> String {
        let digest = Sha256::digest(self.signature.as_bytes());
        hex::encode(digest)[..12].to_string()
    }
}

/// Match `message` against the known signatures. `None` for blank input.
pub fn diagnose_message(message: &str) -> Option<Diagnosis> {
    let message = message.trim();
    if message.is_empty() {
        return None;
    }
    let matched = KNOWN_SIGNATURES
        .iter()
        .zip(compiled_signatures())
        .find(|(_, re)| re.is_match(message));
    Some(match matched {
        Some((known, _)) => Diagnosis {
            category: known.category,
            signature: known.pattern.to_string(),
            root_cause: Some(known.root_cause.to_string()),
            suggested_fix: Some(known.suggested_fix.to_string()),
        },
        None => Diagnosis {
            category: ErrorCategory::Unknown,
            signature: message
                .to_lowercase()
                .chars()
                .take(UNKNOWN_SIGNATURE_CHARS)
                .collect::<String>()
                .trim()
                .to_string(),
            root_cause: None,
            suggested_fix: None,
        },
    })
}

/// The most specific failure message recorded on `outcome`.
///
/// Preference: the outcome error, deployment errors, the first failing
/// test, then the tails of the deployment and environment logs.
pub fn failure_message(outcome: &ValidationOutcome) -> Option<String> {
    if let Some(error) = outcome.error.as_deref().filter(|e| !e.trim().is_empty()) {
        return Some(error.to_string());
    }
    if let Some(deployment) = &outcome.deployment {
        if !deployment.errors.is_empty() {
            return Some(deployment.errors.join("\n"));
        }
    }
    if let Some(tests) = &outcome.tests {
        let failing = tests.cases.iter().find(|c| {
            matches!(c.status, TestCaseStatus::Failed | TestCaseStatus::Error)
                && c.error_message.is_some()
        });
        if let Some(message) = failing.and_then(|c| c.error_message.clone()) {
            return Some(message);
        }
    }
    let deploy_log = outcome.deployment.as_ref().map(|d| d.log.as_str()).unwrap_or("");
    [deploy_log, outcome.logs.as_str()]
        .into_iter()
        .find(|log| !log.trim().is_empty())
        .map(|log| tail_chars(log, SAMPLE_CHARS))
}

/// Diagnosis attached to one non-passing outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeDiagnosis {
    pub candidate_hash: String,
    pub state: OutcomeState,
    pub cluster_id: String,
    pub category: ErrorCategory,
}

/// Failures sharing one signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCluster {
    pub cluster_id: String,
    pub category: ErrorCategory,
    pub signature: String,
    pub root_cause: Option<String>,
    pub suggested_fix: Option<String>,
    pub occurrences: u32,
    /// Sorted candidate hashes.
    pub candidates: Vec<String>,
    /// Sorted union of the candidates' capabilities.
    pub capabilities: Vec<String>,
    /// Up to [`MAX_SAMPLES`] distinct messages, each capped at [`SAMPLE_CHARS`].
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub run_id: RunId,
    /// Non-passing outcomes in the run.
    pub failing: u32,
    /// Failing outcomes with no recorded message to diagnose.
    pub undiagnosed: Vec<String>,
    pub outcomes: Vec<OutcomeDiagnosis>,
    /// Most frequent first, ties by cluster id.
    pub clusters: Vec<ErrorCluster>,
    /// Occurrences per category.
    pub by_category: BTreeMap<ErrorCategory, u32>,
}

impl DiagnosisReport {
    pub fn render_text(&self) -> String {
        let mut out = format!("Diagnosis for run {}: {} failing outcome(s)\n", self.run_id, self.failing);
        if self.clusters.is_empty() {
            out.push_str("  nothing to diagnose\n");
            return out;
        }
        for (category, count) in &self.by_category {
            out.push_str(&format!("  {:<22} {count}\n", category.as_str()));
        }
        for cluster in &self.clusters {
            out.push_str(&format!(
                "\n[{}] {} x{}  {}\n",
                cluster.cluster_id,
                cluster.category,
                cluster.occurrences,
                cluster.candidates.join(",")
            ));
            if let Some(cause) = &cluster.root_cause {
                out.push_str(&format!("  cause: {cause}\n"));
            }
            if let Some(fix) = &cluster.suggested_fix {
                out.push_str(&format!("  fix:   {fix}\n"));
            }
            if let Some(sample) = cluster.samples.first() {
                let first_line = sample.lines().next().unwrap_or_default();
                out.push_str(&format!("  e.g.   {first_line}\n"));
            }
        }
        if !self.undiagnosed.is_empty() {
            out.push_str(&format!("\nNo failure message: {}\n", self.undiagnosed.join(",")));
        }
        out
    }
}

/// Diagnose every non-passing outcome of `run` and cluster the results.
pub fn diagnose_run(run: &RunSnapshot) -> DiagnosisReport {
    let mut clusters: BTreeMap<String, ErrorCluster> = BTreeMap::new();
    let mut capabilities: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut outcomes = Vec::new();
    let mut undiagnosed = Vec::new();
    let mut failing = 0;

    for outcome in run.outcomes.iter().filter(|o| o.state != OutcomeState::Passed) {
        failing += 1;
        let Some(message) = failure_message(outcome) else {
            undiagnosed.push(outcome.candidate_hash.clone());
            continue;
        };
        let Some(diagnosis) = diagnose_message(&message) else {
            undiagnosed.push(outcome.candidate_hash.clone());
            continue;
        };
        let cluster_id = diagnosis.cluster_id();
        let cluster = clusters.entry(cluster_id.clone()).or_insert_with(|| ErrorCluster {
            cluster_id: cluster_id.clone(),
            category: diagnosis.category,
            signature: diagnosis.signature.clone(),
            root_cause: diagnosis.root_cause.clone(),
            suggested_fix: diagnosis.suggested_fix.clone(),
            occurrences: 0,
            candidates: Vec::new(),
            capabilities: Vec::new(),
            samples: Vec::new(),
        });
        cluster.occurrences += 1;
        cluster.candidates.push(outcome.candidate_hash.clone());
        let sample: String = message.chars().take(SAMPLE_CHARS).collect();
        if cluster.samples.len() < MAX_SAMPLES && !cluster.samples.contains(&sample) {
            cluster.samples.push(sample);
        }
        capabilities
            .entry(cluster_id.clone())
            .or_default()
            .extend(outcome.capabilities.iter().cloned());

        outcomes.push(OutcomeDiagnosis {
            candidate_hash: outcome.candidate_hash.clone(),
            state: outcome.state,
            cluster_id,
            category: diagnosis.category,
        });
    }

    let mut clusters: Vec<ErrorCluster> = clusters
        .into_values()
        .map(|mut c| {
            c.candidates.sort();
            c.capabilities = capabilities
                .remove(&c.cluster_id)
                .unwrap_or_default()
                .into_iter()
                .collect();
            c
        })
        .collect();
    clusters.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });

    let mut by_category = BTreeMap::new();
    for cluster in &clusters {
        *by_category.entry(cluster.category).or_insert(0) += cluster.occurrences;
    }

    debug!(
        run_id = %run.run_id(),
        failing,
        clusters = clusters.len(),
        undiagnosed = undiagnosed.len(),
        "run diagnosed"
    );
    DiagnosisReport {
        run_id: run.run_id().clone(),
        failing,
        undiagnosed,
        outcomes,
        clusters,
        by_category,
    }
}
