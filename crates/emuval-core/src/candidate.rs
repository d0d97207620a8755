//! Candidates and their test harnesses.
//!
//! A [`Candidate`] is content-addressed: its hash is a pure function of the
//! normalized definition files, so the same infrastructure discovered from
//! two different sources shares one identity.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the hex hash prefix used as the candidate identifier.
pub const CANDIDATE_HASH_LEN: usize = 16;

/// An immutable infrastructure definition under validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    hash: String,
    /// Optional human-readable name.
    pub name: Option<String>,
    /// Where the definition was discovered.
    pub source_ref: String,
    /// Definition files by file name.
    files: BTreeMap<String, String>,
    capabilities: Vec<String>,
    resource_count: usize,
}

impl Candidate {
    /// Build a candidate from its definition files.
    ///
    /// When `capabilities` is `None` they are inferred from resource types.
    pub fn new(
        files: BTreeMap<String, String>,
        capabilities: Option<Vec<String>>,
        source_ref: impl Into<String>,
    ) -> Self {
        let hash = compute_candidate_hash(&files);
        let resource_count = files.values().map(|c| count_resources(c)).sum();
        let capabilities = match capabilities {
            Some(explicit) => sorted_unique(explicit),
            None => infer_capabilities(files.values().map(String::as_str)),
        };
        Self {
            hash,
            name: None,
            source_ref: source_ref.into(),
            files,
            capabilities,
            resource_count,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn short_hash(&self) -> &str {
        &self.hash[..8.min(self.hash.len())]
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    /// Capability names, sorted and deduplicated.
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn resource_count(&self) -> usize {
        self.resource_count
    }

    /// Name if known, else the short hash.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.short_hash())
    }
}

/// Executable test package bound to exactly one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestHarness {
    pub candidate_hash: String,
    /// Files by path relative to the working directory.
    pub files: BTreeMap<String, String>,
    /// Test file handed to the runner.
    pub entry_point: String,
    /// Dependency manifest installed before running, if any.
    pub dependency_manifest: Option<String>,
}

impl TestHarness {
    pub const DEFAULT_ENTRY_POINT: &'static str = "test_app.py";
    pub const DEFAULT_MANIFEST: &'static str = "requirements.txt";

    /// Build a harness using the conventional layout.
    pub fn new(candidate_hash: impl Into<String>, files: BTreeMap<String, String>) -> Self {
        let dependency_manifest = files
            .contains_key(Self::DEFAULT_MANIFEST)
            .then(|| Self::DEFAULT_MANIFEST.to_string());
        Self {
            candidate_hash: candidate_hash.into(),
            files,
            entry_point: Self::DEFAULT_ENTRY_POINT.to_string(),
            dependency_manifest,
        }
    }

    pub fn has_entry_point(&self) -> bool {
        self.files.contains_key(&self.entry_point)
    }
}

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(#|//).*$").expect("static regex"))
}

fn resource_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^\s*resource\s+"([A-Za-z0-9_]+)"\s+"[^"]+""#).expect("static regex")
    })
}

/// Normalize definition text for hashing.
///
/// Strips `#` and `//` comments, drops blank lines and collapses runs of
/// whitespace inside each line.
pub fn normalize_definition(content: &str) -> String {
    content
        .lines()
        .map(|line| comment_re().replace(line, ""))
        .filter_map(|line| {
            let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
            (!collapsed.is_empty()).then_some(collapsed)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Content hash over files sorted by name.
pub fn compute_candidate_hash(files: &BTreeMap<String, String>) -> String {
    let combined = files
        .iter()
        .map(|(name, content)| format!("# {}\n{}", name, normalize_definition(content)))
        .collect::<Vec<_>>()
        .join("\n");
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let full = hex::encode(hasher.finalize());
    full[..CANDIDATE_HASH_LEN].to_string()
}

/// Count `resource "<type>" "<name>"` blocks.
pub fn count_resources(content: &str) -> usize {
    resource_re().captures_iter(content).count()
}

/// Infer capabilities from `aws_<service>_*` resource types.
pub fn infer_capabilities<'a>(contents: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut found = BTreeSet::new();
    for content in contents {
        for caps in resource_re().captures_iter(content) {
            let resource_type = &caps[1];
            if let Some(rest) = resource_type.strip_prefix("aws_") {
                if let Some(service) = rest.split('_').next().filter(|s| !s.is_empty()) {
                    found.insert(service.to_string());
                }
            }
        }
    }
    found.into_iter().collect()
}

fn sorted_unique(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const MAIN_TF: &str = r#"
# storage for uploads
resource "aws_s3_bucket" "uploads" {
  bucket   =   "uploads"   // inline
}

resource "aws_lambda_function" "resize" {
  function_name = "resize"
}
"#;

    #[test]
    fn test_normalize_strips_comments_and_blank_lines() {
        let normalized = normalize_definition(MAIN_TF);
        assert!(!normalized.contains('#'));
        assert!(!normalized.contains("//"));
        assert!(!normalized.lines().any(|l| l.trim().is_empty()));
        assert!(normalized.contains(r#"bucket = "uploads""#));
    }

    #[test]
    fn test_hash_ignores_formatting_noise() {
        let a = files(&[("main.tf", MAIN_TF)]);
        let reformatted = MAIN_TF.replace("  bucket", "\tbucket").replace("\n\n", "\n\n\n");
        let b = files(&[("main.tf", &reformatted)]);
        assert_eq!(compute_candidate_hash(&a), compute_candidate_hash(&b));
    }

    #[test]
    fn test_hash_is_sensitive_to_file_names_and_content() {
        let a = files(&[("main.tf", MAIN_TF)]);
        let b = files(&[("other.tf", MAIN_TF)]);
        let c = files(&[("main.tf", "resource \"aws_sqs_queue\" \"q\" {}")]);
        assert_ne!(compute_candidate_hash(&a), compute_candidate_hash(&b));
        assert_ne!(compute_candidate_hash(&a), compute_candidate_hash(&c));
        assert_eq!(compute_candidate_hash(&a).len(), CANDIDATE_HASH_LEN);
    }

    #[test]
    fn test_same_content_same_identity_regardless_of_source() {
        let a = Candidate::new(files(&[("main.tf", MAIN_TF)]), None, "github:org/a");
        let b = Candidate::new(files(&[("main.tf", MAIN_TF)]), None, "registry:mod/b");
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_capabilities_inferred_and_resources_counted() {
        let c = Candidate::new(files(&[("main.tf", MAIN_TF)]), None, "local");
        assert_eq!(c.capabilities(), &["lambda".to_string(), "s3".to_string()]);
        assert_eq!(c.resource_count(), 2);
    }

    #[test]
    fn test_explicit_capabilities_are_normalized() {
        let c = Candidate::new(
            files(&[("main.tf", MAIN_TF)]),
            Some(vec!["SQS".to_string(), "s3".to_string(), "sqs".to_string()]),
            "local",
        );
        assert_eq!(c.capabilities(), &["s3".to_string(), "sqs".to_string()]);
    }

    #[test]
    fn test_harness_detects_manifest() {
        let h = TestHarness::new(
            "abcd",
            files(&[("test_app.py", "def test_x(): pass"), ("requirements.txt", "boto3")]),
        );
        assert!(h.has_entry_point());
        assert_eq!(h.dependency_manifest.as_deref(), Some("requirements.txt"));
    }
}
