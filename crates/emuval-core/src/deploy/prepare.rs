//! Per-candidate working directory preparation.
//!
//! Definitions harvested from the wild rarely deploy cleanly against an
//! emulator as written. Before `apply` the working directory gets the
//! candidate and harness files plus a few mechanical fixes:
//!
//! - AWS provider constraints are lifted to `>= 5.31` so current Lambda
//!   runtimes pass provider validation
//! - credential profile references are dropped
//! - resources of services the community emulator lacks are removed
//! - `version` pins inside `module` blocks are relaxed
//! - a provider override points every supported endpoint at the emulator
//! - required variables get stub values and missing handler sources get
//!   stub files

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::candidate::{Candidate, TestHarness};

/// Name of the generated provider override.
pub const PROVIDER_OVERRIDE_FILE: &str = "emuval_provider_override.tf";
pub const TFVARS_FILE: &str = "terraform.tfvars";

/// Service endpoints understood by both the provider and the emulator.
const SUPPORTED_ENDPOINTS: &[&str] = &[
    "acm", "apigateway", "appconfig", "applicationautoscaling", "autoscaling", "cloudformation",
    "cloudfront", "cloudtrail", "cloudwatch", "codebuild", "codecommit", "codepipeline",
    "dynamodb", "ec2", "ecr", "ecs", "efs", "eks", "elasticsearch", "elb", "elbv2", "events",
    "firehose", "iam", "kinesis", "kms", "lambda", "logs", "opensearch", "organizations",
    "route53", "route53resolver", "s3", "s3control", "secretsmanager", "servicediscovery", "ses",
    "sesv2", "sfn", "sns", "sqs", "ssm", "sts", "swf", "wafv2",
];

/// Resource type prefixes of services only the commercial emulator edition
/// implements. Matching `resource` and `data` blocks are removed.
const UNSUPPORTED_RESOURCE_PREFIXES: &[&str] = &[
    "aws_bedrockagent_",
    "aws_bedrock_",
    "aws_appsync_",
    "aws_athena_",
    "aws_cognito_",
    "aws_elasticache_",
    "aws_emr_",
    "aws_glue_",
    "aws_iot_",
    "aws_mediastore_",
    "aws_mq_",
    "aws_neptune_",
    "aws_qldb_",
    "aws_redshift_",
    "aws_transfer_",
    "aws_xray_",
];

/// Lowest AWS provider release that accepts current Lambda runtimes.
const MIN_PROVIDER_CONSTRAINT: &str = ">= 5.31";

const JS_STUB: &str =
    "exports.handler = async (event) => { return { statusCode: 200, body: \"stub\" }; };\n";
const PY_STUB: &str = "def handler(event, context):\n    return {\"statusCode\": 200, \"body\": \"stub\"}\n";
const TS_STUB: &str =
    "export const handler = async (event: any) => { return { statusCode: 200, body: \"stub\" }; };\n";

/// What preparation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedWorkspace {
    pub root: PathBuf,
    /// Variables that received stub values.
    pub stubbed_variables: Vec<String>,
    /// Handler sources created because the definition referenced them.
    pub stubbed_sources: Vec<String>,
    /// `<kind>.<type>.<name>` of blocks removed as unsupported.
    pub removed_blocks: Vec<String>,
}

fn credential_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^\s*(profile|shared_credentials_file)\s*=\s*"[^"]*"\s*$|^\s*shared_config_files\s*=\s*\[[^\]]*\]\s*$"#,
        )
        .expect("static regex")
    })
}

fn provider_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\b(version\s*=\s*")[~>= ]*[45]\.[0-9]+(?:\.[0-9]+)?(")"#).expect("static regex")
    })
}

fn unsupported_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let prefixes = UNSUPPORTED_RESOURCE_PREFIXES.join("|");
        Regex::new(&format!(
            r#"(?s)\b(resource|data)\s+"((?:{prefixes})[^"]*)"\s+"([^"]+)"\s*\{{[^{{}}]*(?:\{{[^{{}}]*\}}[^{{}}]*)*\}}"#
        ))
        .expect("static regex")
    })
}

fn module_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)\bmodule\s+"[^"]+"\s*\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}"#)
            .expect("static regex")
    })
}

fn module_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\n[ \t]*version\s*=\s*"[^"]*""#).expect("static regex"))
}

fn variable_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)variable\s+"([^"]+)"\s*\{([^}]*(?:\{[^}]*\}[^}]*)*)\}"#)
            .expect("static regex")
    })
}

fn default_attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bdefault\s*=").expect("static regex"))
}

fn type_attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\btype\s*=\s*(\w+)").expect("static regex"))
}

fn tfvars_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(\w+)\s*=").expect("static regex"))
}

fn source_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(source_file|source_dir)\s*=\s*"(?:\$\{path\.module\}/)?([^"$]+)""#)
            .expect("static regex")
    })
}

/// Write candidate and harness files into `root` and apply the fixes.
pub fn prepare_workspace(
    root: &Path,
    candidate: &Candidate,
    harness: Option<&TestHarness>,
    endpoint: &str,
) -> std::io::Result<PreparedWorkspace> {
    let mut definitions = BTreeMap::new();
    let mut removed_blocks = Vec::new();
    for (name, content) in candidate.files() {
        let normalized = normalize_provider_versions(content);
        let without_credentials = strip_credential_references(&normalized);
        let (supported, removed) = remove_unsupported_blocks(&without_credentials);
        let cleaned = relax_module_versions(&supported);
        write_relative(root, name, &cleaned)?;
        definitions.insert(name.clone(), cleaned);
        removed_blocks.extend(removed);
    }
    if let Some(harness) = harness {
        for (name, content) in &harness.files {
            write_relative(root, name, content)?;
        }
    }

    fs::write(root.join(PROVIDER_OVERRIDE_FILE), provider_override(endpoint))?;

    let tfvars_path = root.join(TFVARS_FILE);
    let existing_tfvars = fs::read_to_string(&tfvars_path).unwrap_or_default();
    let stubs = missing_variable_stubs(definitions.values().map(String::as_str), &existing_tfvars);
    if !stubs.is_empty() {
        let mut tfvars = existing_tfvars;
        if !tfvars.is_empty() && !tfvars.ends_with('\n') {
            tfvars.push('\n');
        }
        tfvars.push_str("# stub values for required variables\n");
        for (name, value) in &stubs {
            tfvars.push_str(&format!("{name} = {value}\n"));
        }
        fs::write(&tfvars_path, tfvars)?;
    }

    let mut stubbed_sources = Vec::new();
    for content in definitions.values() {
        stubbed_sources.extend(create_stub_sources(root, content)?);
    }

    let prepared = PreparedWorkspace {
        root: root.to_path_buf(),
        stubbed_variables: stubs.into_keys().collect(),
        stubbed_sources,
        removed_blocks,
    };
    debug!(
        root = %root.display(),
        stubbed_variables = prepared.stubbed_variables.len(),
        stubbed_sources = prepared.stubbed_sources.len(),
        removed_blocks = prepared.removed_blocks.len(),
        "workspace prepared"
    );
    Ok(prepared)
}

/// Raise AWS provider 4.x and 5.x constraints to [`MIN_PROVIDER_CONSTRAINT`].
pub fn normalize_provider_versions(content: &str) -> String {
    provider_version_re()
        .replace_all(content, format!("${{1}}{MIN_PROVIDER_CONSTRAINT}${{2}}").as_str())
        .into_owned()
}

/// Remove `resource` and `data` blocks of unsupported services.
///
/// Returns the rewritten text and `<kind>.<type>.<name>` for each removed
/// block. Only one level of nested braces is recognized.
pub fn remove_unsupported_blocks(content: &str) -> (String, Vec<String>) {
    let mut removed = Vec::new();
    let rewritten = unsupported_block_re().replace_all(content, |caps: &regex::Captures<'_>| {
        removed.push(format!("{}.{}.{}", &caps[1], &caps[2], &caps[3]));
        format!("# {} {}.{} removed: not available in the emulator", &caps[1], &caps[2], &caps[3])
    });
    (rewritten.into_owned(), removed)
}

/// Strip `version` pins from `module` blocks. Provider requirements are untouched.
pub fn relax_module_versions(content: &str) -> String {
    module_block_re()
        .replace_all(content, |caps: &regex::Captures<'_>| {
            module_version_re().replace_all(&caps[0], "").into_owned()
        })
        .into_owned()
}

/// Drop `profile`, `shared_credentials_file` and `shared_config_files`
/// lines so the provider reads credentials from the environment.
pub fn strip_credential_references(content: &str) -> String {
    let mut out: String = content
        .lines()
        .filter(|line| !credential_line_re().is_match(line))
        .collect::<Vec<_>>()
        .join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Provider block routing every supported endpoint to `endpoint`.
pub fn provider_override(endpoint: &str) -> String {
    let endpoints = SUPPORTED_ENDPOINTS
        .iter()
        .map(|svc| format!("    {svc} = \"{endpoint}\""))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"provider "aws" {{
  access_key                  = "test"
  secret_key                  = "test"
  region                      = "us-east-1"
  s3_use_path_style           = true
  skip_credentials_validation = true
  skip_metadata_api_check     = true
  skip_requesting_account_id  = true

  endpoints {{
{endpoints}
  }}
}}
"#
    )
}

/// Stub values for variables without defaults that `tfvars` does not set.
pub fn missing_variable_stubs<'a>(
    definitions: impl IntoIterator<Item = &'a str>,
    tfvars: &str,
) -> BTreeMap<String, String> {
    let existing: BTreeSet<&str> = tfvars_key_re()
        .captures_iter(tfvars)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    let mut stubs = BTreeMap::new();
    for content in definitions {
        for caps in variable_block_re().captures_iter(content) {
            let name = &caps[1];
            let body = &caps[2];
            if default_attr_re().is_match(body) || existing.contains(name) {
                continue;
            }
            let var_type = type_attr_re()
                .captures(body)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
                .unwrap_or("string");
            stubs.insert(name.to_string(), stub_value(name, var_type));
        }
    }
    stubs
}

fn stub_value(name: &str, var_type: &str) -> String {
    match var_type {
        "number" => return "1".to_string(),
        "bool" => return "false".to_string(),
        "list" | "set" | "tuple" => return "[]".to_string(),
        "map" | "object" => return "{}".to_string(),
        _ => {}
    }
    let lower = name.to_ascii_lowercase();
    let value = match lower.as_str() {
        "name" | "project_name" | "app_name" | "service_name" => "emuval-test".to_string(),
        "environment" | "env" | "stage" => "test".to_string(),
        "region" | "aws_region" => "us-east-1".to_string(),
        l if l.contains("bucket") => "emuval-test-bucket".to_string(),
        l if l.contains("domain") => "example.com".to_string(),
        l if l.contains("email") => "test@example.com".to_string(),
        l if l.contains("prefix") => "emuval".to_string(),
        l if l.contains("suffix") => "test".to_string(),
        _ => format!("emuval-{name}"),
    };
    format!("\"{value}\"")
}

fn create_stub_sources(root: &Path, content: &str) -> std::io::Result<Vec<String>> {
    let mut created = Vec::new();
    for caps in source_ref_re().captures_iter(content) {
        let rel = &caps[2];
        let Some(path) = contained_path(root, rel) else {
            debug!(reference = rel, "skipping source reference outside workspace");
            continue;
        };
        if path.exists() {
            continue;
        }
        if &caps[1] == "source_dir" {
            fs::create_dir_all(&path)?;
            fs::write(path.join("index.js"), JS_STUB)?;
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let stub = match path.extension().and_then(|e| e.to_str()) {
                Some("js") => JS_STUB,
                Some("py") => PY_STUB,
                Some("ts") => TS_STUB,
                _ => "# stub\n",
            };
            fs::write(&path, stub)?;
        }
        created.push(rel.to_string());
    }
    Ok(created)
}

/// `root.join(rel)` if `rel` stays inside `root`.
fn contained_path(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    (!escapes).then(|| root.join(rel))
}

fn write_relative(root: &Path, rel: &str, content: &str) -> std::io::Result<()> {
    let path = contained_path(root, rel).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("file path escapes the workspace: {rel}"),
        )
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = r#"
provider "aws" {
  region  = "us-east-1"
  profile = "default"
}

variable "bucket_name" {
  type = string
}

variable "replicas" {
  type = number
}

variable "tags" {
  type    = map(string)
  default = {}
}

data "archive_file" "fn" {
  type        = "zip"
  source_file = "${path.module}/src/handler.py"
  output_path = "fn.zip"
}

resource "aws_s3_bucket" "b" {
  bucket = var.bucket_name
}
"#;

    fn candidate() -> Candidate {
        Candidate::new(
            BTreeMap::from([("main.tf".to_string(), DEFINITION.to_string())]),
            None,
            "local",
        )
    }

    #[test]
    fn test_profile_lines_are_removed() {
        let cleaned = strip_credential_references(DEFINITION);
        assert!(!cleaned.contains("profile"));
        assert!(cleaned.contains(r#"region  = "us-east-1""#));
    }

    #[test]
    fn test_stubs_only_for_variables_without_defaults() {
        let stubs = missing_variable_stubs([DEFINITION], "");
        assert_eq!(stubs.get("bucket_name").map(String::as_str), Some("\"emuval-test-bucket\""));
        assert_eq!(stubs.get("replicas").map(String::as_str), Some("1"));
        assert!(!stubs.contains_key("tags"));
    }

    #[test]
    fn test_existing_tfvars_are_respected() {
        let stubs = missing_variable_stubs([DEFINITION], "bucket_name = \"mine\"\n");
        assert!(!stubs.contains_key("bucket_name"));
        assert!(stubs.contains_key("replicas"));
    }

    #[test]
    fn test_override_points_at_endpoint() {
        let text = provider_override("http://localhost:5110");
        assert!(text.contains(r#"s3 = "http://localhost:5110""#));
        assert!(text.contains("skip_credentials_validation = true"));
    }

    #[test]
    fn test_prepare_writes_files_and_stubs() {
        let dir = tempfile::tempdir().unwrap();
        let harness = TestHarness::new(
            "h",
            BTreeMap::from([("test_app.py".to_string(), "def test_ok(): pass\n".to_string())]),
        );
        let prepared =
            prepare_workspace(dir.path(), &candidate(), Some(&harness), "http://localhost:5100")
                .unwrap();

        assert!(dir.path().join("main.tf").exists());
        assert!(dir.path().join("test_app.py").exists());
        assert!(dir.path().join(PROVIDER_OVERRIDE_FILE).exists());
        assert!(dir.path().join("src/handler.py").exists());
        assert_eq!(prepared.stubbed_sources, vec!["src/handler.py".to_string()]);

        let tfvars = fs::read_to_string(dir.path().join(TFVARS_FILE)).unwrap();
        assert!(tfvars.contains("replicas = 1"));
        assert_eq!(prepared.stubbed_variables, vec!["bucket_name", "replicas"]);
    }

    const LEGACY_DEFINITION: &str = r#"
terraform {
  required_providers {
    aws = {
      source  = "hashicorp/aws"
      version = "~> 4.16"
    }
  }
}

module "vpc" {
  source  = "terraform-aws-modules/vpc/aws"
  version = "5.1.2"
  tags = {
    team = "infra"
  }
}

resource "aws_db_instance" "db" {
  engine_version = "5.7"
}

resource "aws_cognito_user_pool" "pool" {
  name = "users"
  schema {
    name = "email"
  }
}

data "aws_bedrock_foundation_model" "model" {
  model_id = "anthropic.claude"
}

resource "aws_s3_bucket" "b" {
  bucket = "b"
}
"#;

    #[test]
    fn test_old_provider_constraints_are_raised() {
        let text = normalize_provider_versions(LEGACY_DEFINITION);
        assert!(text.contains(r#"version = ">= 5.31""#));
        assert!(!text.contains("~> 4.16"));
        assert!(text.contains(r#"engine_version = "5.7""#));
        assert_eq!(
            normalize_provider_versions(r#"version = "3.74""#),
            r#"version = "3.74""#
        );
    }

    #[test]
    fn test_unsupported_service_blocks_are_removed() {
        let (text, removed) = remove_unsupported_blocks(LEGACY_DEFINITION);
        assert_eq!(
            removed,
            vec![
                "resource.aws_cognito_user_pool.pool".to_string(),
                "data.aws_bedrock_foundation_model.model".to_string(),
            ]
        );
        assert!(!text.contains("model_id"));
        assert!(!text.contains(r#"name = "email""#));
        assert!(text.contains(r#"resource "aws_s3_bucket" "b""#));
        assert!(text.contains(r#"resource "aws_db_instance" "db""#));
    }

    #[test]
    fn test_module_pins_are_relaxed_but_providers_kept() {
        let text = relax_module_versions(LEGACY_DEFINITION);
        assert!(!text.contains(r#"version = "5.1.2""#));
        assert!(text.contains(r#"source  = "terraform-aws-modules/vpc/aws""#));
        assert!(text.contains(r#"team = "infra""#));
        assert!(text.contains(r#"version = "~> 4.16""#));
    }

    #[test]
    fn test_prepare_applies_every_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let candidate = Candidate::new(
            BTreeMap::from([("main.tf".to_string(), LEGACY_DEFINITION.to_string())]),
            None,
            "local",
        );
        let prepared =
            prepare_workspace(dir.path(), &candidate, None, "http://localhost:5100").unwrap();
        assert_eq!(prepared.removed_blocks.len(), 2);

        let written = fs::read_to_string(dir.path().join("main.tf")).unwrap();
        assert!(written.contains(r#"version = ">= 5.31""#));
        assert!(!written.contains("5.1.2"));
        assert!(!written.contains(r#"resource "aws_cognito_user_pool""#));
        assert!(written.contains("aws_cognito_user_pool.pool removed"));
    }

    #[test]
    fn test_paths_escaping_workspace_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_relative(dir.path(), "../evil.tf", "x").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(contained_path(dir.path(), "/etc/passwd").is_none());
    }
}
