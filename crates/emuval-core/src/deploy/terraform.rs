//! Terraform-driven [`DeploymentTool`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use emuval_state::DeploymentResult;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::deploy::{DeployError, DeployResult, DeploymentTool};
use crate::process::{run_command, CommandOutput, CommandSpec};

const INIT_TIMEOUT: Duration = Duration::from_secs(120);
const DESTROY_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs `terraform init` + `apply` against the emulator endpoint.
#[derive(Debug, Clone)]
pub struct TerraformDeployer {
    binary: String,
    apply_timeout: Option<Duration>,
}

impl TerraformDeployer {
    pub fn new() -> Self {
        Self {
            binary: "terraform".to_string(),
            apply_timeout: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Cap a single `apply`. Without one only the candidate deadline applies.
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = Some(timeout);
        self
    }

    fn command(&self, args: &[&str], workdir: &Path, endpoint: &str) -> CommandSpec {
        let mut argv = vec![self.binary.clone()];
        argv.extend(args.iter().map(|a| a.to_string()));
        CommandSpec::new(argv)
            .cwd(workdir)
            .envs(&emulator_env(endpoint))
    }

    async fn step(&self, spec: CommandSpec) -> Result<CommandOutput, String> {
        run_command(&spec).await.map_err(|e| e.to_string())
    }
}

impl Default for TerraformDeployer {
    fn default() -> Self {
        Self::new()
    }
}

/// Credentials and region the provider needs to talk to the emulator.
pub fn emulator_env(endpoint: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("AWS_ACCESS_KEY_ID".to_string(), "test".to_string()),
        ("AWS_SECRET_ACCESS_KEY".to_string(), "test".to_string()),
        ("AWS_DEFAULT_REGION".to_string(), "us-east-1".to_string()),
        ("AWS_ENDPOINT_URL".to_string(), endpoint.to_string()),
        ("TF_IN_AUTOMATION".to_string(), "1".to_string()),
    ])
}

fn resources_added_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Resources:\s+(\d+)\s+added").expect("static regex"))
}

fn error_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(?:│\s*)?Error:\s*(.+?)\s*$").expect("static regex"))
}

/// Number from the `Resources: N added` summary, if present.
pub fn parse_resources_added(output: &str) -> Option<u32> {
    resources_added_re()
        .captures(output)
        .and_then(|c| c[1].parse().ok())
}

/// `Error:` lines from terraform diagnostics, in order.
pub fn parse_errors(output: &str) -> Vec<String> {
    error_line_re()
        .captures_iter(output)
        .map(|c| c[1].to_string())
        .collect()
}

/// Flatten `terraform output -json` into name -> value.
pub fn parse_outputs(json: &str) -> Result<BTreeMap<String, serde_json::Value>, serde_json::Error> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|(name, entry)| {
            let value = entry.get("value").cloned().unwrap_or(entry);
            (name, value)
        })
        .collect())
}

fn failure(stage: &str, out: &CommandOutput, log: String) -> DeploymentResult {
    let mut errors = parse_errors(&out.stdout);
    errors.extend(parse_errors(&out.stderr));
    if errors.is_empty() {
        errors.push(format!("{stage} exited with code {}", out.exit_code));
    }
    DeploymentResult {
        success: false,
        resources_created: parse_resources_added(&out.stdout).unwrap_or(0),
        outputs: BTreeMap::new(),
        errors,
        log,
    }
}

#[async_trait]
impl DeploymentTool for TerraformDeployer {
    async fn apply(&self, endpoint: &str, workdir: &Path) -> DeploymentResult {
        let init = self
            .command(&["init", "-input=false", "-no-color"], workdir, endpoint)
            .timeout(INIT_TIMEOUT);
        let out = match self.step(init).await {
            Ok(out) => out,
            Err(e) => return DeploymentResult::failed(format!("init: {e}")),
        };
        let mut log = format!("== init ==\n{}\n", out.combined());
        if !out.success() {
            warn!(workdir = %workdir.display(), exit_code = out.exit_code, "terraform init failed");
            return failure("init", &out, log);
        }

        let mut apply = self.command(
            &["apply", "-auto-approve", "-input=false", "-no-color"],
            workdir,
            endpoint,
        );
        if let Some(limit) = self.apply_timeout {
            apply = apply.timeout(limit);
        }
        let out = match self.step(apply).await {
            Ok(out) => out,
            Err(e) => {
                log.push_str(&format!("== apply ==\n{e}\n"));
                let mut result = DeploymentResult::failed(log);
                result.errors = vec![e];
                return result;
            }
        };
        log.push_str(&format!("== apply ==\n{}\n", out.combined()));
        if !out.success() {
            warn!(workdir = %workdir.display(), exit_code = out.exit_code, "terraform apply failed");
            return failure("apply", &out, log);
        }

        let resources_created = parse_resources_added(&out.stdout).unwrap_or(0);
        let output_cmd = self
            .command(&["output", "-json", "-no-color"], workdir, endpoint)
            .timeout(INIT_TIMEOUT);
        let outputs = match self.step(output_cmd).await {
            Ok(o) if o.success() => match parse_outputs(&o.stdout) {
                Ok(outputs) => outputs,
                Err(e) => {
                    // Outputs feed the harness; an unparseable set means the
                    // deployment cannot be trusted as complete.
                    let mut result = DeploymentResult::failed(log);
                    result.resources_created = resources_created;
                    result.errors = vec![format!("unparseable outputs: {e}")];
                    return result;
                }
            },
            Ok(o) => {
                debug!(exit_code = o.exit_code, "terraform output unavailable");
                BTreeMap::new()
            }
            Err(e) => {
                debug!(error = %e, "terraform output unavailable");
                BTreeMap::new()
            }
        };

        info!(workdir = %workdir.display(), resources_created, outputs = outputs.len(), "terraform apply succeeded");
        DeploymentResult {
            success: true,
            resources_created,
            outputs,
            errors: Vec::new(),
            log,
        }
    }

    async fn destroy(&self, endpoint: &str, workdir: &Path) -> DeployResult<()> {
        let spec = self
            .command(
                &["destroy", "-auto-approve", "-input=false", "-no-color"],
                workdir,
                endpoint,
            )
            .timeout(DESTROY_TIMEOUT);
        let out = run_command(&spec).await?;
        if !out.success() {
            return Err(DeployError::StepFailed {
                step: "destroy".to_string(),
                exit_code: out.exit_code,
                detail: parse_errors(&out.stderr).join("; "),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resources_added_parsed_from_summary() {
        let out = "aws_s3_bucket.b: Creation complete\n\nApply complete! Resources: 3 added, 0 changed, 0 destroyed.\n";
        assert_eq!(parse_resources_added(out), Some(3));
        assert_eq!(parse_resources_added("nothing here"), None);
    }

    #[test]
    fn test_error_lines_extracted_with_box_drawing() {
        let out = "│ Error: creating S3 Bucket: InvalidBucketName\n│\nError: second problem\n";
        assert_eq!(
            parse_errors(out),
            vec!["creating S3 Bucket: InvalidBucketName", "second problem"]
        );
    }

    #[test]
    fn test_outputs_are_unwrapped() {
        let json = r#"{"queue_url":{"sensitive":false,"type":"string","value":"http://q"},"n":{"value":2}}"#;
        let outputs = parse_outputs(json).unwrap();
        assert_eq!(outputs["queue_url"], serde_json::json!("http://q"));
        assert_eq!(outputs["n"], serde_json::json!(2));
    }

    #[test]
    fn test_malformed_outputs_are_an_error() {
        assert!(parse_outputs("not json").is_err());
    }

    #[test]
    fn test_emulator_env_points_at_endpoint() {
        let env = emulator_env("http://localhost:5100");
        assert_eq!(env["AWS_ENDPOINT_URL"], "http://localhost:5100");
        assert_eq!(env["AWS_ACCESS_KEY_ID"], "test");
    }

    #[tokio::test]
    async fn test_missing_binary_yields_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = TerraformDeployer::new().with_binary("emuval-no-such-terraform");
        let result = deployer.apply("http://localhost:5100", dir.path()).await;
        assert!(!result.success);
        assert!(result.log.contains("init"));
    }
}
