//! Container-runtime backed emulator provider.
//!
//! Shells out to the `docker` CLI through [`run_command`] and probes
//! readiness over HTTP. Instances carry the managed/run labels so stale
//! ones from an interrupted batch can be found later.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::environment::error::{EnvResult, EnvironmentError};
use crate::environment::manager::MANAGED_LABEL;
use crate::environment::provider::{EnvironmentProvider, LaunchSpec};
use crate::process::{run_command, CommandSpec};

/// Port the emulator listens on inside the container.
pub const EDGE_PORT: u16 = 4566;

const HEALTH_PATH: &str = "/_localstack/health";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CLI_TIMEOUT: Duration = Duration::from_secs(120);

/// Services every deployment needs regardless of what the candidate uses.
const BASELINE_SERVICES: [&str; 2] = ["iam", "sts"];

/// Services that are routinely exercised alongside another one.
fn companions(service: &str) -> &'static [&'static str] {
    match service {
        "cloudwatch" => &["events", "logs"],
        "lambda" => &["logs"],
        "apigateway" => &["apigatewayv2"],
        "s3" => &["s3control"],
        _ => &[],
    }
}

/// Comma-separated service list to enable for `capabilities`.
pub fn services_for(capabilities: &[String]) -> String {
    let mut services: BTreeSet<&str> = BASELINE_SERVICES.into_iter().collect();
    for cap in capabilities {
        services.insert(cap.as_str());
        services.extend(companions(cap));
    }
    services.into_iter().collect::<Vec<_>>().join(",")
}

pub struct DockerEmulator {
    binary: String,
    http: reqwest::Client,
}

impl DockerEmulator {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Use a specific container CLI (e.g. `podman`).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            http: reqwest::Client::new(),
        }
    }

    fn cli<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![self.binary.clone()];
        argv.extend(args.into_iter().map(Into::into));
        CommandSpec::new(argv).timeout(CLI_TIMEOUT)
    }

    fn run_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.instance_name.clone(),
            "-p".to_string(),
            format!("{}:{}", spec.resources.edge_port, EDGE_PORT),
            "-e".to_string(),
            format!("SERVICES={}", services_for(&spec.capabilities)),
            "-e".to_string(),
            "DEBUG=0".to_string(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(format!("{}:{}", spec.image, spec.version));
        args
    }
}

impl Default for DockerEmulator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnvironmentProvider for DockerEmulator {
    async fn launch(&self, spec: &LaunchSpec) -> EnvResult<()> {
        let out = run_command(&self.cli(Self::run_args(spec)))
            .await
            .map_err(|e| EnvironmentError::Provider(e.to_string()))?;
        if !out.success() {
            return Err(EnvironmentError::Provider(format!(
                "{} run exited with {}: {}",
                self.binary,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        info!(instance = %spec.instance_name, port = spec.resources.edge_port, "emulator container started");
        Ok(())
    }

    async fn is_ready(&self, spec: &LaunchSpec) -> bool {
        let url = format!("{}{}", spec.endpoint(), HEALTH_PATH);
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(%url, error = %e, "health probe failed");
                false
            }
        }
    }

    async fn stop(&self, instance_name: &str) -> EnvResult<()> {
        let out = run_command(&self.cli(["rm", "-f", instance_name]))
            .await
            .map_err(|e| EnvironmentError::Provider(e.to_string()))?;
        if out.success() || out.stderr.contains("No such container") {
            return Ok(());
        }
        Err(EnvironmentError::Provider(format!(
            "{} rm exited with {}: {}",
            self.binary,
            out.exit_code,
            out.stderr.trim()
        )))
    }

    async fn logs(&self, instance_name: &str) -> Option<String> {
        let out = run_command(&self.cli(["logs", instance_name])).await.ok()?;
        out.success().then(|| format!("{}{}", out.stdout, out.stderr))
    }

    async fn list_stale(&self) -> EnvResult<Vec<String>> {
        let filter = format!("label={MANAGED_LABEL}=true");
        let out = run_command(&self.cli(["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"]))
            .await
            .map_err(|e| EnvironmentError::Provider(e.to_string()))?;
        if !out.success() {
            return Err(EnvironmentError::Provider(out.stderr.trim().to_string()));
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::ResourceSet;
    use std::collections::BTreeMap;

    #[test]
    fn test_services_include_baseline_and_companions() {
        let caps = vec!["lambda".to_string(), "s3".to_string()];
        assert_eq!(services_for(&caps), "iam,lambda,logs,s3,s3control,sts");
    }

    #[test]
    fn test_services_without_capabilities_is_baseline() {
        assert_eq!(services_for(&[]), "iam,sts");
    }

    #[test]
    fn test_run_args_pin_version_and_port() {
        let spec = LaunchSpec {
            instance_name: "emuval-abc-123".to_string(),
            image: "localstack/localstack".to_string(),
            version: "3.8".to_string(),
            resources: ResourceSet {
                slot: 2,
                edge_port: 5120,
            },
            capabilities: vec!["sqs".to_string()],
            labels: BTreeMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
        };
        let args = DockerEmulator::run_args(&spec);
        assert_eq!(args.last().map(String::as_str), Some("localstack/localstack:3.8"));
        assert!(args.contains(&"5120:4566".to_string()));
        assert!(args.contains(&"SERVICES=iam,sqs,sts".to_string()));
        assert!(args.contains(&"emuval.managed=true".to_string()));
    }
}
