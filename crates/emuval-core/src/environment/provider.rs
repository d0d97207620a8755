//! Emulator provider seam.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::allocator::ResourceSet;
use crate::environment::error::EnvResult;

/// Everything a provider needs to launch one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Deterministic instance name, known before launch so teardown can
    /// always address the instance even if launch was interrupted.
    pub instance_name: String,
    pub image: String,
    pub version: String,
    pub resources: ResourceSet,
    /// Capabilities the candidate exercises; providers may use these to
    /// enable only the services needed.
    pub capabilities: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn endpoint(&self) -> String {
        self.resources.endpoint()
    }
}

/// Launches, probes and stops emulator instances.
///
/// Implementations must be safe to call concurrently for distinct
/// instance names.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Create and start the instance described by `spec`.
    async fn launch(&self, spec: &LaunchSpec) -> EnvResult<()>;

    /// One readiness probe. Never blocks longer than a short request timeout.
    async fn is_ready(&self, spec: &LaunchSpec) -> bool;

    /// Stop and remove the instance. Stopping a missing instance succeeds.
    async fn stop(&self, instance_name: &str) -> EnvResult<()>;

    /// Recent instance logs, if any can be retrieved.
    async fn logs(&self, instance_name: &str) -> Option<String>;

    /// Names of instances left behind by earlier batches.
    async fn list_stale(&self) -> EnvResult<Vec<String>>;
}

/// Result of sweeping leftover instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// Instances that could not be stopped, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Stop every instance the provider reports as left behind.
///
/// Individual stop failures are collected, not returned; only failing to
/// list instances at all is an error.
pub async fn clean_stale_environments(provider: &dyn EnvironmentProvider) -> EnvResult<CleanupReport> {
    let mut report = CleanupReport::default();
    for name in provider.list_stale().await? {
        match provider.stop(&name).await {
            Ok(()) => {
                info!(event = "environment.stale_removed", instance = %name);
                report.removed.push(name);
            }
            Err(e) => {
                warn!(event = "environment.stale_remove_failed", instance = %name, error = %e);
                report.failed.push((name, e.to_string()));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeProvider;

    #[tokio::test]
    async fn test_clean_stops_every_stale_instance() {
        let provider = FakeProvider::new().with_stale(["emuval-a", "emuval-b"]);
        let report = clean_stale_environments(&provider).await.unwrap();
        assert_eq!(report.removed, vec!["emuval-a", "emuval-b"]);
        assert!(report.failed.is_empty());
        assert_eq!(provider.stop_calls("emuval-a"), 1);
    }

    #[tokio::test]
    async fn test_clean_collects_stop_failures() {
        let provider = FakeProvider::new().with_stale(["emuval-a"]).failing_stop();
        let report = clean_stale_environments(&provider).await.unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "emuval-a");
    }
}
