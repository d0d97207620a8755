//! Infrastructure deployment against an emulator endpoint.
//!
//! [`DeploymentTool`] is the seam between the pipeline and the concrete
//! infrastructure tool. `apply` never returns an error: every failure is
//! folded into an unsuccessful [`DeploymentResult`] so the classifier sees
//! one shape. `destroy` is best-effort cleanup and reports its own errors.

pub mod prepare;
pub mod terraform;

use std::path::Path;

use async_trait::async_trait;
use emuval_state::DeploymentResult;

use crate::process::ProcessError;

pub use prepare::{prepare_workspace, PreparedWorkspace};
pub use terraform::TerraformDeployer;

/// Errors produced by deployment cleanup and workspace preparation.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{step} failed with exit code {exit_code}: {detail}")]
    StepFailed {
        step: String,
        exit_code: i32,
        detail: String,
    },

    #[error("workspace preparation failed: {0}")]
    Workspace(#[from] std::io::Error),
}

pub type DeployResult<T> = std::result::Result<T, DeployError>;

/// Applies and destroys a candidate's infrastructure.
#[async_trait]
pub trait DeploymentTool: Send + Sync {
    /// Provision the definition in `workdir` against `endpoint`.
    async fn apply(&self, endpoint: &str, workdir: &Path) -> DeploymentResult;

    /// Remove whatever `apply` created. Safe to call after a partial apply.
    async fn destroy(&self, endpoint: &str, workdir: &Path) -> DeployResult<()>;
}
