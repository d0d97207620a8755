//! Error types for the environment lifecycle.

use crate::allocator::AllocationError;
use crate::environment::state::EnvironmentState;

/// Errors produced while creating or driving an environment.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("environment start failed after {attempts} attempt(s): {reason}")]
    Start { attempts: u32, reason: String },

    #[error("environment {instance} did not become healthy within {timeout_secs}s")]
    HealthCheckTimeout { instance: String, timeout_secs: u64 },

    #[error("resource allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("invalid environment transition {from} -> {to}")]
    InvalidTransition {
        from: EnvironmentState,
        to: EnvironmentState,
    },

    #[error("environment provider error: {0}")]
    Provider(String),

    #[error("working directory error: {0}")]
    Workspace(#[from] std::io::Error),
}

impl EnvironmentError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnvironmentError::Start { .. }
                | EnvironmentError::Allocation(_)
                | EnvironmentError::HealthCheckTimeout { .. }
        )
    }
}

/// Result type for environment operations.
pub type EnvResult<T> = std::result::Result<T, EnvironmentError>;
