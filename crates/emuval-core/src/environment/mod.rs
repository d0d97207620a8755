//! Environment lifecycle: one isolated emulator per candidate.
//!
//! Every environment moves through an explicit [`EnvironmentState`] machine
//! and leaves it through a single teardown path that is reachable from
//! every state, including `Failed`.
//!
//! # Modules
//!
//! - [`state`]   : `EnvironmentState` and its legal transitions
//! - [`provider`]: `EnvironmentProvider` trait (launch / probe / stop / logs)
//! - [`docker`]  : container-runtime backed provider
//! - [`manager`] : `EnvironmentManager`, `EnvironmentHandle`, `TeardownReport`
//! - [`error`]   : `EnvironmentError` / `EnvResult`

pub mod docker;
pub mod error;
pub mod manager;
pub mod provider;
pub mod state;

pub use docker::DockerEmulator;
pub use error::{EnvResult, EnvironmentError};
pub use manager::{
    EnvironmentHandle, EnvironmentManager, LifecycleSettings, TeardownFailure, TeardownReport,
    TeardownStep,
};
pub use provider::{clean_stale_environments, CleanupReport, EnvironmentProvider, LaunchSpec};
pub use state::EnvironmentState;
