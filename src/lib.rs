//! kysor: supervisor for a single pool validator
//!
//! Keeps the validator binary for one pool current and running:
//! - Polls the registry for the pool's runtime and version
//! - Downloads, extracts and verifies new binaries on demand
//! - Runs the binary and restarts the cycle when it reports a stale version
//!
//! The loop itself lives in [`supervisor`]; everything else is a collaborator
//! it drives.

pub mod artifact;
pub mod config;
pub mod process;
pub mod registry;
pub mod secrets;
pub mod supervisor;

pub use artifact::{ArtifactError, ArtifactStore};
pub use config::SupervisorConfig;
pub use process::{MonitorOutcome, ProcessMonitor};
pub use registry::{PoolDescriptor, RegistryClient, RetryPolicy};
pub use secrets::Secrets;
pub use supervisor::{Shutdown, Supervisor, SupervisorError};
