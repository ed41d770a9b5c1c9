//! The supervisor loop
//!
//! Each iteration:
//! 1. Fetch the pool state (blocks through registry outages)
//! 2. Check the pool names a runtime and a version
//! 3. Make sure that version's binary is installed
//! 4. Run it until it asks for a restart, exits, or fails to start
//!
//! Iterations never overlap. The loop only ends on a fatal error, on
//! cancellation, or when a clean child exit is configured to stop it.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::artifact::{ArtifactError, ArtifactErrorKind, ArtifactStore, InstallPolicy};
use crate::config::{CleanExitPolicy, ProtocolNodeConfig, SupervisorConfig};
use crate::process::{MonitorError, MonitorOutcome, ProcessMonitor};
use crate::registry::{PoolDescriptor, RegistryClient, RegistryError, RetryPolicy};
use crate::secrets::Secrets;

const REDACTED: &str = "<redacted>";

/// Why the loop stopped without an error
#[derive(Debug)]
pub enum Shutdown {
    /// The cancellation token fired
    Cancelled,
    /// The child exited on its own and the policy says stop
    ChildExited(ExitStatus),
}

enum Step {
    Continue,
    Stop(Shutdown),
}

/// Pause before relaunching a child that exited on its own.
///
/// Consecutive quick exits step up the pause; a run that lasted at least
/// `healthy_run` starts the count over.
#[derive(Debug)]
struct RestartBackoff {
    policy: RetryPolicy,
    healthy_run: Duration,
    quick_exits: u32,
}

impl RestartBackoff {
    fn new(policy: RetryPolicy, healthy_run: Duration) -> Self {
        Self {
            policy,
            healthy_run,
            quick_exits: 0,
        }
    }

    fn next_delay(&mut self, ran_for: Duration) -> Duration {
        if ran_for >= self.healthy_run {
            self.quick_exits = 0;
        }
        self.quick_exits = self.quick_exits.saturating_add(1);
        self.policy.delay_for(self.quick_exits)
    }
}

pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    secrets: Secrets,
    registry: RegistryClient,
    store: ArtifactStore,
    monitor: ProcessMonitor,
    install: InstallPolicy,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        secrets: Secrets,
        cancel: CancellationToken,
    ) -> Result<Self, SupervisorError> {
        let endpoint = config
            .registry_endpoint()
            .map_err(|e| SupervisorError::Configuration(e.to_string()))?;

        let registry = RegistryClient::new(endpoint, config.retry_policy());
        let store = ArtifactStore::new(config.supervisor.artifact_dir.clone());
        let monitor = ProcessMonitor::new(
            config.monitor.restart_sentinel.clone(),
            Duration::from_secs(config.monitor.shutdown_grace_secs),
        );
        let install = InstallPolicy {
            host_target: config.supervisor.host_target.clone(),
            auto_download: config.supervisor.auto_download,
            verify_checksums: config.supervisor.verify_checksums,
        };

        Ok(Self {
            config: Arc::new(config),
            secrets,
            registry,
            store,
            monitor,
            install,
            cancel,
        })
    }

    /// Supervise until a fatal error, cancellation, or a configured stop
    pub async fn run(&self) -> Result<Shutdown, SupervisorError> {
        let pool_id = self.config.protocol_node.pool_id.clone();
        let mut iteration: u64 = 0;
        let mut backoff = RestartBackoff::new(
            self.config.restart_policy(),
            Duration::from_secs(self.config.supervisor.healthy_run_secs),
        );

        loop {
            iteration += 1;
            let span = info_span!("iteration", iteration, pool_id = %pool_id);

            match self.iterate(&pool_id, &mut backoff).instrument(span).await? {
                Step::Continue => {}
                Step::Stop(shutdown) => {
                    info!(?shutdown, "Supervisor stopped");
                    return Ok(shutdown);
                }
            }
        }
    }

    async fn iterate(
        &self,
        pool_id: &str,
        backoff: &mut RestartBackoff,
    ) -> Result<Step, SupervisorError> {
        let descriptor = match self.registry.fetch_pool_state(pool_id, &self.cancel).await {
            Ok(descriptor) => descriptor,
            Err(RegistryError::Cancelled) => return Ok(Step::Stop(Shutdown::Cancelled)),
            Err(e) => return Err(SupervisorError::Registry(e)),
        };

        validate_descriptor(&descriptor)?;

        let executable = match self.ensure_artifact(&descriptor).await? {
            Some(executable) => executable,
            None => return Ok(Step::Stop(Shutdown::Cancelled)),
        };

        let args = build_child_args(&self.config.protocol_node, &self.secrets);
        info!(
            args = ?redact(&args, &self.secrets.mnemonic),
            "Launching {}",
            executable.display()
        );

        let started = Instant::now();
        match self.monitor.run(&executable, &args, &self.cancel).await {
            MonitorOutcome::RestartRequested => {
                info!("Validator reported an outdated version, restarting");
                Ok(Step::Continue)
            }
            MonitorOutcome::Exited(status) => match self.config.supervisor.clean_exit {
                CleanExitPolicy::Restart => {
                    let delay = backoff.next_delay(started.elapsed());
                    warn!(%status, "Validator exited, restarting in {:?}", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => Ok(Step::Continue),
                        _ = self.cancel.cancelled() => Ok(Step::Stop(Shutdown::Cancelled)),
                    }
                }
                CleanExitPolicy::Stop => {
                    info!(%status, "Validator exited, stopping");
                    Ok(Step::Stop(Shutdown::ChildExited(status)))
                }
            },
            MonitorOutcome::Failed(e) => {
                error!(error = %e, "Validator could not be run");
                Err(SupervisorError::Child(e))
            }
            MonitorOutcome::Cancelled => Ok(Step::Stop(Shutdown::Cancelled)),
        }
    }

    /// Install with bounded retries for transient failures. `None` means
    /// cancelled.
    async fn ensure_artifact(
        &self,
        descriptor: &PoolDescriptor,
    ) -> Result<Option<PathBuf>, SupervisorError> {
        let max_retries = self.config.supervisor.artifact_retries;
        let delay = Duration::from_secs(self.config.supervisor.artifact_retry_delay_secs);
        let mut retries: u32 = 0;

        loop {
            let result = tokio::select! {
                result = self.store.ensure_artifact(descriptor, &self.install) => result,
                _ = self.cancel.cancelled() => return Ok(None),
            };

            match result {
                Ok(executable) => return Ok(Some(executable)),
                Err(e) if e.kind() == ArtifactErrorKind::Transient && retries < max_retries => {
                    retries += 1;
                    warn!(
                        error = %e,
                        retry = retries,
                        max_retries,
                        "Artifact install failed, retrying in {}s",
                        delay.as_secs()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Ok(None),
                    }
                }
                Err(e) => {
                    error!(error = %e, "Artifact install failed");
                    return Err(SupervisorError::Artifact(e));
                }
            }
        }
    }
}

fn validate_descriptor(descriptor: &PoolDescriptor) -> Result<(), SupervisorError> {
    if descriptor.version.is_none() {
        return Err(SupervisorError::Configuration(
            "Version tag not found".to_string(),
        ));
    }
    if descriptor.runtime.is_none() {
        return Err(SupervisorError::Configuration(
            "Runtime not found".to_string(),
        ));
    }
    Ok(())
}

/// Command line for the validator binary
pub fn build_child_args(node: &ProtocolNodeConfig, secrets: &Secrets) -> Vec<String> {
    let mut args = vec![
        "--poolId".to_string(),
        node.pool_id.clone(),
        "--mnemonic".to_string(),
        secrets.mnemonic.clone(),
        "--network".to_string(),
        node.network.clone(),
        "--keyfile".to_string(),
        secrets.keyfile.display().to_string(),
    ];

    if let Some(stake) = node.initial_stake {
        args.push("--initialStake".to_string());
        args.push(stake.to_string());
    }
    if let Some(space) = node.space {
        args.push("--space".to_string());
        args.push(space.to_string());
    }
    if let Some(batch_size) = node.batch_size {
        args.push("--batchSize".to_string());
        args.push(batch_size.to_string());
    }
    if node.verbose {
        args.push("--verbose".to_string());
    }
    if node.metrics {
        args.push("--metrics".to_string());
    }

    args.extend(node.extra_args.iter().cloned());
    args
}

fn redact(args: &[String], secret: &str) -> Vec<String> {
    args.iter()
        .map(|arg| {
            if arg == secret {
                REDACTED.to_string()
            } else {
                arg.clone()
            }
        })
        .collect()
}

/// Fatal supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Registry error: {0}")]
    Registry(RegistryError),

    #[error("Artifact error: {0}")]
    Artifact(ArtifactError),

    #[error("Child process error: {0}")]
    Child(MonitorError),
}

impl SupervisorError {
    /// Process exit code: 0 for policy stops the operator must resolve,
    /// 1 for runtime failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::Configuration(_) => 0,
            SupervisorError::Artifact(e) if e.kind() == ArtifactErrorKind::Configuration => 0,
            SupervisorError::Registry(_)
            | SupervisorError::Artifact(_)
            | SupervisorError::Child(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn secrets() -> Secrets {
        Secrets {
            mnemonic: "alpha beta gamma".to_string(),
            keyfile: PathBuf::from("/secrets/keyfile.json"),
        }
    }

    #[test]
    fn test_required_args_only() {
        let node = ProtocolNodeConfig {
            pool_id: "4".to_string(),
            ..ProtocolNodeConfig::default()
        };

        let args = build_child_args(&node, &secrets());
        assert_eq!(
            args,
            vec![
                "--poolId",
                "4",
                "--mnemonic",
                "alpha beta gamma",
                "--network",
                "korellia",
                "--keyfile",
                "/secrets/keyfile.json",
            ]
        );
    }

    #[test]
    fn test_optional_args_follow_config() {
        let node = ProtocolNodeConfig {
            pool_id: "0".to_string(),
            network: "beta".to_string(),
            initial_stake: Some(100),
            space: Some(1_000_000_000),
            batch_size: None,
            verbose: true,
            metrics: false,
            extra_args: vec!["--cache".to_string(), "memory".to_string()],
        };

        let args = build_child_args(&node, &secrets());
        let tail: Vec<&str> = args[8..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "--initialStake",
                "100",
                "--space",
                "1000000000",
                "--verbose",
                "--cache",
                "memory",
            ]
        );
    }

    #[test]
    fn test_redact_hides_mnemonic() {
        let args = build_child_args(&ProtocolNodeConfig::default(), &secrets());
        let redacted = redact(&args, "alpha beta gamma");
        assert!(!redacted.iter().any(|a| a.contains("alpha")));
        assert!(redacted.iter().any(|a| a == REDACTED));
    }

    #[test]
    fn test_descriptor_validation() {
        let mut descriptor = PoolDescriptor {
            pool_id: "0".to_string(),
            runtime: Some("r1".to_string()),
            version: None,
            binaries: BTreeMap::new(),
            raw_config: serde_json::Map::new(),
        };
        let err = validate_descriptor(&descriptor).unwrap_err();
        assert_eq!(err.exit_code(), 0);

        descriptor.version = Some("v2".to_string());
        assert!(validate_descriptor(&descriptor).is_ok());

        descriptor.runtime = None;
        assert!(validate_descriptor(&descriptor).is_err());
    }

    #[test]
    fn test_restart_backoff_grows_then_resets() {
        let policy = RetryPolicy {
            step: Duration::from_secs(10),
            max_delay: Duration::from_secs(25),
            max_attempts: None,
        };
        let mut backoff = RestartBackoff::new(policy, Duration::from_secs(60));

        let quick = Duration::from_secs(1);
        assert_eq!(backoff.next_delay(quick), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(quick), Duration::from_secs(20));
        assert_eq!(backoff.next_delay(quick), Duration::from_secs(25));

        assert_eq!(backoff.next_delay(Duration::from_secs(60)), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(quick), Duration::from_secs(20));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            SupervisorError::Artifact(ArtifactError::NoBinaryForTarget("linux-x64".into()))
                .exit_code(),
            0
        );
        assert_eq!(
            SupervisorError::Artifact(ArtifactError::Download("HTTP 404".into())).exit_code(),
            1
        );
        assert_eq!(
            SupervisorError::Child(MonitorError::Spawn("permission denied".into())).exit_code(),
            1
        );
    }
}
