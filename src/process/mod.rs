//! Validator child process monitor
//!
//! Runs one child at a time. Its stdout and stderr are forwarded live to our
//! own streams by two independent read loops; the stderr loop also watches for
//! the restart sentinel the validator prints when it finds itself outdated.
//!
//! Lifecycle: Starting -> Running -> Restarting | Exited | Crashed.
//! Whichever transition happens first decides the outcome, and the child is
//! never left running once `run` returns.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 8 * 1024;

/// How a supervised run ended
#[derive(Debug)]
pub enum MonitorOutcome {
    /// The sentinel appeared on stderr; the child has been killed
    RestartRequested,
    /// The child exited by itself
    Exited(ExitStatus),
    /// The child could not be started or waited on
    Failed(MonitorError),
    /// Shutdown was requested; the child has been killed
    Cancelled,
}

/// Lifecycle of the current child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Starting,
    Running,
    Restarting,
    Exited,
    Crashed,
}

pub struct ProcessMonitor {
    sentinel: Arc<Vec<u8>>,
    drain_grace: Duration,
}

impl ProcessMonitor {
    pub fn new(sentinel: impl Into<String>, drain_grace: Duration) -> Self {
        Self {
            sentinel: Arc::new(sentinel.into().into_bytes()),
            drain_grace,
        }
    }

    /// Spawn `executable` with `args` and supervise it until it settles
    pub async fn run(
        &self,
        executable: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> MonitorOutcome {
        let mut state = ChildState::Starting;
        debug!(?state, "Starting child process ...");

        let mut child = match Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                state = ChildState::Crashed;
                warn!(?state, error = %e, "Failed to start {}", executable.display());
                return MonitorOutcome::Failed(MonitorError::Spawn(format!(
                    "{}: {}",
                    executable.display(),
                    e
                )));
            }
        };

        state = ChildState::Running;
        info!(?state, pid = child.id().unwrap_or(0), "Started {}", executable.display());

        let restart = Arc::new(AtomicBool::new(false));
        let sentinel_seen = Arc::new(Notify::new());

        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward(stdout, tokio::io::stdout())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(watch_stderr(
                stderr,
                tokio::io::stderr(),
                self.sentinel.clone(),
                restart.clone(),
                sentinel_seen.clone(),
            )));
        }

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => {
                    state = ChildState::Exited;
                    MonitorOutcome::Exited(status)
                }
                Err(e) => {
                    state = ChildState::Crashed;
                    MonitorOutcome::Failed(MonitorError::Wait(e.to_string()))
                }
            },
            _ = sentinel_seen.notified() => {
                state = ChildState::Restarting;
                info!("Found invalid version. Stopping ...");
                MonitorOutcome::RestartRequested
            }
            _ = cancel.cancelled() => {
                info!("Shutdown requested. Stopping child ...");
                MonitorOutcome::Cancelled
            }
        };

        stop(&mut child).await;
        self.join_readers(readers).await;

        // The sentinel may arrive in the last output before a natural exit
        let outcome = match outcome {
            MonitorOutcome::Exited(_) if restart.load(Ordering::SeqCst) => {
                state = ChildState::Restarting;
                MonitorOutcome::RestartRequested
            }
            other => other,
        };

        debug!(?state, "Child process settled");
        outcome
    }

    async fn join_readers(&self, readers: Vec<JoinHandle<()>>) {
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(self.drain_grace, reader).await.is_err() {
                // A grandchild may still hold the pipe open
                debug!("Output stream did not close in time, detaching");
                abort.abort();
            }
        }
    }
}

/// Kill the child if it is still alive and reap it
async fn stop(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Kill failed, child already gone");
            }
        }
    }
}

/// Copy a child stream to one of our own
async fn forward<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        }
    }
}

/// Forward stderr and raise `restart` the first time the sentinel shows up
async fn watch_stderr<R, W>(
    mut reader: R,
    mut writer: W,
    sentinel: Arc<Vec<u8>>,
    restart: Arc<AtomicBool>,
    seen: Arc<Notify>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut scanner = SentinelScanner::new(sentinel.as_slice());
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if writer.write_all(&buf[..n]).await.is_ok() {
            let _ = writer.flush().await;
        }

        if !restart.load(Ordering::SeqCst) && scanner.feed(&buf[..n]) {
            restart.store(true, Ordering::SeqCst);
            seen.notify_one();
        }
    }
}

/// Substring search over a stream of chunks.
///
/// Keeps the last `sentinel.len() - 1` bytes between calls so a sentinel
/// split across two reads is still found.
pub struct SentinelScanner<'a> {
    sentinel: &'a [u8],
    tail: Vec<u8>,
}

impl<'a> SentinelScanner<'a> {
    pub fn new(sentinel: &'a [u8]) -> Self {
        Self {
            sentinel,
            tail: Vec::with_capacity(sentinel.len()),
        }
    }

    /// Feed one chunk; true if the sentinel ends inside it
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.sentinel.is_empty() {
            return false;
        }

        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(chunk);

        let found = window
            .windows(self.sentinel.len())
            .any(|w| w == self.sentinel);

        let keep = (self.sentinel.len() - 1).min(window.len());
        self.tail = window.split_off(window.len() - keep);

        found
    }
}

/// Child process errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum MonitorError {
    #[error("Failed to spawn child: {0}")]
    Spawn(String),

    #[error("Failed to wait on child: {0}")]
    Wait(String),
}
