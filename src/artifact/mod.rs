//! Local store of validator binaries
//!
//! Binaries are installed once per (runtime, version) and trusted afterwards.
//!
//! Directory structure:
//!   {artifact_dir}/
//!     └── {runtime}/
//!         └── {version}/
//!             ├── .installed      # written once verified, holds the binary digest
//!             ├── download.zip    # only while installing
//!             └── bin/
//!                 └── kyve-linux-x64
//!
//! A version directory without `.installed` is an interrupted install. It is
//! wiped and reinstalled when auto download is on. With auto download off, a
//! binary placed in `bin/` by the operator is used as is, unless
//! `download.zip` is still there. The marker is written before the archive
//! is removed, so an install killed before completion always leaves one of
//! the two behind.

pub mod download;
pub mod extract;

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::registry::PoolDescriptor;

pub use download::{checksum_from_url, checksum_matches, sha256_file};

/// Completion marker inside a version directory
pub const MARKER_FILE: &str = ".installed";

/// Subdirectory the archive is extracted into
pub const BIN_DIR: &str = "bin";

const ARCHIVE_NAME: &str = "download.zip";
const UNVERIFIED: &str = "unverified";

/// How a missing version may be installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPolicy {
    pub host_target: String,
    pub auto_download: bool,
    pub verify_checksums: bool,
}

/// What is on disk for one version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallState {
    Absent,
    /// Marker present, binary resolved
    Complete(PathBuf),
    /// Directory exists without a finished install. `interrupted` is set
    /// while the downloaded archive is still present.
    Incomplete { binary: Option<PathBuf>, interrupted: bool },
}

/// Owns the artifact root and everything below it
pub struct ArtifactStore {
    root: PathBuf,
    http: reqwest::Client,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            http: reqwest::Client::new(),
        }
    }

    /// Directory for one (runtime, version) pair
    pub fn version_dir(&self, runtime: &str, version: &str) -> PathBuf {
        self.root
            .join(path_component(runtime))
            .join(path_component(version))
    }

    /// Inspect what is installed for a version directory
    pub fn inspect(&self, version_dir: &Path) -> Result<InstallState, ArtifactError> {
        if !version_dir.exists() {
            return Ok(InstallState::Absent);
        }

        let binary = extract::first_file(&version_dir.join(BIN_DIR))?;
        match binary {
            Some(path) if version_dir.join(MARKER_FILE).is_file() => Ok(InstallState::Complete(path)),
            binary => Ok(InstallState::Incomplete {
                binary,
                interrupted: version_dir.join(ARCHIVE_NAME).exists(),
            }),
        }
    }

    /// Make sure the binary for the descriptor's version is installed and
    /// return the path to execute.
    pub async fn ensure_artifact(
        &self,
        descriptor: &PoolDescriptor,
        policy: &InstallPolicy,
    ) -> Result<PathBuf, ArtifactError> {
        let runtime = descriptor
            .runtime
            .as_deref()
            .ok_or(ArtifactError::IncompleteDescriptor("runtime"))?;
        let version = descriptor
            .version
            .as_deref()
            .ok_or(ArtifactError::IncompleteDescriptor("version"))?;
        let version_dir = self.version_dir(runtime, version);

        let state = self.inspect(&version_dir)?;
        match &state {
            InstallState::Complete(binary) => {
                info!(runtime, version, "Version already exists. Skipping download ...");
                return Ok(binary.clone());
            }
            InstallState::Incomplete {
                binary: Some(binary),
                interrupted: false,
            } if !policy.auto_download => {
                warn!(
                    runtime,
                    version,
                    "Using manually installed binary {}",
                    binary.display()
                );
                return Ok(binary.clone());
            }
            _ => {}
        }

        if !policy.auto_download {
            return Err(ArtifactError::AutoDownloadDisabled {
                runtime: runtime.to_string(),
                version: version.to_string(),
            });
        }

        let link = descriptor
            .download_link(&policy.host_target)
            .ok_or_else(|| ArtifactError::NoBinaryForTarget(policy.host_target.clone()))?;

        let expected = checksum_from_url(link)?;
        if policy.verify_checksums && expected.is_none() {
            return Err(ArtifactError::MissingChecksum(link.to_string()));
        }

        if let InstallState::Incomplete { .. } = state {
            warn!(runtime, version, "Found incomplete install, removing it");
            fs::remove_dir_all(&version_dir).map_err(|e| ArtifactError::Io(e.to_string()))?;
        }

        let expected = expected.filter(|_| policy.verify_checksums);
        match self.install(&version_dir, link, expected).await {
            Ok(binary) => {
                info!(runtime, version, "Installed {}", binary.display());
                Ok(binary)
            }
            Err(e) => {
                error!(runtime, version, error = %e, "Install failed, removing {}", version_dir.display());
                if let Err(cleanup) = fs::remove_dir_all(&version_dir) {
                    error!(error = %cleanup, "Failed to remove {}", version_dir.display());
                }
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        version_dir: &Path,
        link: &str,
        expected: Option<String>,
    ) -> Result<PathBuf, ArtifactError> {
        let bin_dir = version_dir.join(BIN_DIR);
        fs::create_dir_all(&bin_dir).map_err(|e| ArtifactError::Io(e.to_string()))?;

        let archive = version_dir.join(ARCHIVE_NAME);
        download::download_to(&self.http, link, &archive).await?;

        let version_dir = version_dir.to_path_buf();
        tokio::task::spawn_blocking(move || unpack(&version_dir, &archive, expected.as_deref()))
            .await
            .map_err(|e| ArtifactError::Io(e.to_string()))?
    }
}

/// Extract, verify and mark a downloaded archive as installed
fn unpack(version_dir: &Path, archive: &Path, expected: Option<&str>) -> Result<PathBuf, ArtifactError> {
    let bin_dir = version_dir.join(BIN_DIR);

    info!("Extracting binary ...");
    extract::extract_zip(archive, &bin_dir)?;

    let binary = extract::first_file(&bin_dir)?
        .ok_or_else(|| ArtifactError::Extract("archive contained no files".to_string()))?;

    let actual = sha256_file(&binary)?;
    if let Some(expected) = expected {
        info!("Verifying checksum of {}", binary.display());
        if !checksum_matches(&actual, expected) {
            return Err(ArtifactError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }

    extract::mark_executable(&binary)?;

    let marker = match expected {
        Some(_) => actual,
        None => format!("{} {}", actual, UNVERIFIED),
    };
    fs::write(version_dir.join(MARKER_FILE), marker).map_err(|e| ArtifactError::Io(e.to_string()))?;
    fs::remove_file(archive).map_err(|e| ArtifactError::Io(e.to_string()))?;

    Ok(binary)
}

/// Map a registry string onto a single safe path component
fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

/// Coarse classification driving the supervisor's reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactErrorKind {
    /// Operator or registry must change something; retrying won't help
    Configuration,
    /// Network or disk trouble that may go away
    Transient,
    /// The download does not match its published digest
    Integrity,
}

/// Artifact errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ArtifactError {
    #[error("Pool descriptor has no {0}")]
    IncompleteDescriptor(&'static str),

    #[error("Version {runtime}/{version} is not installed and auto download is disabled")]
    AutoDownloadDisabled { runtime: String, version: String },

    #[error("No binary published for host target {0}")]
    NoBinaryForTarget(String),

    #[error("Download link has no checksum to verify against: {0}")]
    MissingChecksum(String),

    #[error("Invalid download link: {0}")]
    InvalidDownloadUrl(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Extraction failed: {0}")]
    Extract(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl ArtifactError {
    pub fn kind(&self) -> ArtifactErrorKind {
        match self {
            ArtifactError::IncompleteDescriptor(_)
            | ArtifactError::AutoDownloadDisabled { .. }
            | ArtifactError::NoBinaryForTarget(_)
            | ArtifactError::MissingChecksum(_)
            | ArtifactError::InvalidDownloadUrl(_) => ArtifactErrorKind::Configuration,
            ArtifactError::Download(_) | ArtifactError::Extract(_) | ArtifactError::Io(_) => {
                ArtifactErrorKind::Transient
            }
            ArtifactError::ChecksumMismatch { .. } => ArtifactErrorKind::Integrity,
        }
    }
}
