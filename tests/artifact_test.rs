//! Artifact store integration tests
//!
//! Serves zip archives from wiremock and checks install, reuse, verification
//! and rollback against a scratch artifact root.

mod common;

use std::collections::BTreeMap;
use std::path::Path;

use kysor::artifact::{
    ArtifactError, ArtifactErrorKind, ArtifactStore, InstallPolicy, BIN_DIR, MARKER_FILE,
};
use kysor::registry::PoolDescriptor;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BINARY: &[u8] = b"#!/bin/sh\necho validator\n";

fn descriptor(link: Option<String>) -> PoolDescriptor {
    let mut binaries = BTreeMap::new();
    if let Some(link) = link {
        binaries.insert("linux-x64".to_string(), link);
    }
    PoolDescriptor {
        pool_id: "0".to_string(),
        runtime: Some("r1".to_string()),
        version: Some("v2".to_string()),
        binaries,
        raw_config: serde_json::Map::new(),
    }
}

fn policy(auto_download: bool, verify_checksums: bool) -> InstallPolicy {
    InstallPolicy {
        host_target: "linux-x64".to_string(),
        auto_download,
        verify_checksums,
    }
}

async fn serve_archive(server: &MockServer, body: Vec<u8>, expected_requests: u64) {
    Mock::given(method("GET"))
        .and(path("/x.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(expected_requests)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_install_then_reuse_without_network() {
    let server = MockServer::start().await;
    serve_archive(&server, common::zip_bytes(&[("kyve-linux-x64", BINARY)]), 1).await;

    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());
    let link = format!("{}/x.zip?checksum={}", server.uri(), common::sha256_hex(BINARY));
    let descriptor = descriptor(Some(link));

    let first = store.ensure_artifact(&descriptor, &policy(true, true)).await.unwrap();
    let second = store.ensure_artifact(&descriptor, &policy(true, true)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, root.path().join("r1/v2").join(BIN_DIR).join("kyve-linux-x64"));
    assert_eq!(std::fs::read(&first).unwrap(), BINARY);

    let version_dir = root.path().join("r1/v2");
    let marker = std::fs::read_to_string(version_dir.join(MARKER_FILE)).unwrap();
    assert_eq!(marker, common::sha256_hex(BINARY));

    let mut names = common::entries(&version_dir);
    names.sort();
    assert_eq!(names, vec![MARKER_FILE.to_string(), BIN_DIR.to_string()]);
}

#[tokio::test]
async fn test_checksum_comparison_ignores_case() {
    let server = MockServer::start().await;
    serve_archive(&server, common::zip_bytes(&[("kyve", BINARY)]), 1).await;

    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());
    let link = format!(
        "{}/x.zip?checksum={}",
        server.uri(),
        common::sha256_hex(BINARY).to_uppercase()
    );

    let binary = store
        .ensure_artifact(&descriptor(Some(link)), &policy(true, true))
        .await
        .unwrap();
    assert!(binary.starts_with(root.path().join("r1/v2")));
}

#[tokio::test]
async fn test_checksum_mismatch_rolls_back() {
    let server = MockServer::start().await;
    serve_archive(&server, common::zip_bytes(&[("kyve", BINARY)]), 1).await;

    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());
    let link = format!("{}/x.zip?checksum=deadbeef", server.uri());

    let err = store
        .ensure_artifact(&descriptor(Some(link)), &policy(true, true))
        .await
        .unwrap_err();

    assert!(matches!(err, ArtifactError::ChecksumMismatch { .. }));
    assert_eq!(err.kind(), ArtifactErrorKind::Integrity);
    assert!(!root.path().join("r1/v2").exists());
}

#[tokio::test]
async fn test_checksum_mismatch_ignored_without_verification() {
    let server = MockServer::start().await;
    serve_archive(&server, common::zip_bytes(&[("kyve", BINARY)]), 1).await;

    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());
    let link = format!("{}/x.zip?checksum=deadbeef", server.uri());

    let binary = store
        .ensure_artifact(&descriptor(Some(link)), &policy(true, false))
        .await
        .unwrap();

    assert_eq!(std::fs::read(binary).unwrap(), BINARY);
    assert!(root.path().join("r1/v2").join(MARKER_FILE).is_file());
}

#[tokio::test]
async fn test_no_binary_for_target_creates_nothing() {
    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());

    let err = store
        .ensure_artifact(&descriptor(None), &policy(true, true))
        .await
        .unwrap_err();

    assert!(matches!(err, ArtifactError::NoBinaryForTarget(ref t) if t == "linux-x64"));
    assert_eq!(err.kind(), ArtifactErrorKind::Configuration);
    assert!(common::entries(root.path()).is_empty());
}

#[tokio::test]
async fn test_missing_checksum_is_fatal_when_verifying() {
    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());
    let link = "https://h/x.zip".to_string();

    let err = store
        .ensure_artifact(&descriptor(Some(link)), &policy(true, true))
        .await
        .unwrap_err();

    assert!(matches!(err, ArtifactError::MissingChecksum(_)));
    assert!(common::entries(root.path()).is_empty());
}

#[tokio::test]
async fn test_auto_download_disabled() {
    let server = MockServer::start().await;
    serve_archive(&server, common::zip_bytes(&[("kyve", BINARY)]), 0).await;

    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());
    let link = format!("{}/x.zip?checksum=abc", server.uri());

    let err = store
        .ensure_artifact(&descriptor(Some(link)), &policy(false, true))
        .await
        .unwrap_err();

    assert!(matches!(err, ArtifactError::AutoDownloadDisabled { .. }));
    assert_eq!(err.kind(), ArtifactErrorKind::Configuration);
}

#[tokio::test]
async fn test_manual_install_used_when_auto_download_disabled() {
    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());

    let bin_dir = root.path().join("r1/v2").join(BIN_DIR);
    std::fs::create_dir_all(&bin_dir).unwrap();
    std::fs::write(bin_dir.join("kyve"), BINARY).unwrap();

    let binary = store
        .ensure_artifact(&descriptor(None), &policy(false, true))
        .await
        .unwrap();
    assert_eq!(binary, bin_dir.join("kyve"));
}

#[tokio::test]
async fn test_interrupted_install_is_not_taken_for_manual_install() {
    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());

    // Killed after extraction, before the marker: archive still present
    let version_dir = root.path().join("r1/v2");
    std::fs::create_dir_all(version_dir.join(BIN_DIR)).unwrap();
    std::fs::write(version_dir.join(BIN_DIR).join("kyve"), b"trunc").unwrap();
    std::fs::write(version_dir.join("download.zip"), b"partial").unwrap();

    let err = store
        .ensure_artifact(&descriptor(None), &policy(false, true))
        .await
        .unwrap_err();

    assert!(matches!(err, ArtifactError::AutoDownloadDisabled { .. }));
}

#[tokio::test]
async fn test_download_failure_rolls_back() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x.zip"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());
    let link = format!("{}/x.zip?checksum=abc", server.uri());

    let err = store
        .ensure_artifact(&descriptor(Some(link)), &policy(true, true))
        .await
        .unwrap_err();

    assert!(matches!(err, ArtifactError::Download(_)));
    assert_eq!(err.kind(), ArtifactErrorKind::Transient);
    assert!(!root.path().join("r1/v2").exists());
}

#[tokio::test]
async fn test_corrupt_archive_rolls_back() {
    let server = MockServer::start().await;
    serve_archive(&server, b"definitely not a zip".to_vec(), 1).await;

    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());
    let link = format!("{}/x.zip?checksum=abc", server.uri());

    let err = store
        .ensure_artifact(&descriptor(Some(link)), &policy(true, true))
        .await
        .unwrap_err();

    assert!(matches!(err, ArtifactError::Extract(_)));
    assert!(!root.path().join("r1/v2").exists());
}

#[tokio::test]
async fn test_interrupted_install_is_replaced() {
    let server = MockServer::start().await;
    serve_archive(&server, common::zip_bytes(&[("kyve", BINARY)]), 1).await;

    let root = TempDir::new().unwrap();
    let store = ArtifactStore::new(root.path().to_path_buf());

    // Left behind by a process killed mid-extract: no marker
    let version_dir = root.path().join("r1/v2");
    std::fs::create_dir_all(version_dir.join(BIN_DIR)).unwrap();
    std::fs::write(version_dir.join(BIN_DIR).join("kyve"), b"trunc").unwrap();
    std::fs::write(version_dir.join("download.zip"), b"partial").unwrap();

    let link = format!("{}/x.zip?checksum={}", server.uri(), common::sha256_hex(BINARY));
    let binary = store
        .ensure_artifact(&descriptor(Some(link)), &policy(true, true))
        .await
        .unwrap();

    assert_eq!(std::fs::read(&binary).unwrap(), BINARY);
    assert!(version_dir.join(MARKER_FILE).is_file());
    assert!(!Path::new(&version_dir.join("download.zip")).exists());
}
