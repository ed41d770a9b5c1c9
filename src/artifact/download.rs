//! Archive download and content hashing

use futures::StreamExt;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use super::ArtifactError;

/// Query parameter carrying the expected digest of the extracted binary
pub const CHECKSUM_PARAM: &str = "checksum";

/// Stream `url` into the file at `dest`
pub async fn download_to(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<(), ArtifactError> {
    info!("Downloading binary from {}", url);

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ArtifactError::Download(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ArtifactError::Download(format!("HTTP {}", response.status())));
    }

    let total_size = response.content_length().unwrap_or(0);
    let mut downloaded: u64 = 0;
    let mut last_reported: u64 = 0;

    let mut file = std::fs::File::create(dest).map_err(|e| ArtifactError::Io(e.to_string()))?;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ArtifactError::Download(e.to_string()))?;
        file.write_all(&chunk)
            .map_err(|e| ArtifactError::Io(e.to_string()))?;

        downloaded += chunk.len() as u64;

        if total_size > 0 {
            let progress = (downloaded * 100) / total_size;
            if progress >= last_reported + 10 {
                debug!("Download progress: {}%", progress);
                last_reported = progress;
            }
        }
    }

    file.flush().map_err(|e| ArtifactError::Io(e.to_string()))?;

    info!(bytes = downloaded, "Download complete");
    Ok(())
}

/// Expected digest from the `checksum` query parameter, if the link has one
pub fn checksum_from_url(link: &str) -> Result<Option<String>, ArtifactError> {
    let url = url::Url::parse(link)
        .map_err(|e| ArtifactError::InvalidDownloadUrl(format!("{}: {}", link, e)))?;

    Ok(url
        .query_pairs()
        .find(|(key, _)| key == CHECKSUM_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty()))
}

/// SHA256 of a file as lowercase hex
pub fn sha256_file(path: &Path) -> Result<String, ArtifactError> {
    use sha2::{Digest, Sha256};

    let mut file = std::fs::File::open(path).map_err(|e| ArtifactError::Io(e.to_string()))?;

    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| ArtifactError::Io(e.to_string()))?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// Case-insensitive digest comparison
pub fn checksum_matches(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected.trim())
}
