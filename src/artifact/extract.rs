//! Zip extraction into a binary directory

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::ArtifactError;

/// Extract `archive` into `dest`
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<(), ArtifactError> {
    let file = fs::File::open(archive).map_err(|e| ArtifactError::Extract(e.to_string()))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| ArtifactError::Extract(e.to_string()))?;

    if zip.is_empty() {
        return Err(ArtifactError::Extract("archive is empty".to_string()));
    }

    debug!(entries = zip.len(), "Extracting {}", archive.display());
    fs::create_dir_all(dest).map_err(|e| ArtifactError::Io(e.to_string()))?;
    zip.extract(dest)
        .map_err(|e| ArtifactError::Extract(e.to_string()))?;

    Ok(())
}

/// First regular file in `dir`, by file name
pub fn first_file(dir: &Path) -> Result<Option<PathBuf>, ArtifactError> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| ArtifactError::Io(e.to_string()))?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let file_type = entry.file_type().ok()?;
            file_type.is_file().then(|| entry.path())
        })
        .collect();

    files.sort();
    Ok(files.into_iter().next())
}

/// Make the binary executable on Unix
pub fn mark_executable(path: &Path) -> Result<(), ArtifactError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)
            .map_err(|e| ArtifactError::Io(e.to_string()))?
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).map_err(|e| ArtifactError::Io(e.to_string()))?;
    }

    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}
