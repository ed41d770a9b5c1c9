//! Validator key material
//!
//! The mnemonic and keyfile live in the secrets directory and are passed to
//! the validator on its command line. Their content is opaque to us.

use std::fmt;
use std::path::{Path, PathBuf};

pub const MNEMONIC_FILE: &str = "mnemonic.txt";
pub const KEYFILE_NAME: &str = "keyfile.json";

#[derive(Clone)]
pub struct Secrets {
    pub mnemonic: String,
    pub keyfile: PathBuf,
}

// Keep the mnemonic out of logs and panics
impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("mnemonic", &"<redacted>")
            .field("keyfile", &self.keyfile)
            .finish()
    }
}

impl Secrets {
    pub fn load(dir: &Path) -> Result<Self, SecretsError> {
        let mnemonic_path = dir.join(MNEMONIC_FILE);
        let mnemonic = std::fs::read_to_string(&mnemonic_path)
            .map_err(|e| SecretsError::Missing(format!("{}: {}", mnemonic_path.display(), e)))?
            .trim()
            .to_string();

        if mnemonic.is_empty() {
            return Err(SecretsError::Empty(mnemonic_path.display().to_string()));
        }

        let keyfile = dir.join(KEYFILE_NAME);
        let keyfile = keyfile
            .canonicalize()
            .map_err(|e| SecretsError::Missing(format!("{}: {}", keyfile.display(), e)))?;

        Ok(Self { mnemonic, keyfile })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretsError {
    #[error("Secret not found: {0}")]
    Missing(String),

    #[error("Secret file is empty: {0}")]
    Empty(String),
}
