//! Content hashing for up-to-date checks.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// SHA-256 of a file's contents, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut hasher = Sha256::new();
    io::copy(&mut BufReader::new(file), &mut hasher)
        .with_context(|| format!("failed to hash file: {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Builds one digest out of labelled components.
///
/// Each component is followed by a separator, so `("ab", "c")` and
/// `("a", "bc")` produce different fingerprints.
#[derive(Default)]
pub struct Fingerprint {
    hasher: Sha256,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.hasher.update(s.as_bytes());
        self.hasher.update(b"\0");
        self
    }

    /// Add a file by path and content. A missing file hashes as absent.
    pub fn update_file(&mut self, path: &Path) -> Result<&mut Self> {
        self.update_str(&path.to_string_lossy());
        if path.is_file() {
            let digest = sha256_file(path)?;
            self.hasher.update(b"\x01");
            self.update_str(&digest);
        } else {
            self.hasher.update(b"\x00");
        }
        Ok(self)
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
