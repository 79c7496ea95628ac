//! Dataset provenance: content digests recorded at registration time and
//! re-checked before any file is allowed into an analysis.
//!
//! The manifest is a JSON list of entries:
//!
//! ```text
//! { "entries": [ { "file_name": "tt_spectrum.txt",
//!                  "algorithm": "sha256",
//!                  "digest": "9f86d0…",
//!                  "recorded_at": "2026-03-01T12:00:00+00:00" } ] }
//! ```

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, info, warn};

use crate::error::{ForensicError, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Digest algorithms a manifest may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(ForensicError::UnsupportedAlgorithm {
                name: name.to_string(),
            }),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Sha256 => write!(f, "sha256"),
            DigestAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

/// One registered dataset file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File name only; directories are supplied explicitly by the caller.
    pub file_name: String,
    pub algorithm: DigestAlgorithm,
    /// Lowercase hex digest of the full file content.
    pub digest: String,
    /// RFC 3339 UTC timestamp of registration.
    pub recorded_at: String,
}

/// Hash the full byte content of `path` with `algorithm`.
pub fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> Result<String> {
    let file = File::open(path).map_err(|e| ForensicError::io(path, e))?;
    digest_reader(&mut BufReader::new(file), algorithm, path)
}

fn digest_reader(
    reader: &mut impl Read,
    algorithm: DigestAlgorithm,
    path: &Path,
) -> Result<String> {
    match algorithm {
        DigestAlgorithm::Sha256 => stream_digest::<Sha256>(reader, path),
        DigestAlgorithm::Sha512 => stream_digest::<Sha512>(reader, path),
    }
}

fn stream_digest<D: Digest>(reader: &mut impl Read, path: &Path) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).map_err(|e| ForensicError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| ForensicError::Provenance {
            path: path.to_path_buf(),
            detail: "path has no usable file name".to_string(),
        })
}

/// Compute and record the digest of `path`.
pub fn register(path: &Path, algorithm: DigestAlgorithm) -> Result<ManifestEntry> {
    let digest = digest_file(path, algorithm)?;
    let entry = ManifestEntry {
        file_name: file_name_of(path)?,
        algorithm,
        digest,
        recorded_at: Utc::now().to_rfc3339(),
    };
    info!(file = %entry.file_name, algorithm = %algorithm, digest = %entry.digest, "registered dataset");
    Ok(entry)
}

/// Recompute the digest of `path` with the entry's algorithm and compare.
///
/// A mismatch is `Ok(false)`; callers must treat it as fatal for any claim.
pub fn validate(path: &Path, entry: &ManifestEntry) -> Result<bool> {
    let actual = digest_file(path, entry.algorithm)?;
    let ok = actual.eq_ignore_ascii_case(&entry.digest);
    if ok {
        debug!(path = %path.display(), "digest matches manifest");
    } else {
        warn!(
            path = %path.display(),
            expected = %entry.digest,
            actual = %actual,
            "digest mismatch"
        );
    }
    Ok(ok)
}

/// A file whose digest matched its manifest entry.
///
/// Only [`Manifest::admit`] builds one, so the loader cannot be handed an
/// unchecked path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedFile {
    path: PathBuf,
    digest: String,
    algorithm: DigestAlgorithm,
}

impl AdmittedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Read the file and hash the bytes actually read.
    ///
    /// The file may have changed on disk since admission; bytes that no
    /// longer match the admitted digest are a provenance failure.
    pub fn read_verified(&self) -> Result<Vec<u8>> {
        let bytes = std::fs::read(&self.path).map_err(|e| ForensicError::io(&self.path, e))?;
        let actual = digest_reader(&mut bytes.as_slice(), self.algorithm, &self.path)?;
        if !actual.eq_ignore_ascii_case(&self.digest) {
            warn!(
                path = %self.path.display(),
                admitted = %self.digest,
                actual = %actual,
                "file changed after admission"
            );
            return Err(ForensicError::Provenance {
                path: self.path.clone(),
                detail: format!("file changed after admission ({} {})", self.algorithm, actual),
            });
        }
        Ok(bytes)
    }
}

/// The locked set of registered dataset digests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ForensicError::io(path, e))?;
        Self::from_json(&content).map_err(|detail| ForensicError::Manifest {
            path: path.to_path_buf(),
            detail,
        })
    }

    fn from_json(content: &str) -> std::result::Result<Self, String> {
        let manifest: Manifest = serde_json::from_str(content).map_err(|e| e.to_string())?;
        for entry in &manifest.entries {
            if entry.digest.is_empty() || hex::decode(&entry.digest).is_err() {
                return Err(format!("entry '{}' has a non-hex digest", entry.file_name));
            }
        }
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ForensicError::Manifest {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        std::fs::write(path, json).map_err(|e| ForensicError::io(path, e))
    }

    /// Add or replace the entry for the same file name.
    pub fn insert(&mut self, entry: ManifestEntry) {
        match self.entries.iter_mut().find(|e| e.file_name == entry.file_name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn entry_for(&self, path: &Path) -> Option<&ManifestEntry> {
        let name = path.file_name()?.to_str()?;
        self.entries.iter().find(|e| e.file_name == name)
    }

    /// `Ok(false)` when the file is unregistered or its digest differs.
    pub fn validate_path(&self, path: &Path) -> Result<bool> {
        match self.entry_for(path) {
            Some(entry) => validate(path, entry),
            None => {
                warn!(path = %path.display(), "file has no manifest entry");
                Ok(false)
            }
        }
    }

    /// Gate a file into the analysis; any failure here is fatal.
    pub fn admit(&self, path: &Path) -> Result<AdmittedFile> {
        let entry = self.entry_for(path).ok_or_else(|| ForensicError::Provenance {
            path: path.to_path_buf(),
            detail: "file is not registered in the manifest".to_string(),
        })?;
        if !validate(path, entry)? {
            return Err(ForensicError::Provenance {
                path: path.to_path_buf(),
                detail: format!("{} digest does not match {}", entry.algorithm, entry.digest),
            });
        }
        Ok(AdmittedFile {
            path: path.to_path_buf(),
            digest: entry.digest.to_ascii_lowercase(),
            algorithm: entry.algorithm,
        })
    }
}
