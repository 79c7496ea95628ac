use std::path::PathBuf;

use thiserror::Error;

/// Every hard failure the pipeline can raise.
///
/// Per-period data insufficiency is deliberately absent: it is recorded on
/// the fit result and surfaced in the report, never raised.
#[derive(Error, Debug)]
pub enum ForensicError {
    /// File could not be read or written.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Digest mismatch, or the file has no manifest entry.
    #[error("provenance check failed for '{path}': {detail}")]
    Provenance { path: PathBuf, detail: String },

    /// Manifest names an algorithm this build cannot compute.
    #[error("unsupported digest algorithm: {name}")]
    UnsupportedAlgorithm { name: String },

    /// Manifest file is not valid JSON of the expected shape.
    #[error("manifest '{path}' is malformed: {detail}")]
    Manifest { path: PathBuf, detail: String },

    /// Dataset row is unparsable or breaks the series invariants.
    #[error("malformed data in '{source_name}' at {location}: {detail}")]
    MalformedData {
        source_name: String,
        location: String,
        detail: String,
    },

    /// Observed and model series share no index inside the window.
    #[error("observed and model series share no index in [{index_min}, {index_max}]")]
    EmptyOverlap { index_min: u32, index_max: u32 },

    /// Covariance matrix is missing indices or not positive definite.
    #[error("covariance error: {detail}")]
    Covariance { detail: String },

    /// Significance requested against an empty null distribution.
    #[error("null distribution has no samples")]
    InsufficientNullSamples,

    /// Stage order or locked-parameter rule broken; the run is void.
    #[error("protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    /// Protocol configuration failed to parse or validate.
    #[error("invalid protocol configuration: {detail}")]
    Config { detail: String },

    /// Run aborted through its cancel token.
    #[error("run cancelled after {completed} of {requested} null draws")]
    Cancelled { completed: usize, requested: usize },

    /// Report artifact could not be serialized.
    #[error("report serialization failed: {detail}")]
    Report { detail: String },
}

impl ForensicError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ForensicError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(
        source_name: impl Into<String>,
        location: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        ForensicError::MalformedData {
            source_name: source_name.into(),
            location: location.into(),
            detail: detail.into(),
        }
    }

    pub fn violation(detail: impl Into<String>) -> Self {
        ForensicError::ProtocolViolation {
            detail: detail.into(),
        }
    }

    /// True for the error classes that must always abort the whole run.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            ForensicError::Provenance { .. } | ForensicError::ProtocolViolation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ForensicError>;
