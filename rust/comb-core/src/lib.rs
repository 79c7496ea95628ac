//! Shared types for provenance-gated comb-signal significance tests.
//!
//! Everything that happens before the statistics lives here: dataset
//! digests and the manifest gate, spectrum loading, residual construction,
//! and the pre-registration protocol that freezes parameters before any
//! data are read.

pub mod cancel;
pub mod error;
pub mod protocol;
pub mod provenance;
pub mod residual;
pub mod series;

pub use cancel::CancelToken;
pub use error::{ForensicError, Result};
pub use protocol::{
    lock, CandidatePeriods, IndexWindow, LockedParameters, LockedProtocol, MappingMode,
    NullMethod, ProtocolConfig, ProtocolHandle, Registration, Stage, MAX_CANDIDATE_PERIODS,
};
pub use provenance::{register, validate, AdmittedFile, DigestAlgorithm, Manifest, ManifestEntry};
pub use residual::{residuals, residuals_whitened, Covariance, ResidualSeries, Whitening};
pub use series::{load, DatasetFormat, SpectralPoint, SpectralSeries};
