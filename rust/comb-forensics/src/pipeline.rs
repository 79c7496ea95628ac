//! One analysis run, start to finish, under a locked protocol.
//!
//! Every stage transition goes through the [`ProtocolHandle`]; a file that
//! fails its manifest check stops the run before anything is parsed.

use std::path::PathBuf;
use std::sync::Arc;

use comb_core::{
    load, residuals, residuals_whitened, AdmittedFile, CancelToken, Covariance, DatasetFormat,
    ForensicError, LockedProtocol, Manifest, ProtocolHandle, Result, SpectralSeries, Stage,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fit::fit_locked;
use crate::null::generate_locked;
use crate::significance::SignificanceTable;
use crate::verdict::{DatasetIdentity, ReplicationSummary, RunReport, Verdict};

/// Files for one dataset. All of them must be in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInputs {
    pub observed: PathBuf,
    /// Model spectrum; without one, residuals are taken against zero.
    pub model: Option<PathBuf>,
    pub covariance: Option<PathBuf>,
    pub format: DatasetFormat,
}

impl DatasetInputs {
    pub fn observed(path: impl Into<PathBuf>, format: DatasetFormat) -> Self {
        DatasetInputs {
            observed: path.into(),
            model: None,
            covariance: None,
            format,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Box<Verdict>),
    /// Stopped through the cancel token; no verdict exists.
    Cancelled { completed: usize, requested: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationOutcome {
    Completed(RunReport),
    Cancelled {
        dataset: PathBuf,
        completed: usize,
        requested: usize,
    },
}

struct Admitted {
    observed: AdmittedFile,
    model: Option<AdmittedFile>,
    covariance: Option<AdmittedFile>,
}

fn admit_all(manifest: &Manifest, inputs: &DatasetInputs) -> Result<Admitted> {
    let observed = manifest.admit(&inputs.observed)?;
    let model = inputs.model.as_deref().map(|p| manifest.admit(p)).transpose()?;
    let covariance = inputs
        .covariance
        .as_deref()
        .map(|p| manifest.admit(p))
        .transpose()?;
    Ok(Admitted {
        observed,
        model,
        covariance,
    })
}

/// Zero spectrum on the observed indices.
fn zero_model(observed: &SpectralSeries) -> Result<SpectralSeries> {
    let pairs: Vec<(u32, f64)> = observed.points().iter().map(|p| (p.index, 0.0)).collect();
    SpectralSeries::without_uncertainty(&pairs)
}

/// Run one dataset. The handle must be at [`Stage::Locked`] and ends at
/// [`Stage::Reported`] on success.
pub fn run(
    handle: &mut ProtocolHandle,
    manifest: &Manifest,
    inputs: &DatasetInputs,
    cancel: &CancelToken,
) -> Result<RunOutcome> {
    handle.check(Stage::Locked)?;
    let window = handle.protocol().params().index_window;

    // ------------------------------------------------------------------
    // Provenance gate, then load
    // ------------------------------------------------------------------
    let files = admit_all(manifest, inputs)?;
    let observed = load(&files.observed, inputs.format)?;
    let model = match &files.model {
        Some(file) => load(file, inputs.format)?,
        None => zero_model(&observed)?,
    };
    let covariance = files
        .covariance
        .as_ref()
        .map(Covariance::from_text)
        .transpose()?;
    handle.advance(Stage::DataLoaded)?;
    info!(
        dataset = %inputs.observed.display(),
        points = observed.len(),
        stage = %handle.stage(),
        "dataset admitted"
    );

    // ------------------------------------------------------------------
    // Residuals, fit, null, significance
    // ------------------------------------------------------------------
    let resid = match &covariance {
        Some(cov) => residuals_whitened(&observed, &model, window.min, window.max, cov)?,
        None => residuals(&observed, &model, window.min, window.max)?,
    };

    let (basis, fits) = fit_locked(handle, &resid)?;
    let null = match generate_locked(handle, &resid, &basis, cancel) {
        Ok(null) => null,
        Err(ForensicError::Cancelled {
            completed,
            requested,
        }) => {
            warn!(completed, requested, "run cancelled; no verdict produced");
            return Ok(RunOutcome::Cancelled {
                completed,
                requested,
            });
        }
        Err(e) => return Err(e),
    };
    let observed_stats: Vec<Option<f64>> = fits.iter().map(|f| f.statistic()).collect();
    let table = SignificanceTable::compute_locked(handle, &observed_stats, &null)?;

    // ------------------------------------------------------------------
    // Verdict
    // ------------------------------------------------------------------
    let identity = DatasetIdentity::from_admitted(&files.observed, files.model.as_ref());
    let verdict = Verdict::assemble(handle, identity, &resid, &fits, &table)?;
    info!(
        dataset = %verdict.dataset.name,
        passed = verdict.passed,
        best_period = ?verdict.best_period,
        family_p = ?verdict.family_pvalue,
        "verdict reported"
    );
    Ok(RunOutcome::Completed(Box::new(verdict)))
}

/// Run several independent datasets under one locked protocol and assess
/// whether at least `min_passing` of them pass.
pub fn run_replication(
    protocol: &Arc<LockedProtocol>,
    manifest: &Manifest,
    datasets: &[DatasetInputs],
    min_passing: usize,
    cancel: &CancelToken,
) -> Result<ReplicationOutcome> {
    let mut verdicts = Vec::with_capacity(datasets.len());
    for inputs in datasets {
        let mut handle = protocol.open_run();
        match run(&mut handle, manifest, inputs, cancel)? {
            RunOutcome::Completed(verdict) => verdicts.push(*verdict),
            RunOutcome::Cancelled {
                completed,
                requested,
            } => {
                return Ok(ReplicationOutcome::Cancelled {
                    dataset: inputs.observed.clone(),
                    completed,
                    requested,
                });
            }
        }
    }
    let replication = (datasets.len() > 1).then(|| {
        let summary = ReplicationSummary::assess(&verdicts, min_passing);
        info!(
            passing = summary.passing,
            required = summary.required,
            replicated = summary.replicated,
            "replication assessed"
        );
        summary
    });
    Ok(ReplicationOutcome::Completed(RunReport::completed(verdicts, replication)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use comb_core::series::encode_text;
    use comb_core::{
        lock, register, CandidatePeriods, DigestAlgorithm, IndexWindow, MappingMode, NullMethod,
        ProtocolConfig, Whitening,
    };

    use crate::synth::{synthesize, SynthSpec};

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            protocol_version: "pipeline-test".to_string(),
            predicted_period: Some(16),
            period_tolerance: 0,
            n_samples: 99,
            seed: 3,
            alpha: 0.05,
            mapping: MappingMode::Registered,
            registered_fingerprint: None,
            candidate_periods: CandidatePeriods::List(vec![8, 16, 32]),
            index_window: IndexWindow::default(),
            null: NullMethod::LabelPermutation,
        }
    }

    fn signal(seed: u64) -> SpectralSeries {
        synthesize(&SynthSpec {
            points: 512,
            first_index: 2,
            period: 16.0,
            amplitude: 1.0,
            phase: 0.4,
            noise: 0.5,
            seed,
        })
        .unwrap()
    }

    fn write_registered(manifest: &mut Manifest, path: &Path, text: &str) {
        std::fs::write(path, text).unwrap();
        manifest.insert(register(path, DigestAlgorithm::Sha256).unwrap());
    }

    #[test]
    fn test_full_run_reaches_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        let obs = dir.path().join("obs.txt");
        write_registered(&mut manifest, &obs, &encode_text(&signal(1)));

        let mut handle = lock(config()).unwrap();
        let inputs = DatasetInputs::observed(&obs, DatasetFormat::Text);
        let outcome = run(&mut handle, &manifest, &inputs, &CancelToken::new()).unwrap();
        let RunOutcome::Completed(verdict) = outcome else {
            panic!("run did not complete");
        };
        assert_eq!(handle.stage(), Stage::Reported);
        assert!(verdict.passed, "{:?}", verdict.criteria);
        assert_eq!(verdict.best_period, Some(16));
        assert_eq!(verdict.dataset.name, "obs.txt");
        assert_eq!(verdict.dataset.digest, manifest.entries[0].digest);
        assert_eq!(verdict.whitening, Whitening::DiagonalFallback);

        // The handle is spent: a second run is a violation.
        let again = run(&mut handle, &manifest, &inputs, &CancelToken::new());
        assert!(matches!(again, Err(ForensicError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_tampered_file_blocks_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        let obs = dir.path().join("obs.txt");
        write_registered(&mut manifest, &obs, &encode_text(&signal(1)));
        std::fs::write(&obs, encode_text(&signal(2))).unwrap();

        let mut handle = lock(config()).unwrap();
        let inputs = DatasetInputs::observed(&obs, DatasetFormat::Text);
        let err = run(&mut handle, &manifest, &inputs, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ForensicError::Provenance { .. }));
        assert_eq!(handle.stage(), Stage::Locked);
    }

    #[test]
    fn test_unregistered_model_blocks_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        let obs = dir.path().join("obs.txt");
        write_registered(&mut manifest, &obs, &encode_text(&signal(1)));
        let model = dir.path().join("model.txt");
        std::fs::write(&model, "2 0.0 1.0\n").unwrap();

        let mut handle = lock(config()).unwrap();
        let mut inputs = DatasetInputs::observed(&obs, DatasetFormat::Text);
        inputs.model = Some(model);
        let err = run(&mut handle, &manifest, &inputs, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ForensicError::Provenance { .. }));
    }

    #[test]
    fn test_cancelled_run_has_no_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        let obs = dir.path().join("obs.txt");
        write_registered(&mut manifest, &obs, &encode_text(&signal(1)));

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut handle = lock(config()).unwrap();
        let inputs = DatasetInputs::observed(&obs, DatasetFormat::Text);
        let outcome = run(&mut handle, &manifest, &inputs, &cancel).unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Cancelled { requested: 99, .. }
        ));
        assert_eq!(handle.stage(), Stage::DataLoaded);
    }

    #[test]
    fn test_covariance_whitening_used_when_supplied() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        let series = signal(4);
        let obs = dir.path().join("obs.txt");
        write_registered(&mut manifest, &obs, &encode_text(&series));

        let indices: Vec<String> = series.points().iter().map(|p| p.index.to_string()).collect();
        let n = indices.len();
        let mut cov = indices.join(" ");
        cov.push('\n');
        for i in 0..n {
            let row: Vec<&str> = (0..n).map(|j| if i == j { "0.25" } else { "0" }).collect();
            cov.push_str(&row.join(" "));
            cov.push('\n');
        }
        let cov_path = dir.path().join("cov.txt");
        write_registered(&mut manifest, &cov_path, &cov);

        let mut handle = lock(config()).unwrap();
        let mut inputs = DatasetInputs::observed(&obs, DatasetFormat::Text);
        inputs.covariance = Some(cov_path);
        let RunOutcome::Completed(verdict) =
            run(&mut handle, &manifest, &inputs, &CancelToken::new()).unwrap()
        else {
            panic!("run did not complete");
        };
        assert_eq!(verdict.whitening, Whitening::Cholesky);
        assert!(!verdict.warnings.iter().any(|w| w.contains("diagonal")));
        assert_eq!(verdict.best_period, Some(16));
    }

    #[test]
    fn test_zero_samples_is_an_error_not_a_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        let obs = dir.path().join("obs.txt");
        write_registered(&mut manifest, &obs, &encode_text(&signal(1)));

        let mut cfg = config();
        cfg.n_samples = 0;
        let mut handle = lock(cfg).unwrap();
        let inputs = DatasetInputs::observed(&obs, DatasetFormat::Text);
        let err = run(&mut handle, &manifest, &inputs, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ForensicError::InsufficientNullSamples));
    }

    #[test]
    fn test_replication_over_two_datasets() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        write_registered(&mut manifest, &a, &encode_text(&signal(10)));
        write_registered(&mut manifest, &b, &encode_text(&signal(11)));

        let handle = lock(config()).unwrap();
        let datasets = [
            DatasetInputs::observed(&a, DatasetFormat::Text),
            DatasetInputs::observed(&b, DatasetFormat::Text),
        ];
        let outcome =
            run_replication(handle.protocol(), &manifest, &datasets, 2, &CancelToken::new())
                .unwrap();
        let ReplicationOutcome::Completed(report) = outcome else {
            panic!("replication cancelled");
        };
        assert_eq!(report.verdicts.len(), 2);
        let summary = report.replication.unwrap();
        assert!(summary.replicated);
        assert_eq!(summary.fingerprints.len(), 1);
    }
}
