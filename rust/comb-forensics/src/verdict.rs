//! Terminal, audit-ready run artifacts.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use comb_core::{
    AdmittedFile, ForensicError, MappingMode, NullMethod, ProtocolHandle, Registration,
    ResidualSeries, Result, Stage, Whitening,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fit::{FitOutcome, FitResult};
use crate::significance::SignificanceTable;

/// Which files a verdict is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetIdentity {
    pub name: String,
    pub algorithm: String,
    pub digest: String,
    pub model: Option<String>,
    pub model_digest: Option<String>,
}

impl DatasetIdentity {
    pub fn from_admitted(observed: &AdmittedFile, model: Option<&AdmittedFile>) -> Self {
        let name_of = |f: &AdmittedFile| {
            f.path()
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("<dataset>")
                .to_string()
        };
        DatasetIdentity {
            name: name_of(observed),
            algorithm: observed.algorithm().to_string(),
            digest: observed.digest().to_string(),
            model: model.map(name_of),
            model_digest: model.map(|m| m.digest().to_string()),
        }
    }
}

/// One row of the per-period table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodRow {
    pub period: u32,
    pub fitted: bool,
    pub amplitude: Option<f64>,
    pub phase: Option<f64>,
    pub delta_chi2: Option<f64>,
    pub local_p: Option<f64>,
    pub maxstat_p: Option<f64>,
    pub fdr_q: Option<f64>,
    pub fdr_rejected: bool,
    /// Human-readable reason whenever the period was not scored.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub passed: bool,
    pub reason: String,
}

impl Criterion {
    fn new(name: &str, passed: bool, reason: String) -> Self {
        Criterion {
            name: name.to_string(),
            passed,
            reason,
        }
    }
}

/// Final result of one dataset under one locked protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub protocol_version: String,
    pub protocol_fingerprint: String,
    pub registration: Registration,
    pub mapping: MappingMode,
    pub dataset: DatasetIdentity,
    pub seed: u64,
    pub null_method: String,
    pub n_samples: usize,
    pub alpha: f64,
    pub whitening: Whitening,
    pub n_points: usize,
    pub periods: Vec<PeriodRow>,
    pub best_period: Option<u32>,
    pub family_pvalue: Option<f64>,
    pub criteria: Vec<Criterion>,
    pub warnings: Vec<String>,
    pub passed: bool,
    pub tool_version: String,
    /// RFC 3339, UTC. The only field that differs between identical reruns.
    pub generated_at: String,
}

impl Verdict {
    /// Build the verdict from the fit results and significance table.
    ///
    /// The run must sit at [`Stage::Analyzed`] with fits for exactly the
    /// locked periods; on success it moves to [`Stage::Reported`].
    pub fn assemble(
        handle: &mut ProtocolHandle,
        dataset: DatasetIdentity,
        residuals: &ResidualSeries,
        fits: &[FitResult],
        table: &SignificanceTable,
    ) -> Result<Verdict> {
        handle.check(Stage::Analyzed)?;
        let fitted: Vec<u32> = fits.iter().map(|f| f.period).collect();
        handle.check_periods(&fitted)?;
        let protocol = Arc::clone(handle.protocol());
        let params = protocol.params();

        let periods: Vec<PeriodRow> = fits
            .iter()
            .zip(&table.targets)
            .map(|(fit, sig)| match fit.outcome {
                FitOutcome::Fit { amplitude, phase, delta_chi2 } => PeriodRow {
                    period: fit.period,
                    fitted: true,
                    amplitude: Some(amplitude),
                    phase: Some(phase),
                    delta_chi2: Some(delta_chi2),
                    local_p: sig.local_p,
                    maxstat_p: sig.maxstat_p,
                    fdr_q: sig.fdr_q,
                    fdr_rejected: sig.fdr_rejected,
                    reason: None,
                },
                FitOutcome::Skipped { reason } => PeriodRow {
                    period: fit.period,
                    fitted: false,
                    amplitude: None,
                    phase: None,
                    delta_chi2: None,
                    local_p: None,
                    maxstat_p: None,
                    fdr_q: None,
                    fdr_rejected: false,
                    reason: Some(reason.to_string()),
                },
            })
            .collect();

        let best_period = table
            .best_target
            .and_then(|t| fits.get(t))
            .map(|f| f.period);

        let mut criteria = Vec::new();
        criteria.push(match table.family_pvalue {
            Some(p) => Criterion::new(
                "family_wise_significance",
                p <= params.alpha,
                format!("max-statistic p = {p:.4} against alpha = {}", params.alpha),
            ),
            None => Criterion::new(
                "family_wise_significance",
                false,
                "no candidate period could be scored".to_string(),
            ),
        });

        if let Some(predicted) = params.predicted_period {
            criteria.push(match periods.iter().find(|r| r.period == predicted) {
                None => Criterion::new(
                    "predicted_period_significance",
                    false,
                    format!("predicted period {predicted} is not a candidate period"),
                ),
                Some(row) => match (row.local_p, &row.reason) {
                    (Some(p), _) => Criterion::new(
                        "predicted_period_significance",
                        p <= params.alpha,
                        format!("local p = {p:.4} at period {predicted}"),
                    ),
                    (None, Some(reason)) => Criterion::new(
                        "predicted_period_significance",
                        false,
                        format!("period {predicted} skipped: {reason}"),
                    ),
                    (None, None) => Criterion::new(
                        "predicted_period_significance",
                        false,
                        format!("period {predicted} has no usable null samples"),
                    ),
                },
            });

            criteria.push(match best_period {
                Some(best) => {
                    let offset = best.abs_diff(predicted);
                    Criterion::new(
                        "best_period_location",
                        offset <= params.period_tolerance,
                        format!(
                            "best period {best} is {offset} from predicted {predicted} (tolerance {})",
                            params.period_tolerance
                        ),
                    )
                }
                None => Criterion::new(
                    "best_period_location",
                    false,
                    "no best period: every candidate was skipped".to_string(),
                ),
            });
        }

        let skipped: Vec<String> = periods
            .iter()
            .filter_map(|r| r.reason.as_ref().map(|why| format!("{} ({why})", r.period)))
            .collect();
        criteria.push(if skipped.is_empty() {
            Criterion::new("coverage", true, "every candidate period was scored".to_string())
        } else {
            Criterion::new(
                "coverage",
                false,
                format!("skipped periods: {}", skipped.join(", ")),
            )
        });

        let mut warnings = protocol.warnings();
        if residuals.whitening == Whitening::DiagonalFallback {
            warnings.push(
                "no covariance supplied: diagonal errors understate correlated uncertainty"
                    .to_string(),
            );
        }
        if !residuals.uncertainty_supplied {
            warnings.push(
                "observed spectrum had no uncertainty column: unit uncertainties assumed"
                    .to_string(),
            );
        }
        if let NullMethod::SegmentPermutation { segment_len } = params.null {
            if segment_len >= residuals.len() {
                warnings.push(format!(
                    "segment length {segment_len} covers all {} residual points: every surrogate equals the observed series, so p = 1",
                    residuals.len()
                ));
            }
        }

        let passed = criteria.iter().all(|c| c.passed);

        let verdict = Verdict {
            protocol_version: params.protocol_version.clone(),
            protocol_fingerprint: protocol.fingerprint().to_string(),
            registration: protocol.registration(),
            mapping: params.mapping,
            dataset,
            seed: params.seed,
            null_method: params.null.to_string(),
            n_samples: params.n_samples,
            alpha: params.alpha,
            whitening: residuals.whitening,
            n_points: residuals.len(),
            periods,
            best_period,
            family_pvalue: table.family_pvalue,
            criteria,
            warnings,
            passed,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: Utc::now().to_rfc3339(),
        };
        handle.advance(Stage::Reported)?;
        Ok(verdict)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ForensicError::Report {
            detail: e.to_string(),
        })
    }

    /// Per-period table, one row per candidate period.
    pub fn to_csv(&self) -> String {
        let mut out = String::from(
            "dataset,period,fitted,amplitude,phase,delta_chi2,local_p,maxstat_p,fdr_q,fdr_rejected,reason\n",
        );
        let cell = |v: Option<f64>| v.map(|x| format!("{x:.10e}")).unwrap_or_default();
        for row in &self.periods {
            let _ = writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{}",
                csv_escape(&self.dataset.name),
                row.period,
                row.fitted,
                cell(row.amplitude),
                cell(row.phase),
                cell(row.delta_chi2),
                cell(row.local_p),
                cell(row.maxstat_p),
                cell(row.fdr_q),
                row.fdr_rejected,
                csv_escape(row.reason.as_deref().unwrap_or("")),
            );
        }
        out
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Does the signal replicate across independent datasets?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSummary {
    pub datasets: usize,
    pub passing: usize,
    pub required: usize,
    pub replicated: bool,
    pub per_dataset: Vec<(String, bool)>,
    /// Distinct fingerprints; more than one means the datasets were not run
    /// under the same protocol and the replication claim is void.
    pub fingerprints: Vec<String>,
}

impl ReplicationSummary {
    pub fn assess(verdicts: &[Verdict], required: usize) -> Self {
        let mut fingerprints: Vec<String> =
            verdicts.iter().map(|v| v.protocol_fingerprint.clone()).collect();
        fingerprints.sort();
        fingerprints.dedup();
        let passing = verdicts.iter().filter(|v| v.passed).count();
        ReplicationSummary {
            datasets: verdicts.len(),
            passing,
            required,
            replicated: fingerprints.len() == 1 && required > 0 && passing >= required,
            per_dataset: verdicts
                .iter()
                .map(|v| (v.dataset.name.clone(), v.passed))
                .collect(),
            fingerprints,
        }
    }
}

/// How a run ended. Anything but `Completed` carries no verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    ProvenanceFailure,
    ProtocolViolation,
    /// Malformed input, configuration or numerical failure.
    Failed,
}

impl RunStatus {
    pub fn for_error(err: &ForensicError) -> Self {
        match err {
            ForensicError::Provenance { .. } => RunStatus::ProvenanceFailure,
            ForensicError::ProtocolViolation { .. } => RunStatus::ProtocolViolation,
            ForensicError::Cancelled { .. } => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }
}

/// Everything a run writes to disk, whether or not it completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    /// Why the run stopped; `None` only when it completed.
    pub reason: Option<String>,
    pub verdicts: Vec<Verdict>,
    pub replication: Option<ReplicationSummary>,
}

impl RunReport {
    pub fn completed(verdicts: Vec<Verdict>, replication: Option<ReplicationSummary>) -> Self {
        RunReport {
            status: RunStatus::Completed,
            reason: None,
            verdicts,
            replication,
        }
    }

    /// A run that stopped early. No verdict is ever attached.
    pub fn stopped(status: RunStatus, reason: impl Into<String>) -> Self {
        RunReport {
            status,
            reason: Some(reason.into()),
            verdicts: Vec::new(),
            replication: None,
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ForensicError::Report {
            detail: e.to_string(),
        })?;
        write_with_parent(path, json.as_bytes())?;
        info!(path = %path.display(), "report written");
        Ok(())
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut csv = String::new();
        for (i, verdict) in self.verdicts.iter().enumerate() {
            let table = verdict.to_csv();
            if i == 0 {
                csv.push_str(&table);
            } else if let Some((_, rows)) = table.split_once('\n') {
                csv.push_str(rows);
            }
        }
        write_with_parent(path, csv.as_bytes())
    }
}

fn write_with_parent(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| ForensicError::io(parent, e))?;
        }
    }
    std::fs::write(path, bytes).map_err(|e| ForensicError::io(path, e))
}
