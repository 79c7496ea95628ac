//! Observed statistics against their null distribution.
//!
//! All Monte Carlo p-values use the bias-corrected `(count + 1) / (N + 1)`
//! form, so a finite null never yields p = 0.

use std::cmp::Ordering;

use comb_core::{ForensicError, ProtocolHandle, Result, Stage};
use serde::{Deserialize, Serialize};

use crate::null::NullDistribution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PValueMode {
    /// Pointwise, one target at a time.
    Local,
    /// Against per-draw maxima over all targets (look-elsewhere corrected).
    #[serde(rename = "maxstat")]
    MaxStat,
    /// Benjamini–Hochberg adjusted local p-value.
    Fdr,
}

/// `(#{null ≥ observed} + 1) / (N + 1)`.
pub fn exceedance_pvalue(observed: f64, null: &[f64]) -> Result<f64> {
    if null.is_empty() {
        return Err(ForensicError::InsufficientNullSamples);
    }
    let exceed = null.iter().filter(|&&x| x >= observed).count();
    Ok((exceed + 1) as f64 / (null.len() + 1) as f64)
}

/// Pointwise p-value of `observed` against the null column of `target`.
pub fn local_pvalue(observed: f64, null: &NullDistribution, target: usize) -> Result<f64> {
    if null.n_samples() == 0 {
        return Err(ForensicError::InsufficientNullSamples);
    }
    exceedance_pvalue(observed, &null.column(target))
}

/// Family-wise p-value of `observed` against the per-draw maxima.
pub fn maxstat_pvalue(observed: f64, null: &NullDistribution) -> Result<f64> {
    if null.n_samples() == 0 {
        return Err(ForensicError::InsufficientNullSamples);
    }
    exceedance_pvalue(observed, &null.maxima())
}

/// Benjamini–Hochberg outcome for one family of hypotheses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FdrOutcome {
    pub alpha: f64,
    /// Adjusted p-values, in input order.
    pub q_values: Vec<f64>,
    /// Rejection flags, in input order.
    pub rejected: Vec<bool>,
    /// Number of rejected hypotheses (the step-up k).
    pub k: usize,
}

/// Sort ascending, take the largest k with p_(k) ≤ (k/m)·α, reject 1..k.
pub fn benjamini_hochberg(pvalues: &[f64], alpha: f64) -> FdrOutcome {
    let m = pvalues.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| {
        pvalues[i]
            .partial_cmp(&pvalues[j])
            .unwrap_or(Ordering::Equal)
            .then(i.cmp(&j))
    });

    let mut k = 0;
    for (rank0, &idx) in order.iter().enumerate() {
        let rank = rank0 + 1;
        if pvalues[idx] <= rank as f64 * alpha / m as f64 {
            k = rank;
        }
    }

    let mut q_values = vec![1.0; m];
    let mut running = 1.0_f64;
    for (rank0, &idx) in order.iter().enumerate().rev() {
        let adjusted = (pvalues[idx] * m as f64 / (rank0 + 1) as f64).min(1.0);
        running = running.min(adjusted);
        q_values[idx] = running;
    }

    let mut rejected = vec![false; m];
    for &idx in &order[..k] {
        rejected[idx] = true;
    }

    FdrOutcome {
        alpha,
        q_values,
        rejected,
        k,
    }
}

/// One p-value for `target` under `mode`.
///
/// `observed` holds the observed statistic of every target (`None` =
/// skipped). Returns `Ok(None)` when the target itself was skipped.
pub fn pvalue(
    observed: &[Option<f64>],
    null: &NullDistribution,
    target: usize,
    mode: PValueMode,
) -> Result<Option<f64>> {
    if null.n_samples() == 0 {
        return Err(ForensicError::InsufficientNullSamples);
    }
    let Some(stat) = observed.get(target).copied().flatten() else {
        return Ok(None);
    };
    match mode {
        PValueMode::Local => local_pvalue(stat, null, target).map(Some),
        PValueMode::MaxStat => maxstat_pvalue(stat, null).map(Some),
        PValueMode::Fdr => {
            let table = SignificanceTable::compute(observed, null, 0.05)?;
            Ok(table.targets[target].fdr_q)
        }
    }
}

/// Significance of a single target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetSignificance {
    pub observed: Option<f64>,
    pub local_p: Option<f64>,
    pub maxstat_p: Option<f64>,
    pub fdr_q: Option<f64>,
    pub fdr_rejected: bool,
}

/// Local, max-statistic and FDR values for every target of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceTable {
    pub targets: Vec<TargetSignificance>,
    /// Position of the largest observed statistic.
    pub best_target: Option<usize>,
    /// Max-statistic p-value of the best observed statistic.
    pub family_pvalue: Option<f64>,
    pub fdr: FdrOutcome,
}

impl SignificanceTable {
    /// Score against a null drawn under the locked protocol, at its alpha.
    /// Closes the analysis: the run moves to [`Stage::Analyzed`].
    pub fn compute_locked(
        handle: &mut ProtocolHandle,
        observed: &[Option<f64>],
        null: &NullDistribution,
    ) -> Result<Self> {
        handle.check(Stage::DataLoaded)?;
        handle.check_null(null.method, null.base_seed, null.n_samples())?;
        let table = Self::compute(observed, null, handle.protocol().params().alpha)?;
        handle.advance(Stage::Analyzed)?;
        Ok(table)
    }

    pub fn compute(observed: &[Option<f64>], null: &NullDistribution, alpha: f64) -> Result<Self> {
        if null.n_samples() == 0 {
            return Err(ForensicError::InsufficientNullSamples);
        }
        let maxima = null.maxima();

        let mut targets = Vec::with_capacity(observed.len());
        for (t, obs) in observed.iter().enumerate() {
            let (local_p, maxstat_p) = match obs {
                Some(stat) => {
                    let column = null.column(t);
                    let local = if column.is_empty() {
                        None
                    } else {
                        Some(exceedance_pvalue(*stat, &column)?)
                    };
                    let maxstat = if maxima.is_empty() {
                        None
                    } else {
                        Some(exceedance_pvalue(*stat, &maxima)?)
                    };
                    (local, maxstat)
                }
                None => (None, None),
            };
            targets.push(TargetSignificance {
                observed: *obs,
                local_p,
                maxstat_p,
                fdr_q: None,
                fdr_rejected: false,
            });
        }

        // FDR runs over the targets that have a local p-value.
        let scored: Vec<usize> = (0..targets.len())
            .filter(|&t| targets[t].local_p.is_some())
            .collect();
        let pvals: Vec<f64> = scored.iter().filter_map(|&t| targets[t].local_p).collect();
        let fdr = benjamini_hochberg(&pvals, alpha);
        for (slot, &t) in scored.iter().enumerate() {
            targets[t].fdr_q = Some(fdr.q_values[slot]);
            targets[t].fdr_rejected = fdr.rejected[slot];
        }

        let best_target = observed
            .iter()
            .enumerate()
            .filter_map(|(t, o)| o.map(|v| (t, v)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(t, _)| t);
        let family_pvalue = best_target.and_then(|t| targets[t].maxstat_p);

        Ok(SignificanceTable {
            targets,
            best_target,
            family_pvalue,
            fdr,
        })
    }
}
