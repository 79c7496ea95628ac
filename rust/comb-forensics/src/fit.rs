/// Periodic (comb) template fit to spectral residuals.
///
/// For each candidate period Δ the residuals are regressed on a sine/cosine
/// pair at the multipole index i:
///
///   r_i ≈ a·sin(2πi/Δ) + b·cos(2πi/Δ) = A·sin(2πi/Δ + φ)
///
/// with A = √(a² + b²), φ = atan2(b, a). The linear form avoids nonlinear
/// optimisation, so the fit is exact and deterministic. The test statistic
/// is the chi-square improvement Δχ² = χ²(A = 0) − χ²(fit).

use std::f64::consts::TAU;
use std::fmt;

use comb_core::{ProtocolHandle, ResidualSeries, Result, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fewer points than this in the window and a period is skipped.
pub const MIN_FIT_POINTS: usize = 4;

/// Relative determinant below which the sine/cosine columns are collinear.
const DEGENERATE_DET: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Why a period produced no statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientData { points: usize },
    /// Sine and cosine columns are collinear on these indices (e.g. Δ ≤ 2).
    DegenerateBasis,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InsufficientData { points } => write!(
                f,
                "insufficient data: {points} points in window, need at least {MIN_FIT_POINTS}"
            ),
            SkipReason::DegenerateBasis => {
                write!(f, "degenerate basis: sine and cosine are collinear at this period")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FitOutcome {
    Fit {
        amplitude: f64,
        /// Radians in [0, 2π).
        phase: f64,
        delta_chi2: f64,
    },
    Skipped { reason: SkipReason },
}

/// Fit of one candidate period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub period: u32,
    pub outcome: FitOutcome,
}

impl FitResult {
    /// Δχ², or `None` when the period was skipped.
    pub fn statistic(&self) -> Option<f64> {
        match self.outcome {
            FitOutcome::Fit { delta_chi2, .. } => Some(delta_chi2),
            FitOutcome::Skipped { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Precomputed basis
// ---------------------------------------------------------------------------

/// Sine/cosine tables and normal-matrix entries for one period.
#[derive(Debug, Clone)]
struct PeriodColumn {
    period: u32,
    sin: Vec<f64>,
    cos: Vec<f64>,
    sss: f64,
    ssc: f64,
    scc: f64,
    det: f64,
    skip: Option<SkipReason>,
}

impl PeriodColumn {
    fn new(indices: &[u32], period: u32) -> Self {
        let n = indices.len();
        let omega = TAU / period as f64;
        let mut sin = Vec::with_capacity(n);
        let mut cos = Vec::with_capacity(n);
        for &i in indices {
            // Reduce the index first so large multipoles keep full phase precision.
            let x = omega * (i % period) as f64;
            sin.push(x.sin());
            cos.push(x.cos());
        }
        let sss: f64 = sin.iter().map(|s| s * s).sum();
        let scc: f64 = cos.iter().map(|c| c * c).sum();
        let ssc: f64 = sin.iter().zip(&cos).map(|(s, c)| s * c).sum();
        let det = sss * scc - ssc * ssc;

        let skip = if n < MIN_FIT_POINTS {
            Some(SkipReason::InsufficientData { points: n })
        } else {
            let scale = 0.5 * (sss + scc);
            if det <= DEGENERATE_DET * scale * scale {
                Some(SkipReason::DegenerateBasis)
            } else {
                None
            }
        };

        PeriodColumn { period, sin, cos, sss, ssc, scc, det, skip }
    }

    fn fit(&self, values: &[f64]) -> FitResult {
        if let Some(reason) = self.skip {
            return FitResult {
                period: self.period,
                outcome: FitOutcome::Skipped { reason },
            };
        }
        let mut srs = 0.0;
        let mut src = 0.0;
        for ((r, s), c) in values.iter().zip(&self.sin).zip(&self.cos) {
            srs += r * s;
            src += r * c;
        }
        let a = (srs * self.scc - src * self.ssc) / self.det;
        let b = (src * self.sss - srs * self.ssc) / self.det;
        // At the least-squares solution χ²(0) − χ²(fit) = a·Σrs + b·Σrc.
        let delta_chi2 = (a * srs + b * src).max(0.0);

        let mut phase = b.atan2(a);
        if phase < 0.0 {
            phase += TAU;
        }
        if phase >= TAU {
            phase = 0.0;
        }
        FitResult {
            period: self.period,
            outcome: FitOutcome::Fit {
                amplitude: a.hypot(b),
                phase,
                delta_chi2,
            },
        }
    }
}

/// Basis tables for a fixed index set and candidate period list.
///
/// Surrogate series keep their index positions, so one basis serves the
/// observed fit and every null draw.
#[derive(Debug, Clone)]
pub struct CombBasis {
    n_points: usize,
    columns: Vec<PeriodColumn>,
}

impl CombBasis {
    pub fn new(indices: &[u32], periods: &[u32]) -> Self {
        let columns = periods
            .par_iter()
            .map(|&p| PeriodColumn::new(indices, p))
            .collect();
        CombBasis {
            n_points: indices.len(),
            columns,
        }
    }

    pub fn periods(&self) -> Vec<u32> {
        self.columns.iter().map(|c| c.period).collect()
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }

    /// Sequential fit over all periods, for use inside a parallel region.
    pub fn fit_values(&self, values: &[f64]) -> Vec<FitResult> {
        debug_assert_eq!(values.len(), self.n_points);
        self.columns.iter().map(|c| c.fit(values)).collect()
    }

    /// Parallel fit over periods.
    pub fn fit_values_parallel(&self, values: &[f64]) -> Vec<FitResult> {
        debug_assert_eq!(values.len(), self.n_points);
        self.columns.par_iter().map(|c| c.fit(values)).collect()
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Fit every candidate period to the residuals. Output follows `periods` order.
pub fn fit(residuals: &ResidualSeries, periods: &[u32]) -> Vec<FitResult> {
    fit_with_basis(&CombBasis::new(&residuals.indices, periods), residuals)
}

/// Fit the locked candidate periods. The run must sit at
/// [`Stage::DataLoaded`]; the basis is returned for the null stage.
pub fn fit_locked(
    handle: &mut ProtocolHandle,
    residuals: &ResidualSeries,
) -> Result<(CombBasis, Vec<FitResult>)> {
    handle.check(Stage::DataLoaded)?;
    let basis = CombBasis::new(&residuals.indices, handle.protocol().periods());
    let fits = fit_with_basis(&basis, residuals);
    Ok((basis, fits))
}

/// As [`fit`], reusing a basis built for the residuals' index set.
pub fn fit_with_basis(basis: &CombBasis, residuals: &ResidualSeries) -> Vec<FitResult> {
    let results = basis.fit_values_parallel(&residuals.values);
    for r in &results {
        match r.outcome {
            FitOutcome::Fit { amplitude, delta_chi2, .. } => {
                debug!(period = r.period, amplitude, delta_chi2, "period fitted");
            }
            FitOutcome::Skipped { reason } => {
                debug!(period = r.period, %reason, "period skipped");
            }
        }
    }
    results
}
