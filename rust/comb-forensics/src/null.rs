/// Null-hypothesis surrogates and the resulting null distributions.
///
/// Three surrogate families:
///   - label permutation: residual values shuffled across index positions
///   - phase randomization: Fourier magnitudes kept, phases redrawn
///   - segment permutation: contiguous blocks of residuals reordered
///
/// Draw i is generated from `StdRng::seed_from_u64(base_seed + i)` so the
/// distribution is identical for any thread count or scheduling order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use comb_core::{
    CancelToken, ForensicError, NullMethod, ProtocolHandle, ResidualSeries, Result, Stage,
};
use num_complex::Complex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fit::CombBasis;
use crate::significance::exceedance_pvalue;

// ---------------------------------------------------------------------------
// Statistics evaluated on each surrogate
// ---------------------------------------------------------------------------

/// A statistic computed on the observed series and on every surrogate.
///
/// Returns one value per target (period, group, ...); `None` marks a target
/// that cannot be scored on this index set.
pub trait NullStatistic: Sync {
    fn evaluate(&self, values: &[f64]) -> Vec<Option<f64>>;
}

impl NullStatistic for CombBasis {
    fn evaluate(&self, values: &[f64]) -> Vec<Option<f64>> {
        self.fit_values(values).iter().map(|f| f.statistic()).collect()
    }
}

// ---------------------------------------------------------------------------
// Surrogate generation
// ---------------------------------------------------------------------------

/// Forward/inverse plans for one series length.
struct PhasePlan {
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

/// Produces surrogate residual vectors for one method and series length.
pub struct SurrogateGenerator {
    method: NullMethod,
    plan: Option<PhasePlan>,
}

impl SurrogateGenerator {
    pub fn new(method: NullMethod, len: usize) -> Self {
        let plan = match method {
            NullMethod::PhaseRandomization if len > 0 => {
                let mut planner = FftPlanner::<f64>::new();
                Some(PhasePlan {
                    forward: planner.plan_fft_forward(len),
                    inverse: planner.plan_fft_inverse(len),
                })
            }
            _ => None,
        };
        SurrogateGenerator { method, plan }
    }

    pub fn draw(&self, values: &[f64], rng: &mut StdRng) -> Vec<f64> {
        match self.method {
            NullMethod::LabelPermutation => {
                let mut out = values.to_vec();
                out.shuffle(rng);
                out
            }
            NullMethod::PhaseRandomization => match &self.plan {
                Some(plan) => phase_randomize(values, plan, rng),
                None => values.to_vec(),
            },
            NullMethod::SegmentPermutation { segment_len } => {
                let mut segments: Vec<&[f64]> = values.chunks(segment_len.max(1)).collect();
                segments.shuffle(rng);
                segments.concat()
            }
        }
    }
}

/// Keep |X_k|, draw uniform phases for 0 < k < n/2 with Hermitian symmetry.
/// DC and (for even n) Nyquist terms are real and left untouched.
fn phase_randomize(values: &[f64], plan: &PhasePlan, rng: &mut StdRng) -> Vec<f64> {
    let n = values.len();
    if n < 3 {
        return values.to_vec();
    }
    let mut spec: Vec<Complex<f64>> = values.iter().map(|&r| Complex::new(r, 0.0)).collect();
    plan.forward.process(&mut spec);

    let half = (n - 1) / 2;
    for k in 1..=half {
        let mag = spec[k].norm();
        let theta: f64 = rng.gen::<f64>() * std::f64::consts::TAU;
        spec[k] = Complex::from_polar(mag, theta);
        spec[n - k] = spec[k].conj();
    }

    plan.inverse.process(&mut spec);
    let scale = 1.0 / n as f64;
    spec.iter().map(|c| c.re * scale).collect()
}

// ---------------------------------------------------------------------------
// Null distribution
// ---------------------------------------------------------------------------

/// How to build a null distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullSpec {
    pub method: NullMethod,
    pub base_seed: u64,
    pub n_samples: usize,
}

/// N surrogate draws, each holding one statistic per target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullDistribution {
    pub method: NullMethod,
    pub base_seed: u64,
    pub n_targets: usize,
    pub draws: Vec<Vec<Option<f64>>>,
}

impl NullDistribution {
    pub fn n_samples(&self) -> usize {
        self.draws.len()
    }

    /// Null values for one target, skipping draws where it was unscored.
    pub fn column(&self, target: usize) -> Vec<f64> {
        self.draws
            .iter()
            .filter_map(|d| d.get(target).copied().flatten())
            .collect()
    }

    /// Per-draw maximum over all targets: the look-elsewhere null.
    pub fn maxima(&self) -> Vec<f64> {
        self.draws
            .iter()
            .filter_map(|d| d.iter().flatten().copied().reduce(f64::max))
            .collect()
    }
}

/// Null distribution of Δχ² for every candidate period.
pub fn generate(
    residuals: &ResidualSeries,
    spec: &NullSpec,
    periods: &[u32],
    cancel: &CancelToken,
) -> Result<NullDistribution> {
    let basis = CombBasis::new(&residuals.indices, periods);
    generate_with(residuals, spec, &basis, cancel)
}

/// Null distribution under the locked method, seed and draw count.
///
/// The run must sit at [`Stage::DataLoaded`] and `basis` must cover exactly
/// the locked periods.
pub fn generate_locked(
    handle: &mut ProtocolHandle,
    residuals: &ResidualSeries,
    basis: &CombBasis,
    cancel: &CancelToken,
) -> Result<NullDistribution> {
    handle.check(Stage::DataLoaded)?;
    handle.check_periods(&basis.periods())?;
    let params = handle.protocol().params();
    let spec = NullSpec {
        method: params.null,
        base_seed: params.seed,
        n_samples: params.n_samples,
    };
    if let NullMethod::SegmentPermutation { segment_len } = spec.method {
        if segment_len >= residuals.len() {
            warn!(
                segment_len,
                points = residuals.len(),
                "single segment: every surrogate equals the observed series"
            );
        }
    }
    generate_with(residuals, &spec, basis, cancel)
}

/// Null distribution of an arbitrary statistic.
pub fn generate_with<S: NullStatistic>(
    residuals: &ResidualSeries,
    spec: &NullSpec,
    statistic: &S,
    cancel: &CancelToken,
) -> Result<NullDistribution> {
    let generator = SurrogateGenerator::new(spec.method, residuals.len());
    let completed = AtomicUsize::new(0);
    let n_targets = statistic.evaluate(&residuals.values).len();

    info!(
        method = %spec.method,
        samples = spec.n_samples,
        seed = spec.base_seed,
        points = residuals.len(),
        "generating null distribution"
    );

    let draws: Option<Vec<Vec<Option<f64>>>> = (0..spec.n_samples)
        .into_par_iter()
        .map(|i| {
            if cancel.is_cancelled() {
                return None;
            }
            let mut rng = StdRng::seed_from_u64(spec.base_seed.wrapping_add(i as u64));
            let surrogate = generator.draw(&residuals.values, &mut rng);
            let stats = statistic.evaluate(&surrogate);
            completed.fetch_add(1, Ordering::Relaxed);
            Some(stats)
        })
        .collect();

    match draws {
        Some(draws) => Ok(NullDistribution {
            method: spec.method,
            base_seed: spec.base_seed,
            n_targets,
            draws,
        }),
        None => {
            let done = completed.load(Ordering::Relaxed);
            warn!(completed = done, requested = spec.n_samples, "null generation cancelled");
            Err(ForensicError::Cancelled {
                completed: done,
                requested: spec.n_samples,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Binary partition test (label permutation)
// ---------------------------------------------------------------------------

/// Which indices form the labelled group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// Prime indices against composite (and 0, 1) indices.
    Primes,
    /// Explicit member list.
    Members(Vec<u32>),
}

impl Partition {
    pub fn contains(&self, index: u32) -> bool {
        match self {
            Partition::Primes => is_prime_u32(index),
            Partition::Members(list) => list.contains(&index),
        }
    }
}

fn is_prime_u32(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let n = n as u64;
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// |mean(labelled) − mean(unlabelled)| for a fixed labelling of positions.
#[derive(Debug, Clone)]
pub struct PartitionStatistic {
    labels: Vec<bool>,
}

impl PartitionStatistic {
    pub fn new(indices: &[u32], partition: &Partition) -> Self {
        PartitionStatistic {
            labels: indices.iter().map(|&i| partition.contains(i)).collect(),
        }
    }

    pub fn group_sizes(&self) -> (usize, usize) {
        let inside = self.labels.iter().filter(|&&l| l).count();
        (inside, self.labels.len() - inside)
    }
}

impl NullStatistic for PartitionStatistic {
    fn evaluate(&self, values: &[f64]) -> Vec<Option<f64>> {
        let (mut sum_in, mut n_in, mut sum_out, mut n_out) = (0.0, 0usize, 0.0, 0usize);
        for (&v, &label) in values.iter().zip(&self.labels) {
            if label {
                sum_in += v;
                n_in += 1;
            } else {
                sum_out += v;
                n_out += 1;
            }
        }
        if n_in == 0 || n_out == 0 {
            return vec![None];
        }
        vec![Some((sum_in / n_in as f64 - sum_out / n_out as f64).abs())]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionTestResult {
    pub partition: Partition,
    pub labelled: usize,
    pub unlabelled: usize,
    /// `None` when one group is empty.
    pub observed: Option<f64>,
    pub p_value: Option<f64>,
    pub n_samples: usize,
}

/// Is the group difference explainable by an arbitrary labelling?
pub fn partition_test(
    residuals: &ResidualSeries,
    partition: &Partition,
    base_seed: u64,
    n_samples: usize,
    cancel: &CancelToken,
) -> Result<PartitionTestResult> {
    let statistic = PartitionStatistic::new(&residuals.indices, partition);
    let (labelled, unlabelled) = statistic.group_sizes();
    let observed = statistic.evaluate(&residuals.values)[0];
    let spec = NullSpec {
        method: NullMethod::LabelPermutation,
        base_seed,
        n_samples,
    };
    let null = generate_with(residuals, &spec, &statistic, cancel)?;
    let p_value = match observed {
        Some(obs) => Some(exceedance_pvalue(obs, &null.column(0))?),
        None => None,
    };
    Ok(PartitionTestResult {
        partition: partition.clone(),
        labelled,
        unlabelled,
        observed,
        p_value,
        n_samples,
    })
}
