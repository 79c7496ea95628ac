//! Calibration and scaling study for the comb significance pipeline.
//!
//! Runs pure-noise realizations through fit, null and significance for each
//! surrogate family, reporting the empirical family-wise false-positive rate
//! next to the nominal alpha, then times null generation as the series
//! length and draw count grow.

use std::time::Instant;

use comb_core::{CancelToken, NullMethod, ResidualSeries};
use comb_forensics::fit::{fit_with_basis, CombBasis};
use comb_forensics::null::{generate_with, NullSpec};
use comb_forensics::significance::SignificanceTable;
use comb_forensics::synth::{synthesize, SynthSpec};
use serde::Serialize;

const PERIODS: [u32; 6] = [8, 16, 32, 64, 128, 255];
const ALPHA: f64 = 0.05;

#[derive(Debug, Serialize)]
struct CalibrationRow {
    method: String,
    realizations: usize,
    n_samples: usize,
    false_positives: usize,
    rate: f64,
    /// Largest achievable rate for this N: floor(alpha (N+1)) / (N+1).
    nominal: f64,
}

#[derive(Debug, Serialize)]
struct TimingRow {
    method: String,
    points: u32,
    n_samples: usize,
    millis: f64,
}

fn noise_residuals(points: u32, seed: u64) -> Option<ResidualSeries> {
    let series = synthesize(&SynthSpec::null(points, 1.0, seed)).ok()?;
    let indices = series.points().iter().map(|p| p.index).collect();
    let values = series.points().iter().map(|p| p.value).collect();
    Some(ResidualSeries::from_values(indices, values))
}

fn family_pvalue(r: &ResidualSeries, spec: &NullSpec, cancel: &CancelToken) -> Option<f64> {
    let basis = CombBasis::new(&r.indices, &PERIODS);
    let observed: Vec<Option<f64>> = fit_with_basis(&basis, r)
        .iter()
        .map(|f| f.statistic())
        .collect();
    let null = generate_with(r, spec, &basis, cancel).ok()?;
    SignificanceTable::compute(&observed, &null, ALPHA)
        .ok()?
        .family_pvalue
}

fn calibrate(method: NullMethod, realizations: usize, n_samples: usize) -> CalibrationRow {
    let cancel = CancelToken::new();
    let mut false_positives = 0;
    for k in 0..realizations {
        let Some(r) = noise_residuals(1500, 7 + k as u64) else {
            continue;
        };
        let spec = NullSpec {
            method,
            base_seed: 1_000 + k as u64,
            n_samples,
        };
        if family_pvalue(&r, &spec, &cancel).is_some_and(|p| p <= ALPHA) {
            false_positives += 1;
        }
    }
    let denom = (n_samples + 1) as f64;
    CalibrationRow {
        method: method.to_string(),
        realizations,
        n_samples,
        false_positives,
        rate: false_positives as f64 / realizations as f64,
        nominal: (ALPHA * denom).floor() / denom,
    }
}

fn time_null(method: NullMethod, points: u32, n_samples: usize) -> Option<TimingRow> {
    let r = noise_residuals(points, 99)?;
    let basis = CombBasis::new(&r.indices, &PERIODS);
    let spec = NullSpec {
        method,
        base_seed: 5,
        n_samples,
    };
    let start = Instant::now();
    generate_with(&r, &spec, &basis, &CancelToken::new()).ok()?;
    Some(TimingRow {
        method: method.to_string(),
        points,
        n_samples,
        millis: start.elapsed().as_secs_f64() * 1e3,
    })
}

fn main() {
    println!("================================================================");
    println!("  CALIBRATION: family-wise false positives on pure noise");
    println!("================================================================\n");

    let methods = [
        NullMethod::LabelPermutation,
        NullMethod::PhaseRandomization,
        NullMethod::SegmentPermutation { segment_len: 50 },
    ];

    let mut calibration = Vec::new();
    for method in methods {
        let row = calibrate(method, 200, 99);
        println!(
            "  {:<28} {:>3}/{:<3} false positives  rate {:.3}  (nominal {:.3})",
            row.method, row.false_positives, row.realizations, row.rate, row.nominal
        );
        calibration.push(row);
    }

    println!("\n================================================================");
    println!("  SCALING: null generation time");
    println!("================================================================\n");

    let mut timing = Vec::new();
    for method in methods {
        for points in [500u32, 1500, 5000] {
            for n_samples in [100usize, 1000] {
                if let Some(row) = time_null(method, points, n_samples) {
                    println!(
                        "  {:<28} points={:>5} N={:>5}  {:>9.2} ms",
                        row.method, row.points, row.n_samples, row.millis
                    );
                    timing.push(row);
                }
            }
        }
    }

    let summary = serde_json::json!({
        "alpha": ALPHA,
        "periods": PERIODS,
        "calibration": calibration,
        "timing": timing,
    });
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("\n{json}"),
        Err(e) => eprintln!("could not serialize summary: {e}"),
    }
}
