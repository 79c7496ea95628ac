//! Observed-minus-model residuals on the shared index window.

use std::collections::HashMap;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ForensicError, Result};
use crate::provenance::AdmittedFile;
use crate::series::SpectralSeries;

/// How residuals were normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Whitening {
    /// Per-index division by the observed uncertainty. Ignores correlations.
    DiagonalFallback,
    /// Solved against the Cholesky factor of the supplied covariance.
    Cholesky,
}

/// Residuals aligned on indices present in both series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualSeries {
    pub indices: Vec<u32>,
    pub values: Vec<f64>,
    pub whitening: Whitening,
    /// Copied from the observed series; false means unit errors were assumed.
    pub uncertainty_supplied: bool,
}

impl ResidualSeries {
    /// Residuals built directly from values, e.g. synthetic or simulated data.
    pub fn from_values(indices: Vec<u32>, values: Vec<f64>) -> Self {
        debug_assert_eq!(indices.len(), values.len());
        ResidualSeries {
            indices,
            values,
            whitening: Whitening::DiagonalFallback,
            uncertainty_supplied: true,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Same index positions, different values. Used by null surrogates.
    pub fn with_values(&self, values: Vec<f64>) -> Self {
        ResidualSeries {
            indices: self.indices.clone(),
            values,
            whitening: self.whitening,
            uncertainty_supplied: self.uncertainty_supplied,
        }
    }

    pub fn chi_square(&self) -> f64 {
        self.values.iter().map(|r| r * r).sum()
    }
}

/// Pairs of (observed, model) points on the common window, plus the raw differences.
fn align(
    observed: &SpectralSeries,
    model: &SpectralSeries,
    index_min: u32,
    index_max: u32,
) -> Result<(Vec<u32>, Vec<f64>, Vec<f64>)> {
    let mut indices = Vec::new();
    let mut diffs = Vec::new();
    let mut sigmas = Vec::new();
    for obs in observed
        .points()
        .iter()
        .filter(|p| p.index >= index_min && p.index <= index_max)
    {
        if let Some(m) = model.get(obs.index) {
            indices.push(obs.index);
            diffs.push(obs.value - m.value);
            sigmas.push(obs.uncertainty);
        }
    }
    if indices.is_empty() {
        return Err(ForensicError::EmptyOverlap {
            index_min,
            index_max,
        });
    }
    Ok((indices, diffs, sigmas))
}

/// Diagonal residuals `(obs - model) / sigma_obs` on the shared window.
pub fn residuals(
    observed: &SpectralSeries,
    model: &SpectralSeries,
    index_min: u32,
    index_max: u32,
) -> Result<ResidualSeries> {
    let (indices, diffs, sigmas) = align(observed, model, index_min, index_max)?;
    let mut values = Vec::with_capacity(diffs.len());
    for ((&idx, d), s) in indices.iter().zip(&diffs).zip(&sigmas) {
        if *s <= 0.0 {
            return Err(ForensicError::malformed(
                "observed",
                format!("index {idx}"),
                "zero uncertainty cannot normalise a residual",
            ));
        }
        values.push(d / s);
    }
    warn!(
        points = values.len(),
        "no covariance supplied; residuals use diagonal errors and understate correlated uncertainty"
    );
    Ok(ResidualSeries {
        indices,
        values,
        whitening: Whitening::DiagonalFallback,
        uncertainty_supplied: observed.uncertainty_supplied(),
    })
}

/// A covariance matrix labelled by spectrum index.
#[derive(Debug, Clone, PartialEq)]
pub struct Covariance {
    indices: Vec<u32>,
    matrix: DMatrix<f64>,
}

impl Covariance {
    pub fn new(indices: Vec<u32>, matrix: DMatrix<f64>) -> Result<Self> {
        let n = indices.len();
        if matrix.nrows() != n || matrix.ncols() != n {
            return Err(ForensicError::Covariance {
                detail: format!(
                    "{} labels but matrix is {}x{}",
                    n,
                    matrix.nrows(),
                    matrix.ncols()
                ),
            });
        }
        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (matrix[(i, j)], matrix[(j, i)]);
                if (a - b).abs() > 1e-9 * a.abs().max(b.abs()).max(1.0) {
                    return Err(ForensicError::Covariance {
                        detail: format!("matrix not symmetric at ({i}, {j})"),
                    });
                }
            }
        }
        Ok(Covariance { indices, matrix })
    }

    /// Diagonal covariance from per-index sigmas.
    pub fn diagonal(indices: Vec<u32>, sigmas: &[f64]) -> Result<Self> {
        let variances: Vec<f64> = sigmas.iter().map(|s| s * s).collect();
        let matrix = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(variances));
        Self::new(indices, matrix)
    }

    /// First data line lists the indices, each following line is a matrix row.
    pub fn from_text(file: &AdmittedFile) -> Result<Self> {
        let bytes = file.read_verified()?;
        let name = file.path().display().to_string();
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| ForensicError::malformed(&name, "file", format!("not UTF-8: {e}")))?;
        Self::parse_text(text, &name)
    }

    fn parse_text(text: &str, name: &str) -> Result<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(n, l)| (n + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'));

        let (_, header) = lines
            .next()
            .ok_or_else(|| ForensicError::malformed(name, "file", "empty covariance file"))?;
        let indices = header
            .split_whitespace()
            .map(|s| s.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ForensicError::malformed(name, "header", e.to_string()))?;

        let n = indices.len();
        let mut data = Vec::with_capacity(n * n);
        let mut rows = 0usize;
        for (lineno, line) in lines {
            let row = line
                .split_whitespace()
                .map(|s| s.parse::<f64>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ForensicError::malformed(name, format!("line {lineno}"), e.to_string()))?;
            if row.len() != n {
                return Err(ForensicError::malformed(
                    name,
                    format!("line {lineno}"),
                    format!("expected {n} entries, found {}", row.len()),
                ));
            }
            data.extend(row);
            rows += 1;
        }
        if rows != n {
            return Err(ForensicError::malformed(
                name,
                "file",
                format!("expected {n} matrix rows, found {rows}"),
            ));
        }
        Self::new(indices, DMatrix::from_row_slice(n, n, &data))
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Sub-block for `wanted`, in that order.
    fn select(&self, wanted: &[u32]) -> Result<DMatrix<f64>> {
        let position: HashMap<u32, usize> = self
            .indices
            .iter()
            .enumerate()
            .map(|(i, &idx)| (idx, i))
            .collect();
        let mut slots = Vec::with_capacity(wanted.len());
        for idx in wanted {
            let slot = position.get(idx).ok_or_else(|| ForensicError::Covariance {
                detail: format!("index {idx} missing from covariance"),
            })?;
            slots.push(*slot);
        }
        Ok(DMatrix::from_fn(wanted.len(), wanted.len(), |i, j| {
            self.matrix[(slots[i], slots[j])]
        }))
    }
}

/// Residuals whitened by the Cholesky factor of `covariance`: solve `L w = d`.
pub fn residuals_whitened(
    observed: &SpectralSeries,
    model: &SpectralSeries,
    index_min: u32,
    index_max: u32,
    covariance: &Covariance,
) -> Result<ResidualSeries> {
    let (indices, diffs, _) = align(observed, model, index_min, index_max)?;
    let block = covariance.select(&indices)?;
    let chol = block.cholesky().ok_or_else(|| ForensicError::Covariance {
        detail: "covariance block is not positive definite".to_string(),
    })?;
    let d = nalgebra::DVector::from_vec(diffs);
    let w = chol
        .l()
        .solve_lower_triangular(&d)
        .ok_or_else(|| ForensicError::Covariance {
            detail: "triangular solve failed".to_string(),
        })?;
    debug!(points = indices.len(), "whitened residuals with Cholesky factor");
    Ok(ResidualSeries {
        indices,
        values: w.iter().copied().collect(),
        whitening: Whitening::Cholesky,
        uncertainty_supplied: observed.uncertainty_supplied(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::{register, DigestAlgorithm, Manifest};
    use crate::series::SpectralPoint;

    fn series(rows: &[(u32, f64, f64)]) -> SpectralSeries {
        SpectralSeries::new(
            rows.iter()
                .map(|&(index, value, uncertainty)| SpectralPoint { index, value, uncertainty })
                .collect(),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_residuals_intersect_window_only() {
        let obs = series(&[(1, 5.0, 1.0), (2, 6.0, 2.0), (3, 7.0, 1.0), (5, 9.0, 1.0), (9, 1.0, 1.0)]);
        let model = series(&[(2, 2.0, 0.0), (3, 3.0, 0.0), (4, 4.0, 0.0), (5, 5.0, 0.0), (9, 0.0, 0.0)]);
        let r = residuals(&obs, &model, 2, 5).unwrap();
        assert_eq!(r.indices, vec![2, 3, 5]);
        assert_eq!(r.values, vec![2.0, 4.0, 4.0]);
        assert_eq!(r.whitening, Whitening::DiagonalFallback);
    }

    #[test]
    fn test_residuals_empty_overlap() {
        let obs = series(&[(1, 1.0, 1.0), (2, 1.0, 1.0)]);
        let model = series(&[(3, 1.0, 1.0)]);
        assert!(matches!(
            residuals(&obs, &model, 0, 10),
            Err(ForensicError::EmptyOverlap { .. })
        ));
        let model = series(&[(2, 1.0, 1.0)]);
        assert!(matches!(
            residuals(&obs, &model, 3, 10),
            Err(ForensicError::EmptyOverlap { .. })
        ));
    }

    #[test]
    fn test_residuals_propagate_missing_uncertainty_flag() {
        let obs = SpectralSeries::without_uncertainty(&[(1, 2.0), (2, 3.0)]).unwrap();
        let model = SpectralSeries::without_uncertainty(&[(1, 1.0), (2, 1.0)]).unwrap();
        let r = residuals(&obs, &model, 0, 10).unwrap();
        assert!(!r.uncertainty_supplied);
        assert_eq!(r.values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_whitened_with_diagonal_covariance_matches_diagonal_residuals() {
        let obs = series(&[(1, 5.0, 2.0), (2, 6.0, 4.0), (3, 7.0, 0.5)]);
        let model = series(&[(1, 1.0, 0.0), (2, 2.0, 0.0), (3, 3.0, 0.0)]);
        let cov = Covariance::diagonal(vec![1, 2, 3], &[2.0, 4.0, 0.5]).unwrap();
        let w = residuals_whitened(&obs, &model, 0, 10, &cov).unwrap();
        let d = residuals(&obs, &model, 0, 10).unwrap();
        assert_eq!(w.whitening, Whitening::Cholesky);
        for (a, b) in w.values.iter().zip(&d.values) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_whitened_correlated_pair() {
        // cov = [[1, 0.5], [0.5, 1]] -> L = [[1, 0], [0.5, sqrt(0.75)]]
        let obs = series(&[(1, 1.0, 1.0), (2, 1.0, 1.0)]);
        let model = series(&[(1, 0.0, 0.0), (2, 0.0, 0.0)]);
        let cov = Covariance::new(vec![1, 2], DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0])).unwrap();
        let w = residuals_whitened(&obs, &model, 0, 10, &cov).unwrap();
        assert!((w.values[0] - 1.0).abs() < 1e-12);
        assert!((w.values[1] - 0.5 / 0.75f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_whitened_rejects_bad_covariance() {
        let obs = series(&[(1, 1.0, 1.0), (2, 1.0, 1.0)]);
        let model = series(&[(1, 0.0, 0.0), (2, 0.0, 0.0)]);
        let not_pd = Covariance::new(vec![1, 2], DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0])).unwrap();
        assert!(matches!(
            residuals_whitened(&obs, &model, 0, 10, &not_pd),
            Err(ForensicError::Covariance { .. })
        ));
        let missing = Covariance::diagonal(vec![1], &[1.0]).unwrap();
        assert!(residuals_whitened(&obs, &model, 0, 10, &missing).is_err());
        assert!(Covariance::new(vec![1, 2], DMatrix::from_row_slice(2, 2, &[1.0, 0.1, 0.2, 1.0])).is_err());
    }

    fn admitted(dir: &tempfile::TempDir, name: &str, text: &str) -> AdmittedFile {
        let path = dir.path().join(name);
        std::fs::write(&path, text).unwrap();
        let mut manifest = Manifest::default();
        manifest.insert(register(&path, DigestAlgorithm::Sha256).unwrap());
        manifest.admit(&path).unwrap()
    }

    #[test]
    fn test_covariance_from_text() {
        let dir = tempfile::tempdir().unwrap();
        let file = admitted(&dir, "cov.txt", "# labels\n4 5\n2.0 0.1\n0.1 3.0\n");
        let cov = Covariance::from_text(&file).unwrap();
        assert_eq!(cov.indices(), &[4, 5]);
        let short = admitted(&dir, "short.txt", "4 5\n2.0 0.1\n");
        assert!(matches!(
            Covariance::from_text(&short),
            Err(ForensicError::MalformedData { .. })
        ));
    }

    #[test]
    fn test_covariance_changed_after_admit_is_provenance_failure() {
        let dir = tempfile::tempdir().unwrap();
        let file = admitted(&dir, "cov.txt", "4 5\n2.0 0.1\n0.1 3.0\n");
        std::fs::write(file.path(), "4 5\n2.0 0.0\n0.0 3.0\n").unwrap();
        assert!(matches!(
            Covariance::from_text(&file),
            Err(ForensicError::Provenance { .. })
        ));
    }
}
