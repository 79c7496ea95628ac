//! Spectral series and the dataset loader.
//!
//! Two on-disk formats are accepted:
//!
//! - `Text`: whitespace/tab separated `index value [uncertainty]`, `#` comments.
//! - `Binary`: `b"SPTB"`, `u32` version, `u32` flags, `u64` rows, then
//!   little-endian `u32 index, f64 value[, f64 uncertainty]` records.
//!   Flag bit 0 marks the uncertainty column as present.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ForensicError, Result};
use crate::provenance::AdmittedFile;

pub const BINARY_MAGIC: &[u8; 4] = b"SPTB";
pub const BINARY_VERSION: u32 = 1;
const FLAG_HAS_UNCERTAINTY: u32 = 1;

/// One row of a spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralPoint {
    pub index: u32,
    pub value: f64,
    pub uncertainty: f64,
}

/// An ordered power spectrum with strictly increasing indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralSeries {
    points: Vec<SpectralPoint>,
    uncertainty_supplied: bool,
}

impl SpectralSeries {
    /// Build a series, enforcing index order and finite, non-negative errors.
    pub fn new(points: Vec<SpectralPoint>, uncertainty_supplied: bool) -> Result<Self> {
        for (row, p) in points.iter().enumerate() {
            let location = format!("row {}", row + 1);
            if !p.value.is_finite() {
                return Err(ForensicError::malformed("series", location, "value is not finite"));
            }
            if !p.uncertainty.is_finite() || p.uncertainty < 0.0 {
                return Err(ForensicError::malformed(
                    "series",
                    location,
                    format!("uncertainty {} must be finite and >= 0", p.uncertainty),
                ));
            }
        }
        for (row, pair) in points.windows(2).enumerate() {
            if pair[1].index <= pair[0].index {
                return Err(ForensicError::malformed(
                    "series",
                    format!("row {}", row + 2),
                    format!(
                        "index {} does not increase after {}",
                        pair[1].index, pair[0].index
                    ),
                ));
            }
        }
        Ok(SpectralSeries {
            points,
            uncertainty_supplied,
        })
    }

    /// Series with unit uncertainties and the "no uncertainty" flag set.
    pub fn without_uncertainty(pairs: &[(u32, f64)]) -> Result<Self> {
        let points = pairs
            .iter()
            .map(|&(index, value)| SpectralPoint {
                index,
                value,
                uncertainty: 1.0,
            })
            .collect();
        Self::new(points, false)
    }

    pub fn points(&self) -> &[SpectralPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// False when the source had no uncertainty column and 1.0 was assumed.
    pub fn uncertainty_supplied(&self) -> bool {
        self.uncertainty_supplied
    }

    /// Binary search on the sorted index column.
    pub fn get(&self, index: u32) -> Option<&SpectralPoint> {
        self.points
            .binary_search_by_key(&index, |p| p.index)
            .ok()
            .map(|i| &self.points[i])
    }
}

/// Source format selector for [`load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    Text,
    Binary,
}

impl DatasetFormat {
    fn parser(self) -> &'static dyn SeriesParser {
        match self {
            DatasetFormat::Text => &TextColumns,
            DatasetFormat::Binary => &BinaryTable,
        }
    }
}

/// A concrete on-disk representation of a spectral series.
pub trait SeriesParser {
    fn parse(&self, bytes: &[u8], source_name: &str) -> Result<SpectralSeries>;
}

/// Load a provenance-checked file. Re-parses on every call.
pub fn load(file: &AdmittedFile, format: DatasetFormat) -> Result<SpectralSeries> {
    let bytes = file.read_verified()?;
    let name = source_name(file.path());
    let series = format.parser().parse(&bytes, &name)?;
    if !series.uncertainty_supplied() {
        warn!(source = %name, "no uncertainty column; assuming unit uncertainty");
    }
    debug!(source = %name, rows = series.len(), ?format, "loaded spectral series");
    Ok(series)
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<dataset>")
        .to_string()
}

/// Whitespace separated text columns.
pub struct TextColumns;

impl SeriesParser for TextColumns {
    fn parse(&self, bytes: &[u8], source_name: &str) -> Result<SpectralSeries> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ForensicError::malformed(source_name, "file", format!("not UTF-8: {e}")))?;

        let mut points = Vec::new();
        let mut columns: Option<usize> = None;
        let mut last_index: Option<u32> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let location = format!("line {}", lineno + 1);
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 || fields.len() > 3 {
                return Err(ForensicError::malformed(
                    source_name,
                    location,
                    format!("expected 2 or 3 columns, found {}", fields.len()),
                ));
            }
            match columns {
                None => columns = Some(fields.len()),
                Some(c) if c != fields.len() => {
                    return Err(ForensicError::malformed(
                        source_name,
                        location,
                        format!("column count changed from {c} to {}", fields.len()),
                    ));
                }
                Some(_) => {}
            }

            let index: u32 = fields[0].parse().map_err(|_| {
                ForensicError::malformed(source_name, &location, format!("bad index '{}'", fields[0]))
            })?;
            let value: f64 = fields[1].parse().map_err(|_| {
                ForensicError::malformed(source_name, &location, format!("bad value '{}'", fields[1]))
            })?;
            let uncertainty: f64 = match fields.get(2) {
                Some(s) => s.parse().map_err(|_| {
                    ForensicError::malformed(source_name, &location, format!("bad uncertainty '{s}'"))
                })?,
                None => 1.0,
            };

            if let Some(prev) = last_index {
                if index <= prev {
                    return Err(ForensicError::malformed(
                        source_name,
                        location,
                        format!("index {index} does not increase after {prev}"),
                    ));
                }
            }
            last_index = Some(index);
            points.push(SpectralPoint {
                index,
                value,
                uncertainty,
            });
        }

        let supplied = columns == Some(3);
        SpectralSeries::new(points, supplied).map_err(|e| relabel(e, source_name))
    }
}

/// Fixed-width little-endian binary table.
pub struct BinaryTable;

impl SeriesParser for BinaryTable {
    fn parse(&self, bytes: &[u8], source_name: &str) -> Result<SpectralSeries> {
        let header = |detail: &str| ForensicError::malformed(source_name, "header", detail);
        if bytes.len() < 20 {
            return Err(header("file shorter than 20-byte header"));
        }
        if &bytes[0..4] != BINARY_MAGIC {
            return Err(header("bad magic"));
        }
        let version = read_u32(bytes, 4);
        if version != BINARY_VERSION {
            return Err(header(&format!("unsupported version {version}")));
        }
        let flags = read_u32(bytes, 8);
        let rows = read_u64(bytes, 12) as usize;
        let has_uncertainty = flags & FLAG_HAS_UNCERTAINTY != 0;
        let record = if has_uncertainty { 20 } else { 12 };

        let body = &bytes[20..];
        if rows.checked_mul(record) != Some(body.len()) {
            return Err(header(&format!(
                "{rows} rows of {record} bytes do not match body of {} bytes",
                body.len()
            )));
        }

        let mut points = Vec::with_capacity(rows);
        for (row, chunk) in body.chunks_exact(record).enumerate() {
            let index = read_u32(chunk, 0);
            if let Some(prev) = points.last().map(|p: &SpectralPoint| p.index) {
                if index <= prev {
                    return Err(ForensicError::malformed(
                        source_name,
                        format!("row {}", row + 1),
                        format!("index {index} does not increase after {prev}"),
                    ));
                }
            }
            let value = read_f64(chunk, 4);
            let uncertainty = if has_uncertainty { read_f64(chunk, 12) } else { 1.0 };
            points.push(SpectralPoint {
                index,
                value,
                uncertainty,
            });
        }
        SpectralSeries::new(points, has_uncertainty).map_err(|e| relabel(e, source_name))
    }
}

/// Encode a series in the binary table format.
pub fn encode_binary(series: &SpectralSeries) -> Vec<u8> {
    let has_uncertainty = series.uncertainty_supplied();
    let record = if has_uncertainty { 20 } else { 12 };
    let mut out = Vec::with_capacity(20 + series.len() * record);
    out.extend_from_slice(BINARY_MAGIC);
    out.extend_from_slice(&BINARY_VERSION.to_le_bytes());
    let flags = if has_uncertainty { FLAG_HAS_UNCERTAINTY } else { 0 };
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&(series.len() as u64).to_le_bytes());
    for p in series.points() {
        out.extend_from_slice(&p.index.to_le_bytes());
        out.extend_from_slice(&p.value.to_le_bytes());
        if has_uncertainty {
            out.extend_from_slice(&p.uncertainty.to_le_bytes());
        }
    }
    out
}

/// Render a series as text columns.
pub fn encode_text(series: &SpectralSeries) -> String {
    let mut out = String::from("# index value uncertainty\n");
    for p in series.points() {
        if series.uncertainty_supplied() {
            out.push_str(&format!("{} {:.12e} {:.12e}\n", p.index, p.value, p.uncertainty));
        } else {
            out.push_str(&format!("{} {:.12e}\n", p.index, p.value));
        }
    }
    out
}

fn relabel(err: ForensicError, source_name: &str) -> ForensicError {
    match err {
        ForensicError::MalformedData {
            location, detail, ..
        } => ForensicError::malformed(source_name, location, detail),
        other => other,
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

fn read_f64(bytes: &[u8], at: usize) -> f64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    f64::from_le_bytes(b)
}
