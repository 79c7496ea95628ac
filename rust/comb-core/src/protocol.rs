//! Pre-registration: parameters are frozen before any data are touched.
//!
//! Example protocol file:
//!
//! ```toml
//! protocol_version = "tt-comb-v1"
//! candidate_periods = [8, 16, 32, 64]
//! predicted_period = 16
//! period_tolerance = 1
//! n_samples = 999
//! seed = 20260301
//! alpha = 0.05
//! mapping = "registered"
//!
//! [index_window]
//! min = 30
//! max = 2500
//!
//! [null]
//! method = "phase_randomization"
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{ForensicError, Result};

/// Largest candidate set a protocol may lock. Every period costs a basis
/// column and a statistic per null draw.
pub const MAX_CANDIDATE_PERIODS: usize = 100_000;

/// Candidate periods as declared: an explicit list or an integer range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CandidatePeriods {
    List(Vec<u32>),
    Range { start: u32, end: u32, step: u32 },
}

impl CandidatePeriods {
    /// Sorted, de-duplicated period list.
    pub fn expand(&self) -> Result<Vec<u32>> {
        let mut periods = match self {
            CandidatePeriods::List(list) => list.clone(),
            CandidatePeriods::Range { start, end, step } => {
                if *step == 0 || start > end {
                    return Err(ForensicError::Config {
                        detail: format!("period range {start}..={end} step {step} is empty"),
                    });
                }
                let count = u64::from(end - start) / u64::from(*step) + 1;
                if count > MAX_CANDIDATE_PERIODS as u64 {
                    return Err(ForensicError::Config {
                        detail: format!(
                            "period range {start}..={end} step {step} has {count} periods; at most {MAX_CANDIDATE_PERIODS} allowed"
                        ),
                    });
                }
                (*start..=*end).step_by(*step as usize).collect()
            }
        };
        periods.sort_unstable();
        periods.dedup();
        if periods.is_empty() {
            return Err(ForensicError::Config {
                detail: "no candidate periods declared".to_string(),
            });
        }
        if periods[0] == 0 {
            return Err(ForensicError::Config {
                detail: "candidate periods must be positive".to_string(),
            });
        }
        if periods.len() > MAX_CANDIDATE_PERIODS {
            return Err(ForensicError::Config {
                detail: format!(
                    "{} candidate periods declared; at most {MAX_CANDIDATE_PERIODS} allowed",
                    periods.len()
                ),
            });
        }
        Ok(periods)
    }
}

/// Null-hypothesis generator named by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum NullMethod {
    LabelPermutation,
    PhaseRandomization,
    SegmentPermutation { segment_len: usize },
}

impl fmt::Display for NullMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NullMethod::LabelPermutation => write!(f, "label-permutation"),
            NullMethod::PhaseRandomization => write!(f, "phase-randomization"),
            NullMethod::SegmentPermutation { segment_len } => {
                write!(f, "segment-permutation(len={segment_len})")
            }
        }
    }
}

/// Whether the spectrum-to-hypothesis mapping is the registered one or a stand-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    #[default]
    Registered,
    /// Placeholder mapping; every report carries a warning that cannot be turned off.
    Demonstration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexWindow {
    pub min: u32,
    pub max: u32,
}

impl Default for IndexWindow {
    fn default() -> Self {
        IndexWindow { min: 0, max: u32::MAX }
    }
}

fn default_alpha() -> f64 {
    0.05
}

/// Mutable protocol draft. Nothing downstream reads it until [`lock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub protocol_version: String,
    #[serde(default)]
    pub predicted_period: Option<u32>,
    #[serde(default)]
    pub period_tolerance: u32,
    pub n_samples: usize,
    pub seed: u64,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default)]
    pub mapping: MappingMode,
    /// Fingerprint published at pre-registration time, if any.
    #[serde(default)]
    pub registered_fingerprint: Option<String>,
    pub candidate_periods: CandidatePeriods,
    #[serde(default)]
    pub index_window: IndexWindow,
    pub null: NullMethod,
}

impl ProtocolConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ForensicError::io(path, e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ForensicError::Config {
            detail: e.to_string(),
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ForensicError::Config {
            detail: e.to_string(),
        })
    }
}

/// The frozen parameter set. Its JSON form is what the fingerprint covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedParameters {
    pub protocol_version: String,
    pub periods: Vec<u32>,
    pub predicted_period: Option<u32>,
    pub period_tolerance: u32,
    pub index_window: IndexWindow,
    pub null: NullMethod,
    pub n_samples: usize,
    pub seed: u64,
    pub alpha: f64,
    pub mapping: MappingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    /// Fingerprint matched the one declared in the config.
    Verified,
    /// No fingerprint was declared; the run cannot claim pre-registration.
    Unregistered,
}

/// Read-only protocol shared by every worker of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct LockedProtocol {
    params: LockedParameters,
    fingerprint: String,
    registration: Registration,
}

impl LockedProtocol {
    pub fn params(&self) -> &LockedParameters {
        &self.params
    }

    pub fn periods(&self) -> &[u32] {
        &self.params.periods
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn registration(&self) -> Registration {
        self.registration
    }

    /// Warnings that must appear on every report produced under this protocol.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.params.mapping == MappingMode::Demonstration {
            out.push(
                "demonstration mapping: results are illustrative and support no physical claim"
                    .to_string(),
            );
        }
        if self.registration == Registration::Unregistered {
            out.push(format!(
                "protocol {} was not pre-registered (fingerprint {})",
                self.params.protocol_version, self.fingerprint
            ));
        }
        out
    }

    /// Fresh stage tracker for another dataset under the same locked parameters.
    pub fn open_run(self: &Arc<Self>) -> ProtocolHandle {
        ProtocolHandle {
            locked: Arc::clone(self),
            stage: Stage::Locked,
            invalidated: None,
        }
    }
}

/// SHA-256 over the canonical JSON of the locked parameters.
pub fn fingerprint(params: &LockedParameters) -> Result<String> {
    let bytes = serde_json::to_vec(params).map_err(|e| ForensicError::Config {
        detail: e.to_string(),
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn freeze(config: &ProtocolConfig) -> Result<LockedParameters> {
    let periods = config.candidate_periods.expand()?;
    if !(config.alpha > 0.0 && config.alpha < 1.0) {
        return Err(ForensicError::Config {
            detail: format!("alpha {} must lie in (0, 1)", config.alpha),
        });
    }
    if config.index_window.min > config.index_window.max {
        return Err(ForensicError::Config {
            detail: format!(
                "index window [{}, {}] is empty",
                config.index_window.min, config.index_window.max
            ),
        });
    }
    if let NullMethod::SegmentPermutation { segment_len } = config.null {
        if segment_len == 0 {
            return Err(ForensicError::Config {
                detail: "segment_len must be positive".to_string(),
            });
        }
    }
    if config.protocol_version.trim().is_empty() {
        return Err(ForensicError::Config {
            detail: "protocol_version must be set".to_string(),
        });
    }
    if config.n_samples == 0 {
        warn!("protocol declares zero null samples; significance cannot be computed");
    }
    Ok(LockedParameters {
        protocol_version: config.protocol_version.clone(),
        periods,
        predicted_period: config.predicted_period,
        period_tolerance: config.period_tolerance,
        index_window: config.index_window,
        null: config.null,
        n_samples: config.n_samples,
        seed: config.seed,
        alpha: config.alpha,
        mapping: config.mapping,
    })
}

/// Freeze `config`. The returned handle starts at [`Stage::Locked`].
///
/// A declared fingerprint that does not match the frozen parameters is a
/// violation: the parameters changed after pre-registration.
pub fn lock(config: ProtocolConfig) -> Result<ProtocolHandle> {
    let params = freeze(&config)?;
    let fp = fingerprint(&params)?;
    let registration = match &config.registered_fingerprint {
        Some(declared) if declared.eq_ignore_ascii_case(&fp) => Registration::Verified,
        Some(declared) => {
            return Err(ForensicError::violation(format!(
                "parameters do not match the registered fingerprint {declared} (locked {fp})"
            )));
        }
        None => Registration::Unregistered,
    };
    let locked = Arc::new(LockedProtocol {
        params,
        fingerprint: fp,
        registration,
    });
    for warning in locked.warnings() {
        warn!("{warning}");
    }
    info!(
        version = %locked.params.protocol_version,
        fingerprint = %locked.fingerprint,
        periods = locked.params.periods.len(),
        "protocol locked"
    );
    Ok(locked.open_run())
}

/// Forward-only run stages after locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Locked,
    DataLoaded,
    Analyzed,
    Reported,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Locked => Some(Stage::DataLoaded),
            Stage::DataLoaded => Some(Stage::Analyzed),
            Stage::Analyzed => Some(Stage::Reported),
            Stage::Reported => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Locked => "locked",
            Stage::DataLoaded => "data-loaded",
            Stage::Analyzed => "analyzed",
            Stage::Reported => "reported",
        };
        f.write_str(s)
    }
}

/// Stage tracker for one run. Any violation voids it permanently.
#[derive(Debug)]
pub struct ProtocolHandle {
    locked: Arc<LockedProtocol>,
    stage: Stage,
    invalidated: Option<String>,
}

impl ProtocolHandle {
    pub fn protocol(&self) -> &Arc<LockedProtocol> {
        &self.locked
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.is_some()
    }

    fn fail(&mut self, detail: String) -> ForensicError {
        warn!(stage = %self.stage, %detail, "protocol violation; run invalidated");
        if self.invalidated.is_none() {
            self.invalidated = Some(detail.clone());
        }
        ForensicError::violation(detail)
    }

    /// Assert a component may run now: the handle is valid, not yet
    /// reported, and sits exactly at `expected`.
    pub fn check(&mut self, expected: Stage) -> Result<()> {
        if let Some(reason) = &self.invalidated {
            return Err(ForensicError::violation(format!("run already invalidated: {reason}")));
        }
        if self.stage == Stage::Reported {
            return Err(self.fail("run already reported".to_string()));
        }
        if self.stage != expected {
            let detail = format!("component expects stage {expected} but run is at {}", self.stage);
            return Err(self.fail(detail));
        }
        Ok(())
    }

    /// Move to the immediate successor stage.
    pub fn advance(&mut self, to: Stage) -> Result<()> {
        if let Some(reason) = &self.invalidated {
            return Err(ForensicError::violation(format!("run already invalidated: {reason}")));
        }
        if self.stage.next() != Some(to) {
            let detail = format!("illegal transition {} -> {to}", self.stage);
            return Err(self.fail(detail));
        }
        info!(from = %self.stage, to = %to, "protocol stage advanced");
        self.stage = to;
        Ok(())
    }

    /// Results handed to a later stage must cover exactly the locked periods.
    pub fn check_periods(&mut self, periods: &[u32]) -> Result<()> {
        if periods != self.locked.periods() {
            let detail = format!(
                "results cover periods {periods:?}, protocol locked {:?}",
                self.locked.periods()
            );
            return Err(self.fail(detail));
        }
        Ok(())
    }

    /// Null draws must come from the locked method, seed and draw count.
    pub fn check_null(&mut self, method: NullMethod, base_seed: u64, n_samples: usize) -> Result<()> {
        let params = self.locked.params();
        if method != params.null || base_seed != params.seed || n_samples != params.n_samples {
            let detail = format!(
                "null drawn as {method} seed {base_seed} N={n_samples}, protocol locked {} seed {} N={}",
                params.null, params.seed, params.n_samples
            );
            return Err(self.fail(detail));
        }
        Ok(())
    }

    /// Re-entering the unlocked state is never allowed once locked.
    pub fn reopen(&mut self) -> Result<()> {
        Err(self.fail("attempted to unlock a locked protocol".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            protocol_version: "test-v1".into(),
            candidate_periods: CandidatePeriods::List(vec![32, 8, 16, 16]),
            predicted_period: Some(16),
            period_tolerance: 1,
            index_window: IndexWindow { min: 2, max: 2000 },
            null: NullMethod::PhaseRandomization,
            n_samples: 100,
            seed: 42,
            alpha: 0.05,
            mapping: MappingMode::Registered,
            registered_fingerprint: None,
        }
    }

    #[test]
    fn test_periods_expand_sorted_unique() {
        assert_eq!(config().candidate_periods.expand().unwrap(), vec![8, 16, 32]);
        let range = CandidatePeriods::Range { start: 10, end: 20, step: 5 };
        assert_eq!(range.expand().unwrap(), vec![10, 15, 20]);
        assert!(CandidatePeriods::Range { start: 5, end: 1, step: 1 }.expand().is_err());
        assert!(CandidatePeriods::List(vec![0, 4]).expand().is_err());
        assert!(CandidatePeriods::List(vec![]).expand().is_err());
    }

    #[test]
    fn test_oversized_period_set_is_config_error() {
        let full = CandidatePeriods::Range { start: 1, end: u32::MAX, step: 1 };
        assert!(matches!(full.expand(), Err(ForensicError::Config { .. })));

        let mut cfg = config();
        cfg.candidate_periods = full;
        assert!(matches!(lock(cfg), Err(ForensicError::Config { .. })));

        let at_cap = CandidatePeriods::Range { start: 1, end: MAX_CANDIDATE_PERIODS as u32, step: 1 };
        assert_eq!(at_cap.expand().unwrap().len(), MAX_CANDIDATE_PERIODS);
        let list = CandidatePeriods::List((1..=MAX_CANDIDATE_PERIODS as u32 + 1).collect());
        assert!(matches!(list.expand(), Err(ForensicError::Config { .. })));
    }

    #[test]
    fn test_results_for_other_periods_invalidate_run() {
        let mut h = lock(config()).unwrap();
        h.check_periods(&[8, 16, 32]).unwrap();
        assert!(matches!(
            h.check_periods(&[8, 16]),
            Err(ForensicError::ProtocolViolation { .. })
        ));
        assert!(h.is_invalidated());
    }

    #[test]
    fn test_null_drawn_off_protocol_invalidates_run() {
        let mut h = lock(config()).unwrap();
        h.check_null(NullMethod::PhaseRandomization, 42, 100).unwrap();
        assert!(h.check_null(NullMethod::LabelPermutation, 42, 100).is_err());
        assert!(h.check(Stage::Locked).is_err());
    }

    #[test]
    fn test_lock_isolated_from_later_config_mutation() {
        let mut cfg = config();
        let handle = lock(cfg.clone()).unwrap();
        cfg.candidate_periods = CandidatePeriods::List(vec![3, 5, 7]);
        cfg.seed = 7;
        assert_eq!(handle.protocol().periods(), &[8, 16, 32]);
        assert_eq!(handle.protocol().params().seed, 42);
    }

    #[test]
    fn test_stage_machine_forward_only() {
        let mut h = lock(config()).unwrap();
        assert_eq!(h.stage(), Stage::Locked);
        h.check(Stage::Locked).unwrap();
        h.advance(Stage::DataLoaded).unwrap();
        h.check(Stage::DataLoaded).unwrap();
        h.advance(Stage::Analyzed).unwrap();
        h.advance(Stage::Reported).unwrap();
        assert!(h.check(Stage::Reported).is_err());
        assert!(h.is_invalidated());
    }

    #[test]
    fn test_skipping_a_stage_invalidates() {
        let mut h = lock(config()).unwrap();
        assert!(matches!(
            h.advance(Stage::Analyzed),
            Err(ForensicError::ProtocolViolation { .. })
        ));
        assert!(h.is_invalidated());
        assert!(h.advance(Stage::DataLoaded).is_err());
    }

    #[test]
    fn test_reopen_is_violation() {
        let mut h = lock(config()).unwrap();
        assert!(matches!(h.reopen(), Err(ForensicError::ProtocolViolation { .. })));
        assert!(h.check(Stage::Locked).is_err());
    }

    #[test]
    fn test_check_out_of_order() {
        let mut h = lock(config()).unwrap();
        assert!(h.check(Stage::DataLoaded).is_err());
    }

    #[test]
    fn test_fingerprint_registration() {
        let h = lock(config()).unwrap();
        assert_eq!(h.protocol().registration(), Registration::Unregistered);
        assert_eq!(h.protocol().warnings().len(), 1);
        let fp = h.protocol().fingerprint().to_string();

        let mut registered = config();
        registered.registered_fingerprint = Some(fp.clone());
        let h = lock(registered.clone()).unwrap();
        assert_eq!(h.protocol().registration(), Registration::Verified);
        assert!(h.protocol().warnings().is_empty());

        registered.n_samples = 101;
        assert!(matches!(
            lock(registered),
            Err(ForensicError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_demonstration_mapping_always_warns() {
        let mut cfg = config();
        cfg.mapping = MappingMode::Demonstration;
        let fp = lock(cfg.clone()).unwrap().protocol().fingerprint().to_string();
        cfg.registered_fingerprint = Some(fp);
        let h = lock(cfg).unwrap();
        let warnings = h.protocol().warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("demonstration"));
    }

    #[test]
    fn test_open_run_shares_parameters() {
        let h = lock(config()).unwrap();
        let second = h.protocol().open_run();
        assert_eq!(second.stage(), Stage::Locked);
        assert!(Arc::ptr_eq(h.protocol(), second.protocol()));
    }

    #[test]
    fn test_toml_round_trip() {
        let text = r#"
protocol_version = "tt-comb-v1"
candidate_periods = { start = 8, end = 64, step = 8 }
seed = 20260301
n_samples = 999

[null]
method = "segment_permutation"
segment_len = 50
"#;
        let cfg = ProtocolConfig::from_toml(text).unwrap();
        assert_eq!(cfg.alpha, 0.05);
        assert_eq!(cfg.null, NullMethod::SegmentPermutation { segment_len: 50 });
        assert_eq!(cfg.index_window, IndexWindow::default());
        let again = ProtocolConfig::from_toml(&cfg.to_toml().unwrap()).unwrap();
        assert_eq!(again, cfg);
        assert_eq!(lock(cfg).unwrap().protocol().periods().len(), 8);
    }

    #[test]
    fn test_toml_requires_explicit_seed() {
        let text = r#"
protocol_version = "v"
candidate_periods = [8]
n_samples = 10
[null]
method = "label_permutation"
"#;
        assert!(matches!(
            ProtocolConfig::from_toml(text),
            Err(ForensicError::Config { .. })
        ));
    }

    #[test]
    fn test_lock_rejects_bad_alpha_and_window() {
        let mut cfg = config();
        cfg.alpha = 1.5;
        assert!(lock(cfg).is_err());
        let mut cfg = config();
        cfg.index_window = IndexWindow { min: 10, max: 5 };
        assert!(lock(cfg).is_err());
    }
}
