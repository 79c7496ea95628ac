//! # comb-forensics
//!
//! Significance testing for periodic ("comb") structure in power-spectrum
//! residuals, run strictly under a locked, pre-registered protocol.
//!
//! ## Stages
//!
//! - **Fit**: sine/cosine least squares per candidate period, Δχ² statistic
//! - **Null**: label permutation, phase randomization or segment permutation
//!   surrogates with per-draw seeds
//! - **Significance**: local, max-statistic (look-elsewhere) and
//!   Benjamini–Hochberg p-values
//! - **Verdict**: per-period table, pass/fail criteria, replication summary

pub mod fit;
pub mod null;
pub mod pipeline;
pub mod significance;
pub mod synth;
pub mod verdict;

pub use pipeline::{run, run_replication, DatasetInputs, ReplicationOutcome, RunOutcome};
pub use verdict::{ReplicationSummary, RunReport, RunStatus, Verdict};
