//! comb-forensics - provenance-gated comb-signal significance runs.
//!
//! Exit codes: 0 analysis completed (whatever the verdict), 2 provenance
//! failure, 3 protocol violation, 4 cancelled, 1 anything else. `run`
//! writes its report with a status and reason on every one of these paths.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comb_core::series::{encode_binary, encode_text};
use comb_core::{
    lock, register, CancelToken, DatasetFormat, DigestAlgorithm, ForensicError, Manifest,
    ProtocolConfig,
};
use comb_forensics::synth::{synthesize, SynthSpec};
use comb_forensics::{run_replication, DatasetInputs, ReplicationOutcome, RunReport, RunStatus};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "comb-forensics")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record dataset digests in a manifest (created if absent)
    Register {
        #[arg(long)]
        manifest: PathBuf,

        #[arg(long, default_value = "sha256")]
        algorithm: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Check files against their manifest digests
    Verify {
        #[arg(long)]
        manifest: PathBuf,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Lock a protocol and print the fingerprint to pre-register
    Lock {
        #[arg(long)]
        protocol: PathBuf,
    },

    /// Run the analysis on one or more datasets
    Run {
        #[arg(long)]
        protocol: PathBuf,

        #[arg(long)]
        manifest: PathBuf,

        /// Observed spectrum; repeat for a replication run
        #[arg(long, required = true)]
        observed: Vec<PathBuf>,

        #[arg(long)]
        model: Option<PathBuf>,

        #[arg(long)]
        covariance: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = FormatArg::Text)]
        format: FormatArg,

        /// JSON report path; printed to stdout when absent
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        csv: Option<PathBuf>,

        /// Datasets that must pass for replication (default: all)
        #[arg(long)]
        min_passing: Option<usize>,

        /// Cancel the run after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Write a synthetic spectrum
    Synth {
        #[arg(long)]
        output: PathBuf,

        #[arg(long, default_value = "1500")]
        points: u32,

        #[arg(long, default_value = "2")]
        first_index: u32,

        #[arg(long, default_value = "16")]
        period: f64,

        #[arg(long, default_value = "0")]
        amplitude: f64,

        #[arg(long, default_value = "0")]
        phase: f64,

        #[arg(long, default_value = "1")]
        noise: f64,

        #[arg(long)]
        seed: u64,

        #[arg(long, value_enum, default_value_t = FormatArg::Text)]
        format: FormatArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Binary,
}

impl From<FormatArg> for DatasetFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Text => DatasetFormat::Text,
            FormatArg::Binary => DatasetFormat::Binary,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn load_or_new_manifest(path: &Path) -> Result<Manifest> {
    if path.exists() {
        Ok(Manifest::from_file(path)?)
    } else {
        Ok(Manifest::default())
    }
}

fn cmd_register(manifest_path: &Path, algorithm: &str, files: &[PathBuf]) -> Result<()> {
    let algorithm = DigestAlgorithm::parse(algorithm)?;
    let mut manifest = load_or_new_manifest(manifest_path)?;
    for file in files {
        let entry = register(file, algorithm)?;
        println!("{}  {}  {}", entry.algorithm, entry.digest, entry.file_name);
        manifest.insert(entry);
    }
    manifest.save(manifest_path)?;
    info!(manifest = %manifest_path.display(), files = files.len(), "manifest updated");
    Ok(())
}

fn cmd_verify(manifest_path: &Path, files: &[PathBuf]) -> Result<()> {
    let manifest = Manifest::from_file(manifest_path)?;
    let mut failed = Vec::new();
    for file in files {
        let ok = manifest.validate_path(file)?;
        println!("{}  {}", if ok { "OK      " } else { "MISMATCH" }, file.display());
        if !ok {
            failed.push(file.display().to_string());
        }
    }
    if let Some(first) = failed.first() {
        return Err(ForensicError::Provenance {
            path: PathBuf::from(first),
            detail: format!("{} file(s) failed verification", failed.len()),
        }
        .into());
    }
    Ok(())
}

fn cmd_lock(protocol: &Path) -> Result<()> {
    let config = ProtocolConfig::from_file(protocol)?;
    let handle = lock(config)?;
    let locked = handle.protocol();
    println!("fingerprint: {}", locked.fingerprint());
    println!("periods: {}", locked.periods().len());
    for warning in locked.warnings() {
        println!("warning: {warning}");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    protocol: &Path,
    manifest_path: &Path,
    observed: &[PathBuf],
    model: Option<PathBuf>,
    covariance: Option<PathBuf>,
    format: DatasetFormat,
    output: Option<&Path>,
    csv: Option<&Path>,
    min_passing: Option<usize>,
    deadline_secs: Option<u64>,
) -> Result<ExitCode> {
    let outcome = execute_run(
        protocol,
        manifest_path,
        observed,
        model,
        covariance,
        format,
        min_passing,
        deadline_secs,
    );

    let (report, code) = match outcome {
        Ok(ReplicationOutcome::Completed(report)) => (report, ExitCode::SUCCESS),
        Ok(ReplicationOutcome::Cancelled {
            dataset,
            completed,
            requested,
        }) => {
            error!(
                dataset = %dataset.display(),
                completed,
                requested,
                "run cancelled; no verdict written"
            );
            let reason = format!(
                "cancelled on {} after {completed} of {requested} null draws",
                dataset.display()
            );
            (RunReport::stopped(RunStatus::Cancelled, reason), ExitCode::from(4))
        }
        Err(err) => {
            error!("{err:#}");
            let status = err
                .downcast_ref::<ForensicError>()
                .map_or(RunStatus::Failed, RunStatus::for_error);
            let report = RunReport::stopped(status, format!("{err:#}"));
            (report, ExitCode::from(exit_code_for(&err)))
        }
    };

    match output {
        Some(path) => report.write_json(path)?,
        None => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing report")?
        ),
    }
    if report.status == RunStatus::Completed {
        if let Some(path) = csv {
            report.write_csv(path)?;
        }
    }
    for verdict in &report.verdicts {
        info!(
            dataset = %verdict.dataset.name,
            passed = verdict.passed,
            "run complete"
        );
    }
    Ok(code)
}

#[allow(clippy::too_many_arguments)]
fn execute_run(
    protocol: &Path,
    manifest_path: &Path,
    observed: &[PathBuf],
    model: Option<PathBuf>,
    covariance: Option<PathBuf>,
    format: DatasetFormat,
    min_passing: Option<usize>,
    deadline_secs: Option<u64>,
) -> Result<ReplicationOutcome> {
    let config = ProtocolConfig::from_file(protocol)
        .with_context(|| format!("loading protocol {}", protocol.display()))?;
    let handle = lock(config)?;
    let manifest = Manifest::from_file(manifest_path)?;

    let datasets: Vec<DatasetInputs> = observed
        .iter()
        .map(|path| DatasetInputs {
            observed: path.clone(),
            model: model.clone(),
            covariance: covariance.clone(),
            format,
        })
        .collect();
    let cancel = match deadline_secs {
        Some(secs) => CancelToken::with_deadline(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };
    let required = min_passing.unwrap_or(datasets.len());

    Ok(run_replication(handle.protocol(), &manifest, &datasets, required, &cancel)?)
}

fn cmd_synth(spec: &SynthSpec, output: &Path, format: DatasetFormat) -> Result<()> {
    if spec.points == 0 {
        bail!("--points must be positive");
    }
    let series = synthesize(spec)?;
    let bytes = match format {
        DatasetFormat::Text => encode_text(&series).into_bytes(),
        DatasetFormat::Binary => encode_binary(&series),
    };
    std::fs::write(output, bytes).with_context(|| format!("writing {}", output.display()))?;
    info!(path = %output.display(), points = series.len(), "synthetic spectrum written");
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ForensicError>() {
        Some(ForensicError::Provenance { .. }) => 2,
        Some(ForensicError::ProtocolViolation { .. }) => 3,
        Some(ForensicError::Cancelled { .. }) => 4,
        _ => 1,
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Register {
            manifest,
            algorithm,
            files,
        } => cmd_register(&manifest, &algorithm, &files).map(|()| ExitCode::SUCCESS),
        Commands::Verify { manifest, files } => {
            cmd_verify(&manifest, &files).map(|()| ExitCode::SUCCESS)
        }
        Commands::Lock { protocol } => cmd_lock(&protocol).map(|()| ExitCode::SUCCESS),
        Commands::Run {
            protocol,
            manifest,
            observed,
            model,
            covariance,
            format,
            output,
            csv,
            min_passing,
            deadline_secs,
        } => cmd_run(
            &protocol,
            &manifest,
            &observed,
            model,
            covariance,
            format.into(),
            output.as_deref(),
            csv.as_deref(),
            min_passing,
            deadline_secs,
        ),
        Commands::Synth {
            output,
            points,
            first_index,
            period,
            amplitude,
            phase,
            noise,
            seed,
            format,
        } => {
            let spec = SynthSpec {
                points,
                first_index,
                period,
                amplitude,
                phase,
                noise,
                seed,
            };
            cmd_synth(&spec, &output, format.into()).map(|()| ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
