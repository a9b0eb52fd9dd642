//! Grid Sanitizer
//!
//! Builds the canonical binary grid (and optionally the normalized grid) for
//! one CSV source and prints the pass report as JSON.
//!
//! Usage:
//!   cargo run --release --bin grid_sanitize -- --csv ./data/btc_1m.csv --kind candle
//!   cargo run --release --bin grid_sanitize -- --csv ./data/rate.csv --kind scalar --norm-window 64 --force

use anyhow::{Context, Result};
use clap::Parser;
use gridset::dataset::{sanitize, Candle, PipelineConfig, RecordKind, SanitizeOutcome, Scalar};
use std::path::PathBuf;
use tracing::{error, info};

/// Canonical grid builder for delimited time series
#[derive(Parser, Debug)]
#[command(name = "grid_sanitize")]
#[command(about = "Sanitize a CSV time series into a gap-free binary grid")]
struct Args {
    /// Source CSV file
    #[arg(long)]
    csv: PathBuf,

    /// Record layout of the source
    #[arg(long, default_value = "candle")]
    kind: RecordKind,

    /// Rolling normalization window (0 = raw grid only)
    #[arg(long, default_value = "0")]
    norm_window: usize,

    /// Rebuild artifacts even when they are fresh
    #[arg(long)]
    force: bool,

    /// Pipeline config (TOML); falls back to GRIDSET_CONFIG_PATH / defaults
    #[arg(long, env = "GRIDSET_CONFIG_PATH")]
    config: Option<PathBuf>,
}

fn run(args: &Args) -> Result<SanitizeOutcome> {
    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    let cfg = &config.sanitize;
    match args.kind {
        RecordKind::Candle => sanitize::<Candle>(&args.csv, args.norm_window, args.force, cfg),
        RecordKind::Scalar => sanitize::<Scalar>(&args.csv, args.norm_window, args.force, cfg),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grid_sanitize=info".parse()?)
                .add_directive("gridset=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!(
        csv = %args.csv.display(),
        kind = ?args.kind,
        norm_window = args.norm_window,
        "sanitize start"
    );

    let outcome = match run(&args) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("sanitize failed: {:#}", e);
            return Err(e);
        }
    };

    let json = serde_json::to_string_pretty(&outcome).context("serializing report")?;
    println!("{}", json);
    Ok(())
}
