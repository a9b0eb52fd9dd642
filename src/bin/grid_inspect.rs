//! Grid Inspection Tool
//!
//! Opens a canonical (or normalized) binary grid and prints a summary,
//! one sample window, or exports the records back to CSV.
//!
//! Usage:
//!   cargo run --release --bin grid_inspect -- --bin ./data/btc_1m.bin summary
//!   cargo run --release --bin grid_inspect -- --bin ./data/btc_1m.bin sample --index 100 --past 8 --future 2
//!   cargo run --release --bin grid_inspect -- --bin ./data/rate.bin --kind scalar export --out rate.csv

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use gridset::dataset::{export_csv, Candle, Record, RecordKind, Scalar, WindowedStore};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::error;

/// Inspection tool for gridded record files
#[derive(Parser, Debug)]
#[command(name = "grid_inspect")]
#[command(about = "Inspect a canonical binary grid file")]
struct Cli {
    /// Binary grid file
    #[arg(long)]
    bin: PathBuf,

    /// Record layout of the file
    #[arg(long, default_value = "candle")]
    kind: RecordKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record count, key range, step and valid ratio
    Summary,

    /// Print the windows around one record
    Sample {
        #[arg(long)]
        index: usize,

        #[arg(long, default_value = "1")]
        past: usize,

        #[arg(long, default_value = "0")]
        future: usize,
    },

    /// Write the records back to CSV
    Export {
        #[arg(short, long)]
        out: PathBuf,

        #[arg(long, default_value = ",")]
        delimiter: char,

        /// Include null (gap) records
        #[arg(long)]
        include_invalid: bool,
    },
}

/// Human-readable key: UTC timestamp for millisecond-keyed candles.
fn format_key<R: Record>(key: f64) -> String {
    if R::KIND == Candle::KIND {
        if let Some(ts) = Utc.timestamp_millis_opt(key as i64).single() {
            return ts.to_rfc3339();
        }
    }
    format!("{}", key)
}

fn summary<R: Record>(path: &Path) -> Result<()> {
    let store = WindowedStore::<R>::open(path, 1, 0)?;
    let valid = store.iter().filter(|r| r.is_valid()).count();
    let report = json!({
        "path": path.display().to_string(),
        "kind": R::KIND,
        "records": store.len(),
        "valid_records": valid,
        "valid_ratio": valid as f64 / store.len() as f64,
        "step": store.step(),
        "leftmost_key": store.leftmost_key(),
        "rightmost_key": store.rightmost_key(),
        "leftmost": format_key::<R>(store.leftmost_key()),
        "rightmost": format_key::<R>(store.rightmost_key()),
        "norm_window": store.norm_window(),
        "features": R::FEATURE_NAMES,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn sample<R: Record>(path: &Path, index: usize, past: usize, future: usize) -> Result<()> {
    let store = WindowedStore::<R>::open(path, past, future)?;
    let ws = store.get(index)?;
    let d = ws.feature_dim;

    println!("anchor {} ({})", ws.anchor_index, format_key::<R>(ws.anchor_key));
    println!("{:>28}  valid  {}", "key", R::FEATURE_NAMES.join("  "));
    for (label, w) in [("past", &ws.past), ("future", &ws.future)] {
        println!("--- {} ({}) ---", label, w.len());
        for r in 0..w.len() {
            let values: Vec<String> = w.features[r * d..(r + 1) * d]
                .iter()
                .map(|v| format!("{:.6}", v))
                .collect();
            println!(
                "{:>28}  {:>5}  {}",
                format_key::<R>(w.keys[r]),
                w.valid[r],
                values.join("  ")
            );
        }
    }
    Ok(())
}

fn dispatch<R: Record>(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Summary => summary::<R>(&cli.bin),
        Commands::Sample {
            index,
            past,
            future,
        } => sample::<R>(&cli.bin, *index, *past, *future),
        Commands::Export {
            out,
            delimiter,
            include_invalid,
        } => {
            let written = export_csv::<R>(&cli.bin, out, *delimiter, *include_invalid)
                .with_context(|| format!("exporting {}", cli.bin.display()))?;
            println!("wrote {} records to {}", written, out.display());
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grid_inspect=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.kind {
        RecordKind::Candle => dispatch::<Candle>(&cli),
        RecordKind::Scalar => dispatch::<Scalar>(&cli),
    };
    if let Err(e) = &result {
        error!("inspect failed: {:#}", e);
    }
    result
}
