//! Integration tests for the gridset pipeline
//!
//! CSV → sanitize → normalize → aligned dataset → loader → collate →
//! decollate, driven through the public API and the CLI binaries.

use gridset::dataset::{
    collate_full, decollate, read_records, AlignedDataset, BatchLoader, Candle, LoaderShape,
    PipelineConfig, Sample,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

const MINUTE_MS: i64 = 60_000;

/// Minute candles with two gaps, one duplicate and a header.
fn write_candles(dir: &Path, name: &str, rows: i64) -> PathBuf {
    let mut body = String::from("open_time_ms,open,high,low,close,volume\n");
    for i in 0..rows {
        if i == 10 || i == 11 || i == 30 {
            continue;
        }
        let px = 100.0 + (i as f64 * 0.7).sin() * 5.0;
        let line = format!(
            "{},{},{},{},{},{}\n",
            i * MINUTE_MS,
            px,
            px + 1.0,
            px - 1.0,
            px + 0.25,
            10.0 + i as f64
        );
        body.push_str(&line);
        if i == 20 {
            body.push_str(&line);
        }
    }
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

fn write_config(dir: &Path, csv: &Path) -> PathBuf {
    let toml = format!(
        r#"
[loader]
batch_size = 7
workers = 3
prefetch_batches = 2
shuffle = true
seed = 11

[[channels]]
path = "{csv}"
past_len = 6
future_len = 2

[[channels]]
path = "{csv}"
past_len = 4
future_len = 3
norm_window = 8
"#,
        csv = csv.display()
    );
    let path = dir.join("gridset.toml");
    fs::write(&path, toml).unwrap();
    path
}

#[test]
fn test_end_to_end_pipeline() {
    let dir = tempdir().unwrap();
    let csv = write_candles(dir.path(), "btc.csv", 60);
    let config = PipelineConfig::load(write_config(dir.path(), &csv)).unwrap();

    let dataset = AlignedDataset::<Candle>::from_channels(
        &config.channels,
        config.sanitize.clone(),
        config.dataset.clone(),
    )
    .unwrap();

    // 60 grid records; max P = 6, max F = 3
    assert_eq!(dataset.size(), 60 - 6 - 3 + 1);
    assert_eq!(dataset.step(), MINUTE_MS as f64);

    let raw = read_records::<Candle>(&dir.path().join("btc.bin")).unwrap();
    assert_eq!(raw.len(), 60);
    assert_eq!(raw.iter().filter(|c| !c.valid).count(), 3);
    assert!(dir.path().join("btc.normW8.bin").exists());

    let loader = BatchLoader::from_config(&dataset, &config.loader).unwrap();
    assert_eq!(
        loader.shape(),
        LoaderShape {
            channels: 2,
            past_len: 6,
            future_len: 3,
            feature_dim: 5,
        }
    );
    assert_eq!(loader.len(), 8);

    let mut seen = Vec::new();
    for batch in &loader {
        let batch = batch.unwrap();
        let past = batch.past.as_ref().unwrap();
        assert_eq!(&past.features.shape()[1..], &[2, 6, 5]);

        for single in decollate(&batch, true).unwrap() {
            let key = single.anchor().unwrap();
            let index = dataset.index_of_key(key).unwrap();
            assert_eq!(single, dataset.get(index).unwrap());
            seen.push(index);
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..dataset.size()).collect::<Vec<_>>());
}

#[test]
fn test_normalized_channel_is_causal() {
    let dir = tempdir().unwrap();
    let csv = write_candles(dir.path(), "eth.csv", 40);
    let config = PipelineConfig::load(write_config(dir.path(), &csv)).unwrap();
    let dataset = AlignedDataset::<Candle>::from_channels(
        &config.channels,
        config.sanitize.clone(),
        config.dataset.clone(),
    )
    .unwrap();

    // anchor of earliest sample sits at record 5; normalized values up to it
    // must not change when later records are dropped from the source
    let first = dataset.get(0).unwrap();

    let short_dir = tempdir().unwrap();
    let short_csv = write_candles(short_dir.path(), "eth.csv", 12);
    let short_cfg = PipelineConfig::load(write_config(short_dir.path(), &short_csv)).unwrap();
    let short = AlignedDataset::<Candle>::from_channels(
        &short_cfg.channels,
        short_cfg.sanitize.clone(),
        short_cfg.dataset.clone(),
    )
    .unwrap();
    let same = short.get(0).unwrap();

    assert_eq!(first.anchor(), same.anchor());
    assert_eq!(first.past, same.past);
}

#[test]
fn test_batches_recollate_identically() {
    let dir = tempdir().unwrap();
    let csv = write_candles(dir.path(), "sol.csv", 50);
    let config = PipelineConfig::load(write_config(dir.path(), &csv)).unwrap();
    let dataset = AlignedDataset::<Candle>::from_channels(
        &config.channels,
        config.sanitize.clone(),
        config.dataset.clone(),
    )
    .unwrap();
    let loader = BatchLoader::from_config(&dataset, &config.loader).unwrap();

    let batches: Vec<Sample> = loader.iter().take(3).map(|b| b.unwrap()).collect();
    let merged = collate_full(&batches).unwrap();
    assert_eq!(merged.batch_len(), 21);
    assert_eq!(decollate(&merged, false).unwrap(), batches);
}

// =============================================================================
// CLI
// =============================================================================

#[test]
fn test_grid_sanitize_cli_reports_json() {
    let dir = tempdir().unwrap();
    let csv = write_candles(dir.path(), "ada.csv", 30);

    let output = Command::new(env!("CARGO_BIN_EXE_grid_sanitize"))
        .args(["--csv", csv.to_str().unwrap(), "--kind", "candle", "--norm-window", "5"])
        .env_remove("GRIDSET_CONFIG_PATH")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["rebuilt_raw"], true);
    assert_eq!(report["report"]["gaps_filled"], 2);
    assert_eq!(report["report"]["duplicates_collapsed"], 1);
    assert!(report["path"].as_str().unwrap().ends_with("ada.normW5.bin"));
}

#[test]
fn test_grid_sanitize_cli_fails_on_off_grid_input() {
    let dir = tempdir().unwrap();
    let csv = dir.path().join("bad.csv");
    fs::write(&csv, "0,1\n1,1\n2.5,1\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_grid_sanitize"))
        .args(["--csv", csv.to_str().unwrap(), "--kind", "scalar"])
        .env_remove("GRIDSET_CONFIG_PATH")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(!dir.path().join("bad.bin").exists());
}
