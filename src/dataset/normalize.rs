//! Causal Normalizer
//!
//! Rewrites the feature payload of a canonical record file in place with
//! rolling z-scores. Record `i` is scored against statistics built only from
//! valid records strictly before `i` (capped at the trailing window), so no
//! sample ever sees its own or future values.
//!
//! # Burn-in
//!
//! Until the trailing window fills, statistics come from the partial window.
//! Whenever the observed variance is zero (including the very first valid
//! record) the output is exactly 0, never the raw value.
//!
//! # I/O model
//!
//! Two explicit cursors over one handle: read a chunk at `offset`, transform,
//! seek back to `offset`, write the chunk, advance. Keys, validity flags,
//! record count and file length are unchanged.
//!
//! The pass must run before any [`WindowedStore`](crate::dataset::store::WindowedStore)
//! maps the same file.

use crate::dataset::config::SanitizeConfig;
use crate::dataset::record::Record;
pub use crate::dataset::stats::StatsWindow;
use crate::dataset::stats::{StatsPack, CANCELLATION};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeReport {
    pub records: u64,
    pub valid_records: u64,
    /// Valid records scored before the trailing window was full
    pub burn_in_records: u64,
}

/// Score `x` against the pack's current statistics for `feature`.
#[inline]
pub fn causal_zscore(pack: &StatsPack, feature: usize, x: f64) -> f64 {
    if pack.count() == 0 {
        return 0.0;
    }
    let var = pack.variance(feature);
    let mean = pack.mean(feature);
    // no spread beyond rounding at this magnitude: output 0
    if var <= 0.0 || var <= CANCELLATION * mean * mean {
        return 0.0;
    }
    (x - mean) / var.sqrt()
}

/// Normalize `path` in place.
pub fn normalize<R: Record>(
    path: &Path,
    window: StatsWindow,
    cfg: &SanitizeConfig,
) -> Result<NormalizeReport> {
    if let StatsWindow::Trailing(0) = window {
        bail!("{}: normalization window must be >= 1", path.display());
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening {} for normalization", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if len % R::SIZE as u64 != 0 {
        bail!(
            "{}: size {} is not a multiple of the {} record size {}",
            path.display(),
            len,
            R::KIND,
            R::SIZE
        );
    }
    let total = len / R::SIZE as u64;
    info!(
        path = %path.display(),
        records = total,
        window = ?window,
        "normalizing"
    );

    let dim = R::feature_dim();
    let mut pack = StatsPack::new(dim, window);
    let mut report = NormalizeReport::default();
    let mut original = vec![0.0f64; dim];

    let chunk_records = cfg.buffer_records.max(1) as u64;
    let progress_every = cfg.progress_every.max(1);
    let mut buf = Vec::with_capacity(chunk_records as usize * R::SIZE);
    let mut offset: u64 = 0;
    let mut index: u64 = 0;

    while index < total {
        let n = chunk_records.min(total - index) as usize;
        buf.resize(n * R::SIZE, 0);

        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("{}: seek to read offset {}", path.display(), offset))?;
        file.read_exact(&mut buf)
            .with_context(|| format!("{}: reading records at offset {}", path.display(), offset))?;

        for (slot, bytes) in buf.chunks_exact_mut(R::SIZE).enumerate() {
            let mut record = R::decode(bytes);
            if record.is_valid() {
                let key = record.key_value();
                if !pack.is_warm() {
                    report.burn_in_records += 1;
                }
                for (f, o) in original.iter_mut().enumerate() {
                    *o = record.feature(f);
                }
                for (f, &x) in original.iter().enumerate() {
                    let z = causal_zscore(&pack, f, x);
                    if !z.is_finite() {
                        bail!(
                            "{}: record {} (key {}): non-finite z-score for feature '{}' (value {})",
                            path.display(),
                            index + slot as u64,
                            key,
                            R::FEATURE_NAMES[f],
                            x
                        );
                    }
                    record.set_feature(f, z);
                }
                debug_assert_eq!(record.key_value(), key);
                record.encode(bytes);
                pack.push(&original);
                report.valid_records += 1;
            }
            report.records += 1;
            if report.records % progress_every == 0 {
                info!(
                    path = %path.display(),
                    records = report.records,
                    total,
                    "normalize progress"
                );
            }
        }

        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("{}: seek to write offset {}", path.display(), offset))?;
        file.write_all(&buf)
            .with_context(|| format!("{}: writing records at offset {}", path.display(), offset))?;

        offset += buf.len() as u64;
        index += n as u64;
    }

    file.sync_all()
        .with_context(|| format!("syncing {}", path.display()))?;
    info!(
        path = %path.display(),
        records = report.records,
        valid = report.valid_records,
        burn_in = report.burn_in_records,
        "normalization complete"
    );
    Ok(report)
}
