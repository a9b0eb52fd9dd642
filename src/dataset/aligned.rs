//! Multi-Source Aligned Dataset
//!
//! Owns one [`WindowedStore`] per channel and exposes them as a single
//! shape-consistent dataset on a shared key grid.
//!
//! # Index space
//!
//! Channel `c` can anchor a sample at record `i` only when it holds `P_c`
//! records ending at `i` and `F_c` records after it:
//!
//! ```text
//!   channel anchors:  [ key(P_c - 1) , key(len_c - 1 - F_c) ]
//!   dataset anchors:  intersection over channels, stepped by the shared grid
//!   size()         :  number of grid keys in that intersection
//! ```
//!
//! # Shape
//!
//! Every sample is padded to `(max P, max F)`: past windows on the older
//! side, future windows on the newer side. Padded slots are zero-valued,
//! invalid, with key 0.0.
//!
//! # Alignment
//!
//! Each anchor key is resolved per channel to the nearest record. When a
//! channel's grid is offset from the shared grid by more than
//! `alignment_tolerance` steps, the closest record is used and the skew is
//! logged once per channel, unless `strict_alignment` makes it an error.

use crate::dataset::config::{ChannelSpec, DatasetConfig, SanitizeConfig};
use crate::dataset::record::Record;
use crate::dataset::collate::CollateError;
use crate::dataset::sample::{Layout, Sample, Window};
use crate::dataset::sanitize::{ensure_normalized, parse_norm_window, sanitize};
use crate::dataset::store::{
    RecordWindow, StoreError, WindowedSample, WindowedStore, SINGLE_KEY_EPS,
};
use crate::dataset::tensor;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// One opened channel.
#[derive(Debug)]
pub struct Channel<R: Record> {
    /// Path the channel was added with (CSV or `.bin`)
    pub source: PathBuf,
    pub past_len: usize,
    pub future_len: usize,
    pub norm_window: usize,
    store: WindowedStore<R>,
    skew_warned: AtomicBool,
}

impl<R: Record> Channel<R> {
    pub fn store(&self) -> &WindowedStore<R> {
        &self.store
    }

    /// Key range this channel can anchor, if any.
    fn anchor_range(&self) -> Option<(f64, f64)> {
        let len = self.store.len();
        if len < self.past_len + self.future_len {
            return None;
        }
        let lo = self.store.key_at(self.past_len - 1).ok()?;
        let hi = self.store.key_at(len - 1 - self.future_len).ok()?;
        (lo <= hi).then_some((lo, hi))
    }
}

pub struct AlignedDataset<R: Record> {
    sanitize: SanitizeConfig,
    config: DatasetConfig,
    channels: Vec<Channel<R>>,
    max_past: usize,
    max_future: usize,
    step: f64,
    key_range: Option<(f64, f64)>,
    size: usize,
}

impl<R: Record> AlignedDataset<R> {
    pub fn new(sanitize: SanitizeConfig, config: DatasetConfig) -> Self {
        Self {
            sanitize,
            config,
            channels: Vec::new(),
            max_past: 0,
            max_future: 0,
            step: 0.0,
            key_range: None,
            size: 0,
        }
    }

    /// Build a dataset from a decoded channel list, in order.
    pub fn from_channels(
        specs: &[ChannelSpec],
        sanitize: SanitizeConfig,
        config: DatasetConfig,
    ) -> Result<Self> {
        let mut ds = Self::new(sanitize, config);
        for spec in specs {
            ds.add_dataset(
                &spec.path,
                spec.past_len,
                spec.future_len,
                spec.norm_window,
                spec.force_rebuild,
            )?;
        }
        Ok(ds)
    }

    /// Add one channel. A CSV path drives the sanitizer (and normalizer); a
    /// `.bin` path is opened directly, normalized first when `norm_window > 0`
    /// and the file is not already a `.normW<norm_window>.bin`.
    /// Returns the channel index.
    pub fn add_dataset(
        &mut self,
        path: &Path,
        past_len: usize,
        future_len: usize,
        norm_window: usize,
        force_rebuild: bool,
    ) -> Result<usize> {
        if past_len == 0 {
            bail!("{}: past window length must be >= 1", path.display());
        }
        let file = self
            .resolve_source(path, norm_window, force_rebuild)
            .with_context(|| format!("preparing channel {}", path.display()))?;
        let store = WindowedStore::<R>::open(&file, past_len, future_len)
            .with_context(|| format!("opening channel {}", file.display()))?;

        if store.step() > 0.0 && self.step > 0.0 {
            let diff = (store.step() - self.step).abs();
            if diff > self.sanitize.rel_tolerance * self.step {
                bail!(
                    "{}: grid step {} does not match the dataset step {}",
                    file.display(),
                    store.step(),
                    self.step
                );
            }
        }

        info!(
            channel = self.channels.len(),
            path = %file.display(),
            records = store.len(),
            step = store.step(),
            past_len,
            future_len,
            "channel added"
        );
        self.channels.push(Channel {
            source: path.to_path_buf(),
            past_len,
            future_len,
            norm_window,
            store,
            skew_warned: AtomicBool::new(false),
        });
        self.rebuild_index();
        Ok(self.channels.len() - 1)
    }

    fn resolve_source(&self, path: &Path, norm_window: usize, force: bool) -> Result<PathBuf> {
        let is_bin = path.extension().and_then(|e| e.to_str()) == Some("bin");
        if !is_bin {
            return Ok(sanitize::<R>(path, norm_window, force, &self.sanitize)?.path);
        }
        if !path.is_file() {
            bail!("channel file not found: {}", path.display());
        }
        if norm_window == 0 || parse_norm_window(path) == Some(norm_window) {
            return Ok(path.to_path_buf());
        }
        if parse_norm_window(path).is_some() {
            bail!(
                "{}: already normalized with a different window than {}",
                path.display(),
                norm_window
            );
        }
        let (norm, _) = ensure_normalized::<R>(path, norm_window, force, &self.sanitize)?;
        Ok(norm)
    }

    fn rebuild_index(&mut self) {
        self.max_past = self.channels.iter().map(|c| c.past_len).max().unwrap_or(0);
        self.max_future = self.channels.iter().map(|c| c.future_len).max().unwrap_or(0);
        self.step = self
            .channels
            .iter()
            .map(|c| c.store.step())
            .find(|s| *s > 0.0)
            .unwrap_or(0.0);

        let mut range: Option<(f64, f64)> = None;
        for (i, ch) in self.channels.iter().enumerate() {
            let Some((lo, hi)) = ch.anchor_range() else {
                range = None;
                break;
            };
            range = Some(match range {
                Some((l, r)) if i > 0 => (l.max(lo), r.min(hi)),
                _ => (lo, hi),
            });
        }

        let slack = self.config.alignment_tolerance * self.step;
        self.key_range = range.filter(|(l, r)| *l <= *r + slack);
        self.size = match self.key_range {
            None => 0,
            Some((l, r)) if self.step > 0.0 => {
                (((r - l) / self.step + self.config.alignment_tolerance).floor().max(0.0) as usize)
                    + 1
            }
            Some((l, r)) => usize::from((r - l).abs() <= SINGLE_KEY_EPS * l.abs().max(1.0)),
        };
        if self.size == 0 {
            self.key_range = None;
        }
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn channels(&self) -> &[Channel<R>] {
        &self.channels
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn max_past(&self) -> usize {
        self.max_past
    }

    pub fn max_future(&self) -> usize {
        self.max_future
    }

    pub fn feature_dim(&self) -> usize {
        R::feature_dim()
    }

    /// Shared grid step; 0.0 when every channel holds a single record.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// First and last anchor key of the index space.
    pub fn key_range(&self) -> Option<(f64, f64)> {
        self.key_range
    }

    pub fn key_of_index(&self, index: usize) -> Result<f64> {
        if index >= self.size {
            return Err(StoreError::IndexOutOfRange {
                index,
                len: self.size,
            }
            .into());
        }
        let (left, _) = self.key_range.context("empty index space")?;
        Ok(left + index as f64 * self.step)
    }

    /// Nearest anchor index for `key`; keys beyond half a step outside the
    /// index space are rejected.
    pub fn index_of_key(&self, key: f64) -> Result<usize> {
        let Some((left, right)) = self.key_range else {
            bail!("dataset has no valid anchors");
        };
        let out_of_range = || StoreError::KeyOutOfRange {
            key,
            leftmost: left,
            rightmost: right,
        };
        if !key.is_finite() {
            return Err(out_of_range().into());
        }
        if self.step <= 0.0 {
            return if (key - left).abs() <= SINGLE_KEY_EPS * left.abs().max(1.0) {
                Ok(0)
            } else {
                Err(out_of_range().into())
            };
        }
        let pos = (key - left) / self.step;
        if pos < -0.5 || pos > (self.size - 1) as f64 + 0.5 {
            return Err(out_of_range().into());
        }
        Ok((pos.round().max(0.0) as usize).min(self.size - 1))
    }

    // =========================================================================
    // SAMPLING
    // =========================================================================

    /// Sample at `index` of the index space, padded to `(max_past, max_future)`.
    pub fn get(&self, index: usize) -> Result<Sample> {
        let key = self.key_of_index(index)?;
        self.assemble(key, None, self.max_past, self.max_future)
    }

    /// Ad hoc sample: every channel contributes `past_len`/`future_len`
    /// records around the record nearest `key`.
    pub fn get_sequences_around_key_value(
        &self,
        key: f64,
        past_len: usize,
        future_len: usize,
    ) -> Result<Sample> {
        if past_len == 0 {
            bail!("past window length must be >= 1");
        }
        if self.channels.is_empty() {
            bail!("dataset has no channels");
        }
        self.assemble(key, Some((past_len, future_len)), past_len, future_len)
    }

    /// Samples for every anchor with key in `[left, right]` (inclusive).
    pub fn range_samples_by_keys(&self, left: f64, right: f64) -> Result<Vec<Sample>> {
        if left > right {
            return Err(StoreError::InvalidRange { left, right }.into());
        }
        let lo = self.index_of_key(left)?;
        let hi = self.index_of_key(right)?;
        (lo..=hi).map(|i| self.get(i)).collect()
    }

    /// Resolve `key` on one channel. Grid anchors go through the alignment
    /// policy; ad hoc keys take the nearest record as is.
    fn resolve(&self, channel: usize, key: f64, on_grid: bool) -> Result<usize> {
        let ch = &self.channels[channel];
        let index = ch
            .store
            .index_of_key(key)
            .with_context(|| format!("channel {} ({})", channel, ch.store.path().display()))?;
        if on_grid && self.step > 0.0 {
            let found = ch.store.key_at(index)?;
            let skew = (found - key).abs();
            if skew > self.config.alignment_tolerance * self.step {
                if self.config.strict_alignment {
                    bail!(
                        "channel {} ({}): no record at key {} (closest {}, skew {})",
                        channel,
                        ch.store.path().display(),
                        key,
                        found,
                        skew
                    );
                }
                if !ch.skew_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        channel,
                        path = %ch.store.path().display(),
                        key,
                        closest = found,
                        skew,
                        "channel grid offset from dataset grid; using closest record"
                    );
                }
            }
        }
        Ok(index)
    }

    fn assemble(
        &self,
        key: f64,
        lens: Option<(usize, usize)>,
        out_past: usize,
        out_future: usize,
    ) -> Result<Sample> {
        let c = self.channels.len();
        let d = R::feature_dim();

        let mut past = PaddedWindow::new(c, out_past, d);
        let mut future = PaddedWindow::new(c, out_future, d);
        let mut stats = self
            .config
            .window_stats
            .then(|| (vec![0.0; c * d], vec![1.0; c * d]));

        for (ci, ch) in self.channels.iter().enumerate() {
            let (p, f) = lens.unwrap_or((ch.past_len, ch.future_len));
            let index = self.resolve(ci, key, lens.is_none())?;
            let ws = ch.store.get_window(index, p, f)?;
            past.fill_past(ci, &ws);
            future.fill_future(ci, &ws);
            if let Some((mean, std)) = stats.as_mut() {
                let cell = ci * d..(ci + 1) * d;
                window_stats(&ws, &mut mean[cell.clone()], &mut std[cell]);
            }
        }

        let (norm_mean, norm_std) = match stats {
            Some((mean, std)) => (
                Some(tensor::from_shape_vec(&[c, d], mean, "norm_mean")?),
                Some(tensor::from_shape_vec(&[c, d], std, "norm_std")?),
            ),
            None => (None, None),
        };

        Ok(Sample {
            layout: Layout::Single,
            past: Some(past.into_window(&PAST_FIELDS)?),
            future: Some(future.into_window(&FUTURE_FIELDS)?),
            anchor_key: Some(tensor::scalar(key)),
            norm_mean,
            norm_std,
            attached: None,
        })
    }
}

// =============================================================================
// PADDING
// =============================================================================

const PAST_FIELDS: [&str; 3] = ["past.features", "past.valid", "past.keys"];
const FUTURE_FIELDS: [&str; 3] = ["future.features", "future.valid", "future.keys"];

struct PaddedWindow {
    channels: usize,
    len: usize,
    dim: usize,
    features: Vec<f64>,
    valid: Vec<bool>,
    keys: Vec<f64>,
}

impl PaddedWindow {
    fn new(channels: usize, len: usize, dim: usize) -> Self {
        Self {
            channels,
            len,
            dim,
            features: vec![0.0; channels * len * dim],
            valid: vec![false; channels * len],
            keys: vec![0.0; channels * len],
        }
    }

    fn put(&mut self, channel: usize, slot: usize, src: &RecordWindow, row: usize) {
        let at = channel * self.len + slot;
        self.valid[at] = src.valid[row];
        self.keys[at] = src.keys[row];
        let dst = at * self.dim;
        let s = row * self.dim;
        self.features[dst..dst + self.dim].copy_from_slice(&src.features[s..s + self.dim]);
    }

    /// Right-align: the anchor lands in the last slot.
    fn fill_past(&mut self, channel: usize, ws: &WindowedSample) {
        let n = ws.past.len().min(self.len);
        let skip = ws.past.len() - n;
        let offset = self.len - n;
        for j in 0..n {
            self.put(channel, offset + j, &ws.past, skip + j);
        }
    }

    fn fill_future(&mut self, channel: usize, ws: &WindowedSample) {
        let n = ws.future.len().min(self.len);
        for j in 0..n {
            self.put(channel, j, &ws.future, j);
        }
    }

    fn into_window(self, names: &[&'static str; 3]) -> Result<Window, CollateError> {
        let rows = [self.channels, self.len];
        let cells = [self.channels, self.len, self.dim];
        Ok(Window {
            features: tensor::from_shape_vec(&cells, self.features, names[0])?,
            valid: tensor::from_shape_vec(&rows, self.valid, names[1])?,
            keys: Some(tensor::from_shape_vec(&rows, self.keys, names[2])?),
        })
    }
}

/// Mean/std of the valid past entries, per feature. Std stays 1.0 without spread.
fn window_stats(ws: &WindowedSample, mean: &mut [f64], std: &mut [f64]) {
    let d = ws.feature_dim;
    let rows: Vec<usize> = (0..ws.past.len()).filter(|r| ws.past.valid[*r]).collect();
    if rows.is_empty() {
        return;
    }
    let n = rows.len() as f64;
    for f in 0..d {
        let m = rows.iter().map(|r| ws.past.features[r * d + f]).sum::<f64>() / n;
        let var = rows
            .iter()
            .map(|r| {
                let x = ws.past.features[r * d + f] - m;
                x * x
            })
            .sum::<f64>()
            / n;
        mean[f] = m;
        std[f] = if var > 0.0 { var.sqrt() } else { 1.0 };
    }
}
