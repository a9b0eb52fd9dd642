//! Pipeline configuration
//!
//! Typed knobs for the sanitizer, the aligned dataset and the batch loader,
//! plus the decoded channel list. Loaded from TOML; every field has a default
//! so a partial file (or no file at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub sanitize: SanitizeConfig,

    #[serde(default)]
    pub dataset: DatasetConfig,

    #[serde(default)]
    pub loader: LoaderConfig,

    /// Ordered channel descriptors consumed by `AlignedDataset::add_dataset`.
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `GRIDSET_CONFIG_PATH` or the default path, falling back to defaults.
    pub fn from_env() -> Self {
        let path =
            std::env::var("GRIDSET_CONFIG_PATH").unwrap_or_else(|_| "gridset.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default pipeline config ({}): {}", path, e);
            Self::default()
        })
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.sanitize.validate()?;
        self.loader.validate()?;
        if !(self.dataset.alignment_tolerance > 0.0 && self.dataset.alignment_tolerance <= 0.5) {
            anyhow::bail!(
                "dataset.alignment_tolerance must be in (0, 0.5], got {}",
                self.dataset.alignment_tolerance
            );
        }
        for (i, ch) in self.channels.iter().enumerate() {
            if ch.past_len == 0 {
                anyhow::bail!("channels[{}] ({}): past_len must be >= 1", i, ch.path.display());
            }
        }
        Ok(())
    }
}

// =============================================================================
// SANITIZER / NORMALIZER
// =============================================================================

/// Settings shared by the CSV sanitizer and the causal normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeConfig {
    /// Number of positive key deltas sampled to infer the regular step
    #[serde(default = "default_bootstrap_deltas")]
    pub bootstrap_deltas: usize,

    /// Deltas at or below this are treated as duplicate keys
    #[serde(default = "default_abs_tolerance")]
    pub abs_tolerance: f64,

    /// Max distance of `delta / step` from an integer, and relative duplicate threshold
    #[serde(default = "default_rel_tolerance")]
    pub rel_tolerance: f64,

    /// Hard ceiling on the number of steps bridged by one gap
    #[serde(default = "default_max_gap_steps")]
    pub max_gap_steps: u64,

    /// Records buffered between flushes (also the normalizer chunk size)
    #[serde(default = "default_buffer_records")]
    pub buffer_records: usize,

    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Records between progress log lines
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,

    /// Rebuild every artifact even when it is fresh
    #[serde(default)]
    pub force_rebuild: bool,
}

fn default_bootstrap_deltas() -> usize {
    64
}
fn default_abs_tolerance() -> f64 {
    1e-9
}
fn default_rel_tolerance() -> f64 {
    1e-3
}
fn default_max_gap_steps() -> u64 {
    10_000_000
}
fn default_buffer_records() -> usize {
    4096
}
fn default_delimiter() -> char {
    ','
}
fn default_progress_every() -> u64 {
    1_000_000
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            bootstrap_deltas: default_bootstrap_deltas(),
            abs_tolerance: default_abs_tolerance(),
            rel_tolerance: default_rel_tolerance(),
            max_gap_steps: default_max_gap_steps(),
            buffer_records: default_buffer_records(),
            delimiter: default_delimiter(),
            progress_every: default_progress_every(),
            force_rebuild: false,
        }
    }
}

impl SanitizeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bootstrap_deltas == 0 {
            anyhow::bail!("sanitize.bootstrap_deltas must be >= 1");
        }
        if !(self.abs_tolerance >= 0.0 && self.abs_tolerance.is_finite()) {
            anyhow::bail!("sanitize.abs_tolerance must be finite and >= 0");
        }
        if !(self.rel_tolerance > 0.0 && self.rel_tolerance < 0.5) {
            anyhow::bail!(
                "sanitize.rel_tolerance must be in (0, 0.5), got {}",
                self.rel_tolerance
            );
        }
        if self.buffer_records == 0 {
            anyhow::bail!("sanitize.buffer_records must be >= 1");
        }
        if self.max_gap_steps == 0 {
            anyhow::bail!("sanitize.max_gap_steps must be >= 1");
        }
        Ok(())
    }

    /// Threshold below which a delta collapses into a duplicate key.
    pub(crate) fn duplicate_threshold(&self, step: f64) -> f64 {
        self.abs_tolerance.max(step * self.rel_tolerance)
    }
}

// =============================================================================
// ALIGNED DATASET
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Anchor/record key skew, as a fraction of the grid step, still treated
    /// as an exact match. Larger skew means the closest-available record is used.
    #[serde(default = "default_alignment_tolerance")]
    pub alignment_tolerance: f64,

    /// Turn the closest-available fallback into a hard error
    #[serde(default)]
    pub strict_alignment: bool,

    /// Attach per-channel past-window mean/std to every sample
    #[serde(default)]
    pub window_stats: bool,
}

fn default_alignment_tolerance() -> f64 {
    1e-6
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            alignment_tolerance: default_alignment_tolerance(),
            strict_alignment: false,
            window_stats: false,
        }
    }
}

// =============================================================================
// LOADER
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Worker threads assembling batches (throughput only)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Batches assembled per prefetch round
    #[serde(default = "default_prefetch_batches")]
    pub prefetch_batches: usize,

    #[serde(default)]
    pub shuffle: bool,

    #[serde(default)]
    pub seed: u64,

    /// Drop the short final batch of an epoch
    #[serde(default)]
    pub drop_last: bool,

    /// Channel count above which the loader logs an advisory
    #[serde(default = "default_channel_warn_threshold")]
    pub channel_warn_threshold: usize,
}

fn default_batch_size() -> usize {
    32
}
fn default_workers() -> usize {
    1
}
fn default_prefetch_batches() -> usize {
    2
}
fn default_channel_warn_threshold() -> usize {
    64
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            prefetch_batches: default_prefetch_batches(),
            shuffle: false,
            seed: 0,
            drop_last: false,
            channel_warn_threshold: default_channel_warn_threshold(),
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("loader.batch_size must be >= 1");
        }
        if self.workers == 0 {
            anyhow::bail!("loader.workers must be >= 1");
        }
        if self.prefetch_batches == 0 {
            anyhow::bail!("loader.prefetch_batches must be >= 1");
        }
        Ok(())
    }
}

// =============================================================================
// CHANNELS
// =============================================================================

/// One decoded channel descriptor: where the data lives and which windows it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Source CSV, or an already-built `.bin` file
    pub path: PathBuf,

    pub past_len: usize,

    #[serde(default)]
    pub future_len: usize,

    /// Rolling normalization window (0 = raw)
    #[serde(default)]
    pub norm_window: usize,

    #[serde(default)]
    pub force_rebuild: bool,
}
