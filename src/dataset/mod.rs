//! Gridded Dataset Pipeline
//!
//! Turns irregular delimited time series into gap-free fixed-layout binary
//! grids, optionally z-scores them causally, and serves shape-consistent
//! aligned windows across many channels.
//!
//! # Architecture
//!
//! ```text
//!   CSV ──▶ sanitize ──▶ <stem>.bin ──▶ normalize ──▶ <stem>.normW<w>.bin
//!                             │                              │
//!                             └──────────────┬───────────────┘
//!                                            ▼
//!                               ┌─────────────────────────┐
//!                               │ WindowedStore (mmap)    │  one per channel
//!                               └────────────┬────────────┘
//!                                            ▼
//!                               ┌─────────────────────────┐
//!                               │ AlignedDataset          │  shared index space,
//!                               │ (pad to max P / max F)  │  per-channel windows
//!                               └────────────┬────────────┘
//!                                            ▼
//!                  ┌──────────┐     ┌─────────────────────┐
//!                  │ Sampler  │────▶│ BatchLoader (rayon) │
//!                  └──────────┘     └──────────┬──────────┘
//!                                              ▼
//!                                   collate / decollate ──▶ Sample batches
//! ```
//!
//! # Grid Guarantees
//!
//! - **Keys**: strictly increasing, every delta exactly one step
//! - **Gaps**: filled with invalid null records, never interpolated
//! - **Normalization**: each value scored against strictly earlier records
//! - **Artifacts**: written to a temporary sibling, then renamed into place

pub mod aligned;
pub mod collate;
pub mod config;
pub mod loader;
pub mod normalize;
pub mod record;
pub mod sample;
pub mod sampler;
pub mod sanitize;
pub mod stats;
pub mod store;
pub mod tensor;


// Re-exports for convenience
pub use aligned::{AlignedDataset, Channel};
pub use collate::{collate_full, collate_future, collate_past, decollate, CollateError};
pub use config::{ChannelSpec, DatasetConfig, LoaderConfig, PipelineConfig, SanitizeConfig};
pub use loader::{BatchLoader, Batches, LoaderShape};
pub use normalize::{normalize, NormalizeReport};
pub use record::{Candle, Record, RecordKind, RecordParseError, Scalar};
pub use sample::{Layout, Sample, Window};
pub use sampler::Sampler;
pub use sanitize::{
    ensure_normalized, export_csv, norm_path, parse_norm_window, raw_path, read_records,
    sanitize, write_records, SanitizeOutcome, SanitizeReport,
};
pub use stats::{StatsPack, StatsWindow};
pub use store::{RecordWindow, StoreError, WindowedSample, WindowedStore};
pub use tensor::Tensor;
