//! Gridset Library
//!
//! Exposes the dataset pipeline for use by binaries and tests.

pub mod dataset;

pub use dataset::{
    AlignedDataset, BatchLoader, Candle, PipelineConfig, Record, RecordKind, Sample, Sampler,
    Scalar, WindowedStore,
};
