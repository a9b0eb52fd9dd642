//! Aligned samples and batches.
//!
//! One type covers both: a [`Sample`] with [`Layout::Single`] has no batch
//! axis; stacked or concatenated batches carry a leading batch axis on every
//! tensor.
//!
//! Single-sample shapes (C channels, P past, F future, D features):
//!
//! | field            | shape       |
//! |------------------|-------------|
//! | past.features    | [C, P, D]   |
//! | past.valid       | [C, P]      |
//! | past.keys        | [C, P]      |
//! | future.*         | [C, F, ...] |
//! | anchor_key       | []          |
//! | norm_mean / std  | [C, D]      |
//! | attached         | [K]         |

use crate::dataset::collate::CollateError;
use crate::dataset::tensor::{self, Tensor};

/// How a sample's tensors relate to the samples it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// One sample, no batch axis.
    Single,
    /// `n` single samples stacked along a new batch axis.
    Stacked(usize),
    /// Already-batched inputs concatenated; keeps each input's own layout.
    Concatenated(Vec<Layout>),
}

impl Layout {
    pub fn is_batched(&self) -> bool {
        !matches!(self, Layout::Single)
    }

    /// Rows along the batch axis (1 for a single sample).
    pub fn batch_len(&self) -> usize {
        match self {
            Layout::Single => 1,
            Layout::Stacked(n) => *n,
            Layout::Concatenated(parts) => parts.iter().map(Layout::batch_len).sum(),
        }
    }
}

/// Past or future window of every channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub features: Tensor<f64>,
    pub valid: Tensor<bool>,
    pub keys: Option<Tensor<f64>>,
}

impl Window {
    /// Window length (the P or F axis).
    pub fn len(&self) -> usize {
        let shape = self.valid.shape();
        shape.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub layout: Layout,
    pub past: Option<Window>,
    pub future: Option<Window>,
    pub anchor_key: Option<Tensor<f64>>,
    pub norm_mean: Option<Tensor<f64>>,
    pub norm_std: Option<Tensor<f64>>,
    /// Externally computed vector attached after sampling.
    pub attached: Option<Tensor<f64>>,
}

impl Sample {
    pub fn batch_len(&self) -> usize {
        self.layout.batch_len()
    }

    pub fn is_batched(&self) -> bool {
        self.layout.is_batched()
    }

    /// Attach a vector to a single sample (shape `[len]`).
    pub fn attach_vec(&mut self, values: Vec<f64>) {
        self.attached = Some(tensor::from_vec(values));
    }

    /// Attach an arbitrary tensor; for batches its leading axis must match the batch.
    pub fn attach(&mut self, values: Tensor<f64>) -> Result<(), CollateError> {
        if self.is_batched() && values.shape().first() != Some(&self.batch_len()) {
            let mut expected = vec![self.batch_len()];
            expected.extend_from_slice(values.shape().get(1..).unwrap_or(&[]));
            return Err(CollateError::ShapeMismatch {
                field: "attached",
                index: 0,
                expected,
                found: values.shape().to_vec(),
            });
        }
        self.attached = Some(values);
        Ok(())
    }

    /// Anchor key of a single sample.
    pub fn anchor(&self) -> Option<f64> {
        match (&self.layout, &self.anchor_key) {
            (Layout::Single, Some(k)) => k.iter().next().copied(),
            _ => None,
        }
    }

    pub fn channels(&self) -> usize {
        let w = self.past.as_ref().or(self.future.as_ref());
        let axis = usize::from(self.is_batched());
        w.and_then(|w| w.valid.shape().get(axis).copied()).unwrap_or(0)
    }
}
