//! Sample Collator
//!
//! Stacks unbatched samples (new leading axis) or concatenates already-batched
//! ones (existing leading axis), field by field. Every field must have one
//! shape across the batch. Optional fields are collated only when present on
//! every sample; partial presence is an error. [`decollate`] is the exact
//! inverse of the collate functions.

use crate::dataset::sample::{Layout, Sample, Window};
use crate::dataset::tensor::{self, Tensor};

/// Batching contract violations. Each names the offending field.
#[derive(Debug, Clone, PartialEq)]
pub enum CollateError {
    EmptyBatch,
    /// Batched and unbatched samples mixed in one call
    MixedLayout,
    /// Required window absent from every sample
    MissingField(&'static str),
    /// Field present on some samples only
    PartialField {
        field: &'static str,
        present: usize,
        total: usize,
    },
    ShapeMismatch {
        field: &'static str,
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /// Data that does not fit the declared tensor shape
    Shape {
        field: &'static str,
        source: ndarray::ShapeError,
    },
    /// `decollate` called on a single sample
    NotBatched,
}

impl std::fmt::Display for CollateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyBatch => write!(f, "cannot collate an empty batch"),
            Self::MixedLayout => write!(f, "batched and unbatched samples mixed in one batch"),
            Self::MissingField(field) => write!(f, "field '{}' missing from every sample", field),
            Self::PartialField {
                field,
                present,
                total,
            } => write!(
                f,
                "optional field '{}' present on {} of {} samples",
                field, present, total
            ),
            Self::ShapeMismatch {
                field,
                index,
                expected,
                found,
            } => write!(
                f,
                "shape mismatch for '{}' at sample {}: expected {:?}, found {:?}",
                field, index, expected, found
            ),
            Self::Shape { field, source } => write!(f, "invalid shape for '{}': {}", field, source),
            Self::NotBatched => write!(f, "cannot decollate an unbatched sample"),
        }
    }
}

impl std::error::Error for CollateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Shape { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Past,
    Future,
    Full,
}

impl Part {
    fn past(self) -> bool {
        matches!(self, Part::Past | Part::Full)
    }

    fn future(self) -> bool {
        matches!(self, Part::Future | Part::Full)
    }
}

/// Collate past windows only (future dropped).
pub fn collate_past(samples: &[Sample]) -> Result<Sample, CollateError> {
    collate(samples, Part::Past)
}

/// Collate future windows only (past dropped).
pub fn collate_future(samples: &[Sample]) -> Result<Sample, CollateError> {
    collate(samples, Part::Future)
}

pub fn collate_full(samples: &[Sample]) -> Result<Sample, CollateError> {
    collate(samples, Part::Full)
}

// =============================================================================
// COLLATE
// =============================================================================

fn join<T: Clone>(
    parts: &[&Tensor<T>],
    rows: Option<&[usize]>,
    field: &'static str,
) -> Result<Tensor<T>, CollateError> {
    match rows {
        None => tensor::stack(parts, field),
        Some(rows) => {
            for (i, (p, &n)) in parts.iter().zip(rows).enumerate() {
                if p.shape().first() != Some(&n) {
                    let mut expected = vec![n];
                    expected.extend_from_slice(p.shape().get(1..).unwrap_or(&[]));
                    return Err(CollateError::ShapeMismatch {
                        field,
                        index: i,
                        expected,
                        found: p.shape().to_vec(),
                    });
                }
            }
            tensor::concat(parts, field)
        }
    }
}

fn collate_optional<'a, T: Clone + 'a>(
    samples: &'a [Sample],
    get: impl Fn(&'a Sample) -> Option<&'a Tensor<T>>,
    rows: Option<&[usize]>,
    field: &'static str,
) -> Result<Option<Tensor<T>>, CollateError> {
    let parts: Vec<&Tensor<T>> = samples.iter().filter_map(&get).collect();
    if parts.is_empty() {
        return Ok(None);
    }
    if parts.len() != samples.len() {
        return Err(CollateError::PartialField {
            field,
            present: parts.len(),
            total: samples.len(),
        });
    }
    join(&parts, rows, field).map(Some)
}

struct WindowFields {
    name: &'static str,
    features: &'static str,
    valid: &'static str,
    keys: &'static str,
}

const PAST: WindowFields = WindowFields {
    name: "past",
    features: "past.features",
    valid: "past.valid",
    keys: "past.keys",
};

const FUTURE: WindowFields = WindowFields {
    name: "future",
    features: "future.features",
    valid: "future.valid",
    keys: "future.keys",
};

fn collate_window<'a>(
    samples: &'a [Sample],
    get: impl Fn(&'a Sample) -> Option<&'a Window>,
    rows: Option<&[usize]>,
    names: &WindowFields,
) -> Result<Window, CollateError> {
    let windows: Vec<&Window> = samples.iter().filter_map(&get).collect();
    if windows.is_empty() {
        return Err(CollateError::MissingField(names.name));
    }
    if windows.len() != samples.len() {
        return Err(CollateError::PartialField {
            field: names.name,
            present: windows.len(),
            total: samples.len(),
        });
    }
    let features: Vec<&Tensor<f64>> = windows.iter().map(|w| &w.features).collect();
    let valid: Vec<&Tensor<bool>> = windows.iter().map(|w| &w.valid).collect();
    Ok(Window {
        features: join(&features, rows, names.features)?,
        valid: join(&valid, rows, names.valid)?,
        keys: collate_optional(
            samples,
            |s| get(s).and_then(|w| w.keys.as_ref()),
            rows,
            names.keys,
        )?,
    })
}

fn collate(samples: &[Sample], part: Part) -> Result<Sample, CollateError> {
    let first = samples.first().ok_or(CollateError::EmptyBatch)?;
    let batched = first.is_batched();
    if samples.iter().any(|s| s.is_batched() != batched) {
        return Err(CollateError::MixedLayout);
    }

    let row_counts: Vec<usize> = samples.iter().map(Sample::batch_len).collect();
    let (layout, rows) = if batched {
        let parts = samples.iter().map(|s| s.layout.clone()).collect();
        (Layout::Concatenated(parts), Some(row_counts.as_slice()))
    } else {
        (Layout::Stacked(samples.len()), None)
    };

    let past = if part.past() {
        Some(collate_window(samples, |s| s.past.as_ref(), rows, &PAST)?)
    } else {
        None
    };
    let future = if part.future() {
        Some(collate_window(samples, |s| s.future.as_ref(), rows, &FUTURE)?)
    } else {
        None
    };

    Ok(Sample {
        layout,
        past,
        future,
        anchor_key: collate_optional(samples, |s| s.anchor_key.as_ref(), rows, "anchor_key")?,
        norm_mean: collate_optional(samples, |s| s.norm_mean.as_ref(), rows, "norm_mean")?,
        norm_std: collate_optional(samples, |s| s.norm_std.as_ref(), rows, "norm_std")?,
        attached: collate_optional(samples, |s| s.attached.as_ref(), rows, "attached")?,
    })
}

// =============================================================================
// DECOLLATE
// =============================================================================

fn split_field<T: Clone>(
    t: &Tensor<T>,
    layout: &Layout,
    deep_copy: bool,
    field: &'static str,
) -> Result<Vec<Tensor<T>>, CollateError> {
    match layout {
        Layout::Single => Err(CollateError::NotBatched),
        Layout::Stacked(n) => {
            if t.shape().first() != Some(n) {
                return Err(CollateError::ShapeMismatch {
                    field,
                    index: 0,
                    expected: vec![*n],
                    found: t.shape().to_vec(),
                });
            }
            tensor::unstack(t, deep_copy, field)
        }
        Layout::Concatenated(parts) => {
            let sizes: Vec<usize> = parts.iter().map(Layout::batch_len).collect();
            tensor::split(t, &sizes, deep_copy, field)
        }
    }
}

fn split_optional<T: Clone>(
    t: Option<&Tensor<T>>,
    layout: &Layout,
    deep_copy: bool,
    field: &'static str,
) -> Result<Option<Vec<Tensor<T>>>, CollateError> {
    t.map(|t| split_field(t, layout, deep_copy, field))
        .transpose()
}

struct SplitWindow {
    features: Vec<Tensor<f64>>,
    valid: Vec<Tensor<bool>>,
    keys: Option<Vec<Tensor<f64>>>,
}

fn split_window(
    window: Option<&Window>,
    layout: &Layout,
    deep_copy: bool,
    names: &WindowFields,
) -> Result<Option<SplitWindow>, CollateError> {
    let Some(w) = window else {
        return Ok(None);
    };
    Ok(Some(SplitWindow {
        features: split_field(&w.features, layout, deep_copy, names.features)?,
        valid: split_field(&w.valid, layout, deep_copy, names.valid)?,
        keys: split_optional(w.keys.as_ref(), layout, deep_copy, names.keys)?,
    }))
}

fn take<T>(parts: &mut Option<Vec<T>>, i: usize) -> Option<T>
where
    T: Clone,
{
    parts.as_mut().map(|p| p[i].clone())
}

/// Split a batch back into the samples (or batches) it was collated from.
/// With `deep_copy == false` the parts share the batch's storage.
pub fn decollate(batch: &Sample, deep_copy: bool) -> Result<Vec<Sample>, CollateError> {
    let (count, part_layouts): (usize, Vec<Layout>) = match &batch.layout {
        Layout::Single => return Err(CollateError::NotBatched),
        Layout::Stacked(n) => (*n, vec![Layout::Single; *n]),
        Layout::Concatenated(parts) => (parts.len(), parts.clone()),
    };
    let layout = &batch.layout;

    let mut past = split_window(batch.past.as_ref(), layout, deep_copy, &PAST)?;
    let mut future = split_window(batch.future.as_ref(), layout, deep_copy, &FUTURE)?;
    let mut anchor = split_optional(batch.anchor_key.as_ref(), layout, deep_copy, "anchor_key")?;
    let mut mean = split_optional(batch.norm_mean.as_ref(), layout, deep_copy, "norm_mean")?;
    let mut stds = split_optional(batch.norm_std.as_ref(), layout, deep_copy, "norm_std")?;
    let mut attached = split_optional(batch.attached.as_ref(), layout, deep_copy, "attached")?;

    let window_at = |w: &mut Option<SplitWindow>, i: usize| {
        w.as_mut().map(|w| Window {
            features: w.features[i].clone(),
            valid: w.valid[i].clone(),
            keys: w.keys.as_ref().map(|k| k[i].clone()),
        })
    };

    let mut out = Vec::with_capacity(count);
    for (i, layout) in part_layouts.into_iter().enumerate() {
        out.push(Sample {
            layout,
            past: window_at(&mut past, i),
            future: window_at(&mut future, i),
            anchor_key: take(&mut anchor, i),
            norm_mean: take(&mut mean, i),
            norm_std: take(&mut stds, i),
            attached: take(&mut attached, i),
        });
    }
    Ok(out)
}
