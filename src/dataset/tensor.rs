//! Batch tensors.
//!
//! Every sample field is a dynamic-rank [`ArcArray`]. Stacking and
//! concatenation go through `ndarray::stack` / `ndarray::concatenate` along
//! `Axis(0)`; splitting the leading axis back out either hands out views that
//! keep the batch's allocation alive or deep copies.

use crate::dataset::collate::CollateError;
use ndarray::{Array1, ArcArray, ArrayView, Axis, IxDyn, Slice};

pub type Tensor<T> = ArcArray<T, IxDyn>;

/// Build from row-major `data`; its length must equal the product of `shape`.
pub fn from_shape_vec<T>(
    shape: &[usize],
    data: Vec<T>,
    field: &'static str,
) -> Result<Tensor<T>, CollateError> {
    ArcArray::from_shape_vec(IxDyn(shape), data)
        .map_err(|source| CollateError::Shape { field, source })
}

/// Rank-0 tensor.
pub fn scalar<T: Clone>(value: T) -> Tensor<T> {
    ArcArray::from_elem(IxDyn(&[]), value)
}

pub fn from_vec<T>(data: Vec<T>) -> Tensor<T> {
    Array1::from(data).into_dyn().into_shared()
}

/// Whether `view` points into `parent`'s allocation.
pub fn shares_storage<T>(view: &Tensor<T>, parent: &Tensor<T>) -> bool {
    parent
        .as_slice_memory_order()
        .map_or(false, |s| s.as_ptr_range().contains(&view.as_ptr()))
}

fn views<'a, T>(parts: &[&'a Tensor<T>]) -> Vec<ArrayView<'a, T, IxDyn>> {
    parts.iter().map(|&p| p.view()).collect()
}

fn detach<T: Clone>(tensor: Tensor<T>, deep_copy: bool) -> Tensor<T> {
    if deep_copy {
        tensor.to_owned().into_shared()
    } else {
        tensor
    }
}

/// Stack equally-shaped tensors along a new leading axis.
pub fn stack<T: Clone>(
    parts: &[&Tensor<T>],
    field: &'static str,
) -> Result<Tensor<T>, CollateError> {
    let first = parts.first().ok_or(CollateError::EmptyBatch)?;
    for (i, p) in parts.iter().enumerate() {
        if p.shape() != first.shape() {
            return Err(CollateError::ShapeMismatch {
                field,
                index: i,
                expected: first.shape().to_vec(),
                found: p.shape().to_vec(),
            });
        }
    }
    ndarray::stack(Axis(0), &views(parts))
        .map(|a| a.into_shared())
        .map_err(|source| CollateError::Shape { field, source })
}

/// Concatenate along the existing leading axis; trailing shapes must match.
pub fn concat<T: Clone>(
    parts: &[&Tensor<T>],
    field: &'static str,
) -> Result<Tensor<T>, CollateError> {
    let first = parts.first().ok_or(CollateError::EmptyBatch)?;
    if first.ndim() == 0 {
        return Err(CollateError::ShapeMismatch {
            field,
            index: 0,
            expected: vec![0],
            found: Vec::new(),
        });
    }
    let trailing = &first.shape()[1..];
    for (i, p) in parts.iter().enumerate() {
        if p.ndim() != first.ndim() || &p.shape()[1..] != trailing {
            let mut expected = vec![p.shape().first().copied().unwrap_or(0)];
            expected.extend_from_slice(trailing);
            return Err(CollateError::ShapeMismatch {
                field,
                index: i,
                expected,
                found: p.shape().to_vec(),
            });
        }
    }
    ndarray::concatenate(Axis(0), &views(parts))
        .map(|a| a.into_shared())
        .map_err(|source| CollateError::Shape { field, source })
}

/// Split the leading axis into consecutive chunks of `sizes` rows each.
pub fn split<T: Clone>(
    tensor: &Tensor<T>,
    sizes: &[usize],
    deep_copy: bool,
    field: &'static str,
) -> Result<Vec<Tensor<T>>, CollateError> {
    let total: usize = sizes.iter().sum();
    if tensor.ndim() == 0 || tensor.len_of(Axis(0)) != total {
        return Err(CollateError::ShapeMismatch {
            field,
            index: 0,
            expected: vec![total],
            found: tensor.shape().to_vec(),
        });
    }
    let mut out = Vec::with_capacity(sizes.len());
    let mut row = 0usize;
    for &n in sizes {
        let mut part = tensor.clone();
        part.slice_axis_inplace(Axis(0), Slice::from(row..row + n));
        out.push(detach(part, deep_copy));
        row += n;
    }
    Ok(out)
}

/// Inverse of [`stack`]: one tensor per leading-axis row.
pub fn unstack<T: Clone>(
    tensor: &Tensor<T>,
    deep_copy: bool,
    field: &'static str,
) -> Result<Vec<Tensor<T>>, CollateError> {
    if tensor.ndim() == 0 {
        return Err(CollateError::ShapeMismatch {
            field,
            index: 0,
            expected: vec![0],
            found: Vec::new(),
        });
    }
    Ok((0..tensor.len_of(Axis(0)))
        .map(|r| detach(tensor.clone().index_axis_move(Axis(0), r), deep_copy))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_and_unstack() {
        let a = from_vec(vec![1.0, 2.0]);
        let b = from_vec(vec![3.0, 4.0]);
        let s = stack(&[&a, &b], "x").unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);

        let rows = unstack(&s, false, "x").unwrap();
        assert_eq!(rows, vec![a, b]);
        assert!(shares_storage(&rows[1], &s));
        let copied = unstack(&s, true, "x").unwrap();
        assert!(!shares_storage(&copied[0], &s));
    }

    #[test]
    fn test_stack_shape_mismatch_names_field() {
        let a = from_vec(vec![1, 2]);
        let b = from_vec(vec![1, 2, 3]);
        match stack(&[&a, &b], "past.features") {
            Err(CollateError::ShapeMismatch { field, index, .. }) => {
                assert_eq!(field, "past.features");
                assert_eq!(index, 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_concat_and_split() {
        let a = from_shape_vec(&[1, 2], vec![1, 2], "x").unwrap();
        let b = from_shape_vec(&[2, 2], vec![3, 4, 5, 6], "x").unwrap();
        let c = concat(&[&a, &b], "x").unwrap();
        assert_eq!(c.shape(), &[3, 2]);
        let parts = split(&c, &[1, 2], false, "x").unwrap();
        assert_eq!(parts, vec![a, b]);
        assert!(shares_storage(&parts[1], &c));
        assert!(split(&c, &[1, 1], false, "x").is_err());
    }

    #[test]
    fn test_scalar_stack() {
        let s = stack(&[&scalar(1.5), &scalar(2.5)], "k").unwrap();
        assert_eq!(s.shape(), &[2]);
        let back = unstack(&s, false, "k").unwrap();
        assert_eq!(back[1], scalar(2.5));
        assert_eq!(back[1].len(), 1);
    }

    #[test]
    fn test_wrong_data_length_is_an_error() {
        match from_shape_vec(&[2, 3], vec![0.0; 5], "norm_mean") {
            Err(CollateError::Shape { field, .. }) => assert_eq!(field, "norm_mean"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
