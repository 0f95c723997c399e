//! Splitting the gate source into its gate slices, and joining them back.
//!
//! The gate source `x` has shape `(batch, (3 + N) * F, ...trailing)`. It is
//! cut *thickly* along the feature axis: slice `g` covers feature indices
//! `g * F .. (g + 1) * F`, so for every batch row the slices are contiguous
//! runs of `F * prod(trailing)` elements. The order is fixed:
//!
//! ```text
//! a | i | o | f_1 | f_2 | ... | f_N
//! ```

use rayon::prelude::*;

use crate::error::{Result, TreeLstmError};
use crate::tensors::{Element, Tensor};

/// Number of gate slices for a given arity.
#[inline]
#[must_use]
pub const fn gate_count(arity: usize) -> usize {
    3 + arity
}

/// The `3 + N` slices of a gate source, each shaped like one child cell.
#[derive(Debug, Clone, PartialEq)]
pub struct GateSet<T> {
    /// Candidate cell input logits.
    pub a: Tensor<T>,
    /// Input gate logits.
    pub i: Tensor<T>,
    /// Output gate logits.
    pub o: Tensor<T>,
    /// Per-child forget gate logits, `f_1..f_N`.
    pub forget: Vec<Tensor<T>>,
}

impl<T: Element> GateSet<T> {
    /// Arity this gate set was split for.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.forget.len()
    }

    /// Iterates the slices in storage order `a, i, o, f_1..f_N`.
    pub fn iter(&self) -> impl Iterator<Item = &Tensor<T>> {
        [&self.a, &self.i, &self.o].into_iter().chain(self.forget.iter())
    }

    /// Joins the slices back into one tensor along the feature axis.
    ///
    /// This is the inverse of [`split`].
    ///
    /// # Panics
    /// Panics if the slices do not all share one shape of rank ≥ 2.
    #[must_use]
    pub fn concat(&self) -> Tensor<T> {
        let shape = self.a.shape.clone();
        assert!(shape.len() >= 2, "gate slices need rank >= 2");
        assert!(self.iter().all(|g| g.shape == shape), "gate slices differ in shape");

        let groups = gate_count(self.arity());
        let batch = shape[0];
        let inner = inner_len(&shape);
        let slices: Vec<&Tensor<T>> = self.iter().collect();

        let mut data = vec![T::zero(); batch * groups * inner];
        if inner > 0 {
            data.par_chunks_mut(groups * inner)
                .enumerate()
                .for_each(|(b, row)| {
                    for (g, slice) in slices.iter().enumerate() {
                        row[g * inner..(g + 1) * inner]
                            .copy_from_slice(&slice.data[b * inner..(b + 1) * inner]);
                    }
                });
        }

        let mut out_shape = shape;
        out_shape[1] *= groups;
        Tensor::new(out_shape, data)
    }
}

/// Elements per batch row of one slice: `F * prod(trailing)`.
#[inline]
pub(crate) fn inner_len(child_shape: &[usize]) -> usize {
    child_shape[1..].iter().product()
}

/// Shape of one gate slice (and of every child cell) for a gate source shape.
pub fn slice_shape(x_shape: &[usize], arity: usize) -> Result<Vec<usize>> {
    if x_shape.len() < 2 {
        return Err(TreeLstmError::RankTooSmall {
            index: arity,
            rank: x_shape.len(),
        });
    }
    let groups = gate_count(arity);
    let width = x_shape[1];
    if width % groups != 0 {
        return Err(TreeLstmError::IndivisibleFeatures { width, groups });
    }
    let mut shape = x_shape.to_vec();
    shape[1] = width / groups;
    Ok(shape)
}

/// Splits `x` into `3 + arity` gate slices.
///
/// # Errors
/// Fails if `x` has rank < 2 or its feature width is not divisible by
/// `3 + arity`. Nothing is copied in that case.
pub fn split<T: Element>(x: &Tensor<T>, arity: usize) -> Result<GateSet<T>> {
    let shape = slice_shape(&x.shape, arity)?;
    let groups = gate_count(arity);
    let batch = shape[0];
    let inner = inner_len(&shape);

    let take = |g: usize| {
        let mut data = Vec::with_capacity(batch * inner);
        for b in 0..batch {
            let start = (b * groups + g) * inner;
            data.extend_from_slice(&x.data[start..start + inner]);
        }
        Tensor::new(shape.clone(), data)
    };

    let (a, i, o) = (take(0), take(1), take(2));
    let forget = (3..groups).into_par_iter().map(take).collect();
    Ok(GateSet { a, i, o, forget })
}
