//! The N-ary Tree-LSTM operator: type check, forward and backward.
//!
//! # Operator contract
//!
//! Inputs are `N >= 2` child cells `c_1..c_N`, each `(batch, F, ...)`, and a
//! gate source `x` of shape `(batch, (3 + N) * F, ...)`. The gate source is
//! split into `a, i, o, f_1..f_N` (see [`crate::gates`]) and
//!
//! ```text
//! c = tanh(a) * sigmoid(i) + Σ_n sigmoid(f_n) * c_n
//! h = sigmoid(o) * tanh(c)
//! ```
//!
//! ## Autograd Pattern
//!
//! 1. [`forward`] validates the inputs, computes `(c, h)` and returns an
//!    immutable [`ForwardContext`] holding what backward needs.
//! 2. [`backward`] takes that context back together with the same inputs and
//!    the upstream gradients of `c` and `h`, each an [`Upstream`] that may be
//!    [`Upstream::Zero`].
//! 3. The context can be dropped as soon as backward returns.
//!
//! The context is a plain owned value, so independent forward/backward
//! pairings never share intermediates.
//!
//! # Example
//!
//! ```rust
//! use nary_treelstm::{backward, forward, Array, Tensor, Upstream};
//!
//! let c1 = Array::from(Tensor::new(vec![1, 1], vec![1.0f64]));
//! let c2 = Array::from(Tensor::new(vec![1, 1], vec![2.0f64]));
//! let x = Array::from(Tensor::new(vec![1, 5], vec![0.0f64; 5]));
//!
//! let (out, ctx) = forward(&[&c1, &c2], &x).unwrap();
//! assert!((out.c.to_host().unwrap().data[0] - 1.5).abs() < 1e-12);
//!
//! let ones = Array::from(Tensor::new(vec![1, 1], vec![1.0f64]));
//! let grads = backward(&ctx, &[&c1, &c2], &x, Upstream::Given(&ones), Upstream::Zero).unwrap();
//! assert_eq!(grads.children.len(), 2);
//! ```

use std::iter;

use tracing::trace;

use crate::backend::Residency;
use crate::error::{Result, TreeLstmError};
use crate::gates::gate_count;
use crate::ops::dispatch::{self, Cache};
use crate::tensors::{expect_shape, Array, Element, TensorSpec};

/// An upstream gradient that is either supplied or known to be zero.
///
/// `Zero` contributes nothing to the backward sums, and needs no tensor.
#[derive(Debug)]
pub enum Upstream<'a, A> {
    /// The gradient was supplied.
    Given(&'a A),
    /// The gradient is identically zero.
    Zero,
}

impl<A> Clone for Upstream<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for Upstream<'_, A> {}

impl<'a, A> Upstream<'a, A> {
    /// The supplied gradient, if any.
    #[must_use]
    pub fn given(self) -> Option<&'a A> {
        match self {
            Self::Given(g) => Some(g),
            Self::Zero => None,
        }
    }

    /// Converts the supplied gradient, keeping `Zero` as is.
    pub(crate) fn try_map<B>(self, f: impl FnOnce(&'a A) -> Result<&'a B>) -> Result<Upstream<'a, B>> {
        match self {
            Self::Given(g) => f(g).map(Upstream::Given),
            Self::Zero => Ok(Upstream::Zero),
        }
    }
}

impl<'a, A> From<Option<&'a A>> for Upstream<'a, A> {
    fn from(value: Option<&'a A>) -> Self {
        value.map_or(Self::Zero, Self::Given)
    }
}

/// The two outputs of the cell.
#[derive(Debug, Clone)]
pub struct TreeLstmOutput<T: Element> {
    /// New cell state.
    pub c: Array<T>,
    /// Output signal.
    pub h: Array<T>,
}

/// Gradients with respect to every input.
#[derive(Debug, Clone)]
pub struct TreeLstmGrads<T: Element> {
    /// `gc_1..gc_N`, in child order.
    pub children: Vec<Array<T>>,
    /// Gradient of the gate source, laid out like `x`.
    pub x: Array<T>,
}

impl<T: Element> TreeLstmGrads<T> {
    /// Gradients in the positional order of the forward inputs: `(gc_1, ..., gc_N, gx)`.
    #[must_use]
    pub fn into_vec(self) -> Vec<Array<T>> {
        let mut all = self.children;
        all.push(self.x);
        all
    }
}

/// Intermediates of one forward call, consumed read-only by the matching backward.
///
/// Not `Clone`: every forward call produces its own context.
#[derive(Debug)]
pub struct ForwardContext<T: Element> {
    arity: usize,
    child_shape: Vec<usize>,
    cache: Cache<T>,
}

impl<T: Element> ForwardContext<T> {
    /// Number of children the forward call combined.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Shape shared by every child cell and both outputs.
    #[must_use]
    pub fn child_shape(&self) -> &[usize] {
        &self.child_shape
    }

    /// Memory the cached intermediates live in.
    #[must_use]
    pub fn residency(&self) -> Residency {
        self.cache.residency()
    }
}

/// Validates operator inputs: `N` child cells followed by the gate source.
///
/// Returns the arity `N` on success. Checks, in order: at least two
/// children; floating dtypes; one dtype throughout; rank ≥ 2 and equal to the
/// gate source rank; equal batch size; gate source feature width equal to
/// `(3 + N)` times the child feature width; equal trailing dimensions.
///
/// # Errors
/// The first violated condition, as a validation [`TreeLstmError`].
pub fn check_types(inputs: &[TensorSpec]) -> Result<usize> {
    let Some((x, children)) = inputs.split_last() else {
        return Err(TreeLstmError::TooFewChildren(0));
    };
    let arity = children.len();
    if arity < 2 {
        return Err(TreeLstmError::TooFewChildren(arity));
    }
    if !x.dtype.is_float() {
        return Err(TreeLstmError::NonFloatDtype {
            index: arity,
            dtype: x.dtype,
        });
    }
    if x.shape.len() < 2 {
        return Err(TreeLstmError::RankTooSmall {
            index: arity,
            rank: x.shape.len(),
        });
    }

    for (index, child) in children.iter().enumerate() {
        if !child.dtype.is_float() {
            return Err(TreeLstmError::NonFloatDtype {
                index,
                dtype: child.dtype,
            });
        }
        if child.dtype != x.dtype {
            return Err(TreeLstmError::DtypeMismatch {
                index,
                expected: x.dtype,
                actual: child.dtype,
            });
        }
        let rank = child.shape.len();
        if rank < 2 {
            return Err(TreeLstmError::RankTooSmall { index, rank });
        }
        if rank != x.shape.len() {
            return Err(TreeLstmError::RankMismatch {
                index,
                expected: x.shape.len(),
                actual: rank,
            });
        }
        if child.shape[0] != x.shape[0] {
            return Err(TreeLstmError::BatchMismatch {
                index,
                expected: x.shape[0],
                actual: child.shape[0],
            });
        }
        if x.shape[1] != gate_count(arity) * child.shape[1] {
            return Err(TreeLstmError::FeatureWidth {
                arity,
                child: child.shape[1],
                actual: x.shape[1],
            });
        }
        if child.shape[2..] != x.shape[2..] {
            return Err(TreeLstmError::TrailingMismatch {
                index,
                expected: x.shape[2..].to_vec(),
                actual: child.shape[2..].to_vec(),
            });
        }
    }

    Ok(arity)
}

fn input_specs<T: Element>(children: &[&Array<T>], x: &Array<T>) -> Result<Vec<TensorSpec>> {
    children
        .iter()
        .copied()
        .chain(iter::once(x))
        .map(|a| a.check_storage().map(|()| a.spec()))
        .collect()
}

/// Computes `(c, h)` for the given children and gate source.
///
/// Runs on the host or on the device depending on where the operands live;
/// all operands must live in the same place.
///
/// # Errors
/// Any validation failure from [`check_types`], mixed residency, or a GPU failure.
pub fn forward<T: Element>(
    children: &[&Array<T>],
    x: &Array<T>,
) -> Result<(TreeLstmOutput<T>, ForwardContext<T>)> {
    let arity = check_types(&input_specs(children, x)?)?;
    let child_shape = children[0].shape().to_vec();
    trace!(arity, x_shape = ?x.shape(), "tree-lstm forward");

    let (c, h, cache) = dispatch::forward(children, x)?;

    Ok((
        TreeLstmOutput { c, h },
        ForwardContext {
            arity,
            child_shape,
            cache,
        },
    ))
}

/// Computes the gradients of every input from the upstream gradients of `(c, h)`.
///
/// `children` and `x` must be the inputs the context was produced from.
///
/// # Errors
/// Validation failures, a context built for a different arity or memory,
/// upstream gradients of the wrong shape, mixed residency, or a GPU failure.
pub fn backward<T: Element>(
    ctx: &ForwardContext<T>,
    children: &[&Array<T>],
    x: &Array<T>,
    grad_c: Upstream<'_, Array<T>>,
    grad_h: Upstream<'_, Array<T>>,
) -> Result<TreeLstmGrads<T>> {
    let arity = check_types(&input_specs(children, x)?)?;
    if arity != ctx.arity {
        return Err(TreeLstmError::ContextArity {
            expected: ctx.arity,
            actual: arity,
        });
    }
    expect_shape(children[0].shape(), &ctx.child_shape)?;
    for grad in [grad_c, grad_h].into_iter().filter_map(Upstream::given) {
        expect_shape(grad.shape(), &ctx.child_shape)?;
        grad.check_storage()?;
    }
    if x.residency() != ctx.residency() {
        return Err(TreeLstmError::ContextResidency {
            expected: ctx.residency(),
            actual: x.residency(),
        });
    }
    trace!(
        arity,
        grad_c = grad_c.given().is_some(),
        grad_h = grad_h.given().is_some(),
        "tree-lstm backward"
    );

    let (children, x) = dispatch::backward(&ctx.cache, children, x, grad_c, grad_h)?;
    Ok(TreeLstmGrads { children, x })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::{DType, Tensor};

    fn specs(children: &[&[usize]], x: &[usize]) -> Vec<TensorSpec> {
        children
            .iter()
            .map(|s| TensorSpec::new(DType::F32, s.to_vec()))
            .chain(iter::once(TensorSpec::new(DType::F32, x.to_vec())))
            .collect()
    }

    #[test]
    fn accepts_well_formed_inputs() {
        assert_eq!(check_types(&specs(&[&[4, 3], &[4, 3]], &[4, 15])).unwrap(), 2);
        assert_eq!(
            check_types(&specs(&[&[2, 1, 7][..]; 5], &[2, 8, 7])).unwrap(),
            5
        );
    }

    #[test]
    fn rejects_too_few_children() {
        assert!(matches!(check_types(&[]), Err(TreeLstmError::TooFewChildren(0))));
        assert!(matches!(
            check_types(&specs(&[&[4, 3]], &[4, 12])),
            Err(TreeLstmError::TooFewChildren(1))
        ));
    }

    #[test]
    fn rejects_feature_width_off_by_one_group() {
        for arity in [2usize, 3, 5] {
            let child = [3usize, 4];
            let children: Vec<&[usize]> = vec![&child[..]; arity];
            let wrong = [3usize, (2 + arity) * 4];
            assert!(matches!(
                check_types(&specs(&children, &wrong)),
                Err(TreeLstmError::FeatureWidth { .. })
            ));
        }
    }

    #[test]
    fn rejects_dtype_problems() {
        let mut s = specs(&[&[1, 2], &[1, 2]], &[1, 10]);
        s[1].dtype = DType::F64;
        assert!(matches!(
            check_types(&s),
            Err(TreeLstmError::DtypeMismatch { index: 1, .. })
        ));

        let ints: Vec<TensorSpec> = s
            .iter()
            .map(|t| TensorSpec::new(DType::I32, t.shape.clone()))
            .collect();
        assert!(matches!(
            check_types(&ints),
            Err(TreeLstmError::NonFloatDtype { index: 2, .. })
        ));
    }

    #[test]
    fn rejects_rank_batch_and_trailing_mismatch() {
        assert!(matches!(
            check_types(&specs(&[&[1, 2, 3], &[1, 2]], &[1, 10, 3])),
            Err(TreeLstmError::RankMismatch { index: 1, .. })
        ));
        assert!(matches!(
            check_types(&specs(&[&[2], &[2]], &[2, 10])),
            Err(TreeLstmError::RankTooSmall { index: 0, .. })
        ));
        assert!(matches!(
            check_types(&specs(&[&[1, 2], &[3, 2]], &[1, 10])),
            Err(TreeLstmError::BatchMismatch { index: 1, .. })
        ));
        assert!(matches!(
            check_types(&specs(&[&[1, 2, 4], &[1, 2, 5]], &[1, 10, 4])),
            Err(TreeLstmError::TrailingMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn rejects_storage_shorter_than_shape() {
        let full = Array::from(Tensor::new(vec![1, 2], vec![1.0f32, 2.0]));
        let short = Array::Host(Tensor {
            shape: vec![1, 2],
            data: vec![1.0f32],
        });
        let x = Array::from(Tensor::<f32>::zeros(vec![1, 10]));
        assert!(matches!(
            forward(&[&full, &short], &x),
            Err(TreeLstmError::ShapeMismatch { ref actual, .. }) if actual == &[1]
        ));

        let short_x = Array::Host(Tensor {
            shape: vec![1, 10],
            data: vec![0.0f32; 9],
        });
        assert!(matches!(
            forward(&[&full, &full], &short_x),
            Err(TreeLstmError::ShapeMismatch { .. })
        ));

        let (_, ctx) = forward(&[&full, &full], &x).unwrap();
        assert!(matches!(
            backward(&ctx, &[&full, &full], &x, Upstream::Given(&short), Upstream::Zero),
            Err(TreeLstmError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn upstream_from_option() {
        let v = 3u8;
        assert!(matches!(Upstream::from(Some(&v)), Upstream::Given(3)));
        assert!(matches!(Upstream::<u8>::from(None), Upstream::Zero));
    }
}
