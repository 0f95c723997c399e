//! Host evaluation of the Tree-LSTM cell.
//!
//! # CPU Backend
//!
//! Elementwise strategy: the gate source is split into its slices, every
//! gate is activated as a whole tensor, and the cell is assembled from
//! elementwise maps. All maps run on rayon's pool and are deterministic for
//! deterministic input (every element is computed independently, sums are
//! taken left to right in child order).
//!
//! The activations computed in forward are kept in a [`HostCache`] and reused
//! by backward, which never re-evaluates an exponential except `tanh(c)`.
//!
//! Inputs are assumed validated; see [`crate::backprop::check_types`].

use rayon::prelude::*;

use crate::activation::{grad_sigmoid, grad_tanh, sigmoid_tensor, tanh_tensor};
use crate::backprop::Upstream;
use crate::error::Result;
use crate::gates::{self, GateSet};
use crate::tensors::{Element, Tensor};

/// Activated gates and the new cell state, kept from forward for backward.
#[derive(Debug)]
pub struct HostCache<T> {
    /// `tanh(a)`
    pub a: Tensor<T>,
    /// `sigmoid(i)`
    pub i: Tensor<T>,
    /// `sigmoid(o)`
    pub o: Tensor<T>,
    /// `sigmoid(f_n)` per child.
    pub forget: Vec<Tensor<T>>,
    /// New cell state.
    pub c: Tensor<T>,
}

/// Forward pass: returns `(c, h)` and the cache backward needs.
///
/// # Errors
/// Fails only if `x` cannot be split for `children.len()` gates.
pub fn forward<T: Element>(
    children: &[&Tensor<T>],
    x: &Tensor<T>,
) -> Result<(Tensor<T>, Tensor<T>, HostCache<T>)> {
    let gates = gates::split(x, children.len())?;

    let a = tanh_tensor(&gates.a);
    let i = sigmoid_tensor(&gates.i);
    let o = sigmoid_tensor(&gates.o);
    let forget: Vec<Tensor<T>> = gates.forget.iter().map(sigmoid_tensor).collect();

    let mut c = a.zip_map(&i, |a, i| a * i);
    for (f, child) in forget.iter().zip(children) {
        c.data
            .par_iter_mut()
            .zip(f.data.par_iter())
            .zip(child.data.par_iter())
            .for_each(|((c, &f), &cn)| *c = *c + f * cn);
    }
    let h = o.zip_map(&c, |o, c| o * c.tanh());

    let cache = HostCache {
        a,
        i,
        o,
        forget,
        c: c.clone(),
    };
    Ok((c, h, cache))
}

/// Backward pass: returns `(gc_1..gc_N, gx)`.
///
/// `Zero` upstream gradients skip their terms entirely.
#[must_use]
pub fn backward<T: Element>(
    cache: &HostCache<T>,
    children: &[&Tensor<T>],
    grad_c: Upstream<'_, Tensor<T>>,
    grad_h: Upstream<'_, Tensor<T>>,
) -> (Vec<Tensor<T>>, Tensor<T>) {
    let shape = cache.c.shape.clone();
    let co = tanh_tensor(&cache.c);
    let o = &cache.o.data;

    // gradient reaching c through both outputs
    let tmp = match (grad_c, grad_h) {
        (Upstream::Given(gc), Upstream::Given(gh)) => Tensor::from_fn(shape.clone(), |e| {
            gh.data[e] * o[e] * grad_tanh(co.data[e]) + gc.data[e]
        }),
        (Upstream::Given(gc), Upstream::Zero) => gc.clone(),
        (Upstream::Zero, Upstream::Given(gh)) => {
            Tensor::from_fn(shape.clone(), |e| gh.data[e] * o[e] * grad_tanh(co.data[e]))
        }
        (Upstream::Zero, Upstream::Zero) => Tensor::zeros(shape.clone()),
    };

    let (a, i) = (&cache.a.data, &cache.i.data);
    let ga = Tensor::from_fn(shape.clone(), |e| tmp.data[e] * i[e] * grad_tanh(a[e]));
    let gi = Tensor::from_fn(shape.clone(), |e| tmp.data[e] * a[e] * grad_sigmoid(i[e]));
    let go = match grad_h {
        Upstream::Given(gh) => Tensor::from_fn(shape.clone(), |e| {
            gh.data[e] * co.data[e] * grad_sigmoid(o[e])
        }),
        Upstream::Zero => Tensor::zeros(shape.clone()),
    };

    let (gforget, gchildren): (Vec<_>, Vec<_>) = cache
        .forget
        .iter()
        .zip(children)
        .map(|(f, child)| {
            let gf = Tensor::from_fn(shape.clone(), |e| {
                tmp.data[e] * child.data[e] * grad_sigmoid(f.data[e])
            });
            let gcn = tmp.zip_map(f, |t, f| t * f);
            (gf, gcn)
        })
        .unzip();

    let gx = GateSet {
        a: ga,
        i: gi,
        o: go,
        forget: gforget,
    }
    .concat();
    (gchildren, gx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> (Tensor<f64>, Tensor<f64>, Tensor<f64>) {
        (
            Tensor::new(vec![1, 1], vec![1.0]),
            Tensor::new(vec![1, 1], vec![2.0]),
            Tensor::zeros(vec![1, 5]),
        )
    }

    #[test]
    fn forward_zero_logits() {
        let (c1, c2, x) = scenario();
        let (c, h, cache) = forward(&[&c1, &c2], &x).unwrap();
        assert!((c.data[0] - 1.5).abs() < 1e-12);
        assert!((h.data[0] - 0.5 * 1.5f64.tanh()).abs() < 1e-12);
        assert_eq!(cache.forget.len(), 2);
        assert_eq!(cache.c, c);
    }

    #[test]
    fn backward_cell_gradient_only() {
        let (c1, c2, x) = scenario();
        let (_, _, cache) = forward(&[&c1, &c2], &x).unwrap();
        let gc = Tensor::new(vec![1, 1], vec![1.0]);
        let (gcs, gx) = backward(&cache, &[&c1, &c2], Upstream::Given(&gc), Upstream::Zero);

        let expected = [0.5, 0.0, 0.0, 0.25, 0.5];
        for (got, want) in gx.data.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{got} != {want}");
        }
        assert_eq!(gx.shape, vec![1, 5]);
        assert!((gcs[0].data[0] - 0.5).abs() < 1e-12);
        assert!((gcs[1].data[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn both_gradients_absent_gives_zeros() {
        let (c1, c2, x) = scenario();
        let (_, _, cache) = forward(&[&c1, &c2], &x).unwrap();
        let (gcs, gx) = backward(&cache, &[&c1, &c2], Upstream::Zero, Upstream::Zero);
        assert!(gx.data.iter().all(|&v| v == 0.0));
        assert!(gcs.iter().all(|g| g.data.iter().all(|&v| v == 0.0)));
    }

    #[test]
    fn zero_sized_batch() {
        let c1 = Tensor::<f32>::zeros(vec![0, 3]);
        let x = Tensor::<f32>::zeros(vec![0, 15]);
        let (c, h, cache) = forward(&[&c1, &c1], &x).unwrap();
        assert!(c.is_empty() && h.is_empty());
        let (gcs, gx) = backward(&cache, &[&c1, &c1], Upstream::Given(&c), Upstream::Given(&h));
        assert_eq!(gx.shape, vec![0, 15]);
        assert_eq!(gcs[1].shape, vec![0, 3]);
    }
}
