//! Elementwise activations used by the cell, and their derivatives.
//!
//! Derivatives are written in terms of the activation *output* `y`, which is
//! what the forward context keeps around:
//!
//! - `sigmoid'(x) = y * (1 - y)` with `y = sigmoid(x)`
//! - `tanh'(x) = 1 - y²` with `y = tanh(x)`
//!
//! The fused WGSL kernels define the same functions in their preamble, see
//! [`crate::ops::kernel`].

use crate::tensors::{Element, Tensor};

/// Logistic sigmoid via `tanh(x / 2) / 2 + 1 / 2`.
///
/// Unlike `1 / (1 + exp(-x))` this never overflows the intermediate.
#[inline]
pub fn sigmoid<T: Element>(x: T) -> T {
    let half = T::from_f64(0.5);
    (x * half).tanh() * half + half
}

/// Hyperbolic tangent.
#[inline]
pub fn tanh<T: Element>(x: T) -> T {
    x.tanh()
}

/// Derivative of the sigmoid given its output.
#[inline]
pub fn grad_sigmoid<T: Element>(y: T) -> T {
    y * (T::one() - y)
}

/// Derivative of tanh given its output.
#[inline]
pub fn grad_tanh<T: Element>(y: T) -> T {
    T::one() - y * y
}

/// Sigmoid over a whole tensor.
#[must_use]
pub fn sigmoid_tensor<T: Element>(x: &Tensor<T>) -> Tensor<T> {
    x.map(sigmoid)
}

/// Tanh over a whole tensor.
#[must_use]
pub fn tanh_tensor<T: Element>(x: &Tensor<T>) -> Tensor<T> {
    x.map(tanh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_matches_logistic_form() {
        for &x in &[-30.0f64, -3.0, -0.5, 0.0, 0.25, 4.0, 30.0] {
            let reference = 1.0 / (1.0 + (-x).exp());
            assert!((sigmoid(x) - reference).abs() < 1e-12, "x = {x}");
        }
        assert_eq!(sigmoid(0.0f32), 0.5);
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let eps = 1e-6;
        for &x in &[-2.0f64, -0.3, 0.0, 0.7, 1.9] {
            let ds = (sigmoid(x + eps) - sigmoid(x - eps)) / (2.0 * eps);
            let dt = (tanh(x + eps) - tanh(x - eps)) / (2.0 * eps);
            assert!((grad_sigmoid(sigmoid(x)) - ds).abs() < 1e-8);
            assert!((grad_tanh(tanh(x)) - dt).abs() < 1e-8);
        }
    }

    #[test]
    fn extreme_logits_saturate() {
        assert_eq!(sigmoid(1.0e4f32), 1.0);
        assert_eq!(sigmoid(-1.0e4f32), 0.0);
        assert!(sigmoid(f32::NAN).is_nan());
    }
}
