//! nary_treelstm: a fused N-ary Tree-LSTM cell operator with analytic gradients.
//!
//! One node of a Tree-LSTM combines the cell states of its `N` children
//! with a gate source holding the input, output and per-child forget gate
//! logits. This crate provides that combination as a single differentiable
//! operator for any `N >= 2`, with an explicit forward/backward pairing.
//!
//! # Features
//!
//! - Arbitrary arity, arbitrary trailing dimensions.
//! - Host evaluation on rayon's pool for `f32` and `f64`.
//! - Fused WebGPU kernels generated per arity (`wgpu` feature), with the
//!   compiled pipelines cached for the lifetime of the process.
//! - Absent upstream gradients without materializing zero tensors.
//!
//! # Modules
//!
//! - [`backprop`]: the operator (type check, forward, backward).
//! - [`tensors`]: host tensors, operands and dtype metadata.
//! - [`gates`]: gate source layout.
//! - [`activation`]: sigmoid / tanh and their derivatives.
//! - [`ops`]: execution strategies and their dispatch.
//! - [`backend`]: the default placement for new operands.
//! - [`approx`]: tolerance helpers for comparing results.
//!
//! # Example
//!
//! ```rust
//! use nary_treelstm::{forward, Array, Tensor};
//!
//! let c1 = Array::from(Tensor::new(vec![1, 1], vec![1.0f32]));
//! let c2 = Array::from(Tensor::new(vec![1, 1], vec![2.0f32]));
//! let x = Array::from(Tensor::<f32>::zeros(vec![1, 5]));
//! let (out, _ctx) = forward(&[&c1, &c2], &x).unwrap();
//! let h = out.h.into_host().unwrap();
//! assert!((h.data[0] - 0.452_574).abs() < 1e-5);
//! ```

pub mod activation;
pub mod approx;
pub mod backend;
pub mod backprop;
pub mod error;
pub mod gates;
pub mod ops;
pub mod tensors;

pub use backprop::{
    backward, check_types, forward, ForwardContext, TreeLstmGrads, TreeLstmOutput, Upstream,
};
pub use backend::{Backend, Residency};
pub use error::{Result, TreeLstmError};
pub use tensors::{Array, DType, Element, Tensor, TensorSpec};
