//! Error type shared by the type check, the dispatcher and both backends.
//!
//! Everything except [`TreeLstmError::Gpu`] is a precondition failure: it is
//! raised before any numeric work starts and the call is not retried.
//! Numeric anomalies (NaN/Inf from extreme logits) are never reported here;
//! they flow through forward and backward like any other value.

use crate::backend::Residency;
use crate::tensors::DType;
use thiserror::Error;

#[cfg(feature = "wgpu")]
use crate::ops::wgpu::GpuFailure;

/// Errors produced by the N-ary Tree-LSTM operator.
#[derive(Error, Debug)]
pub enum TreeLstmError {
    #[error("expected at least 2 child cells plus a gate source, got {0} child cell(s)")]
    TooFewChildren(usize),
    #[error("input {index} has non-floating dtype {dtype}")]
    NonFloatDtype { index: usize, dtype: DType },
    #[error("input {index} has dtype {actual}, gate source has {expected}")]
    DtypeMismatch {
        index: usize,
        expected: DType,
        actual: DType,
    },
    #[error("input {index} has rank {rank}, expected at least 2")]
    RankTooSmall { index: usize, rank: usize },
    #[error("input {index} has rank {actual}, gate source has rank {expected}")]
    RankMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("input {index} has batch size {actual}, gate source has {expected}")]
    BatchMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("gate source feature width {actual} is not (3 + {arity}) * {child}")]
    FeatureWidth {
        arity: usize,
        child: usize,
        actual: usize,
    },
    #[error("gate source feature width {width} is not divisible by {groups}")]
    IndivisibleFeatures { width: usize, groups: usize },
    #[error("input {index} trailing dims {actual:?} differ from gate source {expected:?}")]
    TrailingMismatch {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("forward context was built for {expected} children, backward got {actual}")]
    ContextArity { expected: usize, actual: usize },
    #[error("forward context lives in {expected} memory, backward inputs live in {actual} memory")]
    ContextResidency {
        expected: Residency,
        actual: Residency,
    },
    #[error("operands span {first} and {second} memory")]
    MixedResidency { first: Residency, second: Residency },
    #[error("dtype {0} cannot be placed in device memory")]
    UnsupportedDeviceDtype(DType),
    #[cfg(feature = "wgpu")]
    #[error(transparent)]
    Gpu(#[from] GpuFailure),
}

impl TreeLstmError {
    /// Returns `true` for errors raised by input validation, before numeric work.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        #[cfg(feature = "wgpu")]
        if matches!(self, Self::Gpu(_)) {
            return false;
        }
        true
    }
}

pub type Result<T> = std::result::Result<T, TreeLstmError>;
