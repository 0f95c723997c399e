//! # Execution Strategies
//!
//! The operator has two interchangeable implementations, chosen per call by
//! where the operands live.
//!
//! ## Submodules
//!
//! - [`cpu`]: elementwise evaluation on host memory with rayon (always built)
//! - [`kernel`]: WGSL source generation for the fused kernels, one source per arity
//! - [`wgpu`] *(opt-in)*: device memory, the GPU context and the fused launches
//! - [`dispatch`]: strategy selection and routing
//!
//! ## Feature Flags
//!
//! - `wgpu`: enables device-resident arrays and the fused strategy

pub mod cpu;
pub mod dispatch;
pub mod kernel;
#[cfg(feature = "wgpu")]
pub mod wgpu;
