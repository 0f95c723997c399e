//! Operation Dispatch Layer
//!
//! Picks the execution strategy for one forward or backward call from where
//! the operands live, and routes the call to it:
//!
//! - every operand in host memory: [`Strategy::Elementwise`] on the CPU
//!   ([`crate::ops::cpu`]);
//! - every operand in device memory: [`Strategy::Fused`] kernels
//!   ([`crate::ops::wgpu::fused`]).
//!
//! Operands in different memories are an error; nothing is moved implicitly.
//! Both strategies produce the same values within floating-point tolerance.

use tracing::debug;

use super::cpu::{self, HostCache};
use crate::backend::Residency;
use crate::backprop::Upstream;
use crate::error::{Result, TreeLstmError};
use crate::tensors::{Array, Element, Tensor};

#[cfg(feature = "wgpu")]
use super::wgpu::{fused, DeviceTensor};

/// How a call is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Separate elementwise passes on the host.
    Elementwise,
    /// One generated kernel per direction on the device.
    #[cfg(feature = "wgpu")]
    Fused,
}

impl Strategy {
    /// Memory the strategy operates on.
    #[must_use]
    pub fn residency(self) -> Residency {
        match self {
            Self::Elementwise => Residency::Host,
            #[cfg(feature = "wgpu")]
            Self::Fused => Residency::Device,
        }
    }

    fn for_residency(residency: Residency) -> Self {
        match residency {
            Residency::Host => Self::Elementwise,
            #[cfg(feature = "wgpu")]
            Residency::Device => Self::Fused,
            #[cfg(not(feature = "wgpu"))]
            Residency::Device => unreachable!("device arrays require the `wgpu` feature"),
        }
    }
}

/// The strategy for a set of operands, which must share one residency.
///
/// # Errors
/// [`TreeLstmError::MixedResidency`] naming the first two memories seen.
pub fn select<'a, T: Element + 'a>(operands: impl IntoIterator<Item = &'a Array<T>>) -> Result<Strategy> {
    let mut residencies = operands.into_iter().map(Array::residency);
    let first = residencies.next().unwrap_or(Residency::Host);
    if let Some(second) = residencies.find(|&r| r != first) {
        return Err(TreeLstmError::MixedResidency { first, second });
    }
    Ok(Strategy::for_residency(first))
}

/// What forward leaves behind for backward, per strategy.
#[derive(Debug)]
pub(crate) enum Cache<T: Element> {
    /// Host activations and cell state.
    Host(HostCache<T>),
    /// Device cell state; activations are recomputed in the kernel.
    #[cfg(feature = "wgpu")]
    Device(DeviceTensor<T>),
}

impl<T: Element> Cache<T> {
    pub(crate) fn residency(&self) -> Residency {
        match self {
            Self::Host(_) => Residency::Host,
            #[cfg(feature = "wgpu")]
            Self::Device(_) => Residency::Device,
        }
    }
}

fn host<T: Element>(array: &Array<T>) -> Result<&Tensor<T>> {
    array.as_host().ok_or(TreeLstmError::MixedResidency {
        first: Residency::Host,
        second: array.residency(),
    })
}

#[cfg(feature = "wgpu")]
fn device<T: Element>(array: &Array<T>) -> Result<&DeviceTensor<T>> {
    array.as_device().ok_or(TreeLstmError::MixedResidency {
        first: Residency::Device,
        second: array.residency(),
    })
}

/// Routes a forward call. Inputs must already be type checked.
pub(crate) fn forward<T: Element>(
    children: &[&Array<T>],
    x: &Array<T>,
) -> Result<(Array<T>, Array<T>, Cache<T>)> {
    let strategy = select(children.iter().copied().chain([x]))?;
    debug!(?strategy, arity = children.len(), "dispatching forward");

    match strategy {
        Strategy::Elementwise => {
            let hosts = children.iter().map(|c| host(c)).collect::<Result<Vec<_>>>()?;
            let (c, h, cache) = cpu::forward(&hosts, host(x)?)?;
            Ok((Array::Host(c), Array::Host(h), Cache::Host(cache)))
        }
        #[cfg(feature = "wgpu")]
        Strategy::Fused => {
            let devices = children.iter().map(|c| device(c)).collect::<Result<Vec<_>>>()?;
            let (c, h) = fused::forward(&devices, device(x)?)?;
            Ok((Array::Device(c.clone()), Array::Device(h), Cache::Device(c)))
        }
    }
}

/// Routes a backward call to the strategy its forward used.
pub(crate) fn backward<T: Element>(
    cache: &Cache<T>,
    children: &[&Array<T>],
    x: &Array<T>,
    grad_c: Upstream<'_, Array<T>>,
    grad_h: Upstream<'_, Array<T>>,
) -> Result<(Vec<Array<T>>, Array<T>)> {
    let operands = children
        .iter()
        .copied()
        .chain([x])
        .chain(grad_c.given())
        .chain(grad_h.given());
    let strategy = select(operands)?;
    debug!(?strategy, arity = children.len(), "dispatching backward");

    match (strategy, cache) {
        (Strategy::Elementwise, Cache::Host(cache)) => {
            let hosts = children.iter().map(|c| host(c)).collect::<Result<Vec<_>>>()?;
            let (gcs, gx) = cpu::backward(
                cache,
                &hosts,
                grad_c.try_map(host)?,
                grad_h.try_map(host)?,
            );
            Ok((gcs.into_iter().map(Array::Host).collect(), Array::Host(gx)))
        }
        #[cfg(feature = "wgpu")]
        (Strategy::Fused, Cache::Device(c)) => {
            let devices = children.iter().map(|c| device(c)).collect::<Result<Vec<_>>>()?;
            let (gcs, gx) = fused::backward(
                c,
                &devices,
                device(x)?,
                grad_c.try_map(device)?,
                grad_h.try_map(device)?,
            )?;
            Ok((gcs.into_iter().map(Array::Device).collect(), Array::Device(gx)))
        }
        #[cfg(feature = "wgpu")]
        (strategy, cache) => Err(TreeLstmError::ContextResidency {
            expected: cache.residency(),
            actual: strategy.residency(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_operands_select_elementwise() {
        let a = Array::from(Tensor::<f32>::zeros(vec![1, 2]));
        let b = Array::from(Tensor::<f32>::zeros(vec![1, 10]));
        assert_eq!(select([&a, &a, &b]).unwrap(), Strategy::Elementwise);
        assert_eq!(Strategy::Elementwise.residency(), Residency::Host);
    }
}
