//! Backend selection module.
//!
//! Two separate notions live here:
//!
//! - [`Residency`] says where an operand's storage actually lives. The
//!   dispatcher picks its execution strategy from the residency of the
//!   operands of each call, never from global state.
//! - [`Backend`] is the global default *placement*: it decides where
//!   [`Array::place`](crate::tensors::Array::place) puts freshly built
//!   tensors. It is stored in an `AtomicU8` so it can be flipped at runtime.
//!
//! # Supported Backends
//!
//! - `Cpu`: host memory, rayon-parallel elementwise path (default).
//! - `Wgpu`: accelerator memory, fused WGSL kernels (feature `wgpu`).

use core::fmt;
use core::str::FromStr;
use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported placement backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Host memory (default).
    #[default]
    Cpu = 0,
    /// Accelerator memory managed by `wgpu`.
    Wgpu,
}

impl Backend {
    /// Residency of tensors placed by this backend.
    #[must_use]
    pub const fn residency(self) -> Residency {
        match self {
            Self::Cpu => Residency::Host,
            Self::Wgpu => Residency::Device,
        }
    }
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

/// Error returned when parsing a [`Backend`] name fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown backend `{0}` (expected `cpu` or `wgpu`)")]
pub struct ParseBackendError(pub String);

impl FromStr for Backend {
    type Err = ParseBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "host" => Ok(Self::Cpu),
            "wgpu" | "gpu" | "device" => Ok(Self::Wgpu),
            other => Err(ParseBackendError(other.to_string())),
        }
    }
}

/// Where the storage of an operand lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    /// Ordinary host memory.
    Host,
    /// Accelerator memory.
    Device,
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Device => f.write_str("device"),
        }
    }
}

/// Internal global state for the default placement.
static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the default placement for [`Array::place`](crate::tensors::Array::place).
///
/// # Example
///
/// ```
/// use nary_treelstm::backend::{get_backend, set_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    tracing::debug!(backend = ?b, "default placement changed");
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the current default placement.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_names() {
        assert_eq!("CPU".parse::<Backend>(), Ok(Backend::Cpu));
        assert_eq!(" wgpu ".parse::<Backend>(), Ok(Backend::Wgpu));
        assert_eq!("device".parse::<Backend>(), Ok(Backend::Wgpu));
        assert!("cuda".parse::<Backend>().is_err());
    }

    #[test]
    fn backend_maps_to_residency() {
        assert_eq!(Backend::Cpu.residency(), Residency::Host);
        assert_eq!(Backend::Wgpu.residency(), Residency::Device);
        assert_eq!(Backend::try_from(7), Err(()));
    }
}
