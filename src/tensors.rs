//! Core tensor data structures.
//!
//! # Tensors and arrays
//!
//! - [`Tensor<T>`] is a dense, row-major host array: a `Vec<usize>` shape and
//!   a flat `Vec<T>` of elements.
//! - [`Array<T>`] is what the operator consumes: either a host [`Tensor`] or,
//!   with the `wgpu` feature, a [`DeviceTensor`] living in accelerator memory.
//! - [`TensorSpec`] is shape + dtype metadata, all the type check looks at.
//!
//! ## Design Highlights
//! - Element types are `f32` and `f64` through the [`Element`] trait.
//! - Shapes are checked at runtime; `Tensor::new` panics on a length mismatch,
//!   the operator itself reports shape problems as [`TreeLstmError`]s.
//! - Elementwise maps run on rayon's pool.
//!
//! ## Example
//!
//! ```rust
//! use nary_treelstm::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.shape, vec![2, 3]);
//! ```

use core::fmt;

use num_traits::Float;
use rayon::prelude::*;

use crate::backend::{get_backend, Backend, Residency};
use crate::error::{Result, TreeLstmError};

#[cfg(feature = "wgpu")]
use crate::ops::wgpu::DeviceTensor;

/// Element type tag, as seen by the type check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DType {
    /// Whether the dtype is a floating point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
        };
        f.write_str(name)
    }
}

/// Floating element types the operator computes with.
pub trait Element: Float + Default + Send + Sync + fmt::Debug + 'static {
    /// The dtype tag of this element type.
    const DTYPE: DType;

    /// Convert from `f64`, rounding if needed.
    fn from_f64(x: f64) -> Self;

    /// Convert to `f64`.
    fn into_f64(self) -> f64;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(x: f64) -> Self {
        x as Self
    }

    fn into_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn from_f64(x: f64) -> Self {
        x
    }

    fn into_f64(self) -> f64 {
        self
    }
}

/// Shape and dtype of one operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }
}

/// Represents an N-dimensional tensor with a shape and flat row-major data.
///
/// - `shape` defines the structure, e.g., `[2, 3]` for a 2×3 matrix.
/// - `data` holds the flattened content in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<T: Element> Tensor<T> {
    /// A tensor of the given shape filled with zeros.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![T::zero(); len],
        }
    }

    /// Builds a tensor by evaluating `f` at every flat index.
    pub fn from_fn(shape: impl Into<Vec<usize>>, f: impl Fn(usize) -> T + Sync + Send) -> Self {
        let shape = shape.into();
        let len: usize = shape.iter().product();
        let data = (0..len).into_par_iter().map(f).collect();
        Self { shape, data }
    }

    /// Applies `f` to every element.
    #[must_use]
    pub fn map(&self, f: impl Fn(T) -> T + Sync + Send) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.par_iter().map(|&v| f(v)).collect(),
        }
    }

    /// Combines two same-shaped tensors elementwise.
    ///
    /// # Panics
    /// Panics if the shapes differ.
    #[must_use]
    pub fn zip_map(&self, other: &Self, f: impl Fn(T, T) -> T + Sync + Send) -> Self {
        assert_eq!(self.shape, other.shape, "shape mismatch");
        Self {
            shape: self.shape.clone(),
            data: self
                .data
                .par_iter()
                .zip(other.data.par_iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
        }
    }

    /// Shape and dtype metadata.
    #[must_use]
    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(T::DTYPE, self.shape.clone())
    }
}

/// An operand in host or device memory.
#[derive(Debug, Clone)]
pub enum Array<T: Element> {
    /// Host-resident tensor.
    Host(Tensor<T>),
    /// Accelerator-resident tensor.
    #[cfg(feature = "wgpu")]
    Device(DeviceTensor<T>),
}

impl<T: Element> Array<T> {
    /// Places a host tensor according to the global default [`Backend`].
    ///
    /// Without the `wgpu` feature, `Backend::Wgpu` falls back to host memory.
    pub fn place(tensor: Tensor<T>) -> Result<Self> {
        match get_backend() {
            Backend::Cpu => Ok(Self::Host(tensor)),
            Backend::Wgpu => {
                #[cfg(feature = "wgpu")]
                {
                    Ok(Self::Device(DeviceTensor::upload(&tensor)?))
                }
                #[cfg(not(feature = "wgpu"))]
                {
                    tracing::warn!("wgpu placement requested without the `wgpu` feature, keeping tensor on host");
                    Ok(Self::Host(tensor))
                }
            }
        }
    }

    /// Where this operand lives.
    #[must_use]
    pub fn residency(&self) -> Residency {
        match self {
            Self::Host(_) => Residency::Host,
            #[cfg(feature = "wgpu")]
            Self::Device(_) => Residency::Device,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Host(t) => &t.shape,
            #[cfg(feature = "wgpu")]
            Self::Device(d) => d.shape(),
        }
    }

    #[must_use]
    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(T::DTYPE, self.shape().to_vec())
    }

    /// Checks that a host tensor holds exactly as many elements as its shape
    /// describes. The flat length is reported as the actual shape.
    ///
    /// # Errors
    /// [`TreeLstmError::ShapeMismatch`] on a length mismatch.
    pub fn check_storage(&self) -> Result<()> {
        match self {
            Self::Host(t) if t.data.len() != t.shape.iter().product::<usize>() => {
                Err(TreeLstmError::ShapeMismatch {
                    expected: t.shape.clone(),
                    actual: vec![t.data.len()],
                })
            }
            _ => Ok(()),
        }
    }

    /// The host tensor, if this operand lives in host memory.
    #[must_use]
    pub fn as_host(&self) -> Option<&Tensor<T>> {
        match self {
            Self::Host(t) => Some(t),
            #[cfg(feature = "wgpu")]
            Self::Device(_) => None,
        }
    }

    /// The device tensor, if this operand lives in accelerator memory.
    #[cfg(feature = "wgpu")]
    #[must_use]
    pub fn as_device(&self) -> Option<&DeviceTensor<T>> {
        match self {
            Self::Host(_) => None,
            Self::Device(d) => Some(d),
        }
    }

    /// Copies the operand into a host tensor, reading device memory back if needed.
    pub fn to_host(&self) -> Result<Tensor<T>> {
        match self {
            Self::Host(t) => Ok(t.clone()),
            #[cfg(feature = "wgpu")]
            Self::Device(d) => d.download(),
        }
    }

    /// Consumes the operand, returning the host tensor without copying when possible.
    pub fn into_host(self) -> Result<Tensor<T>> {
        match self {
            Self::Host(t) => Ok(t),
            #[cfg(feature = "wgpu")]
            Self::Device(d) => d.download(),
        }
    }
}

impl<T: Element> From<Tensor<T>> for Array<T> {
    fn from(tensor: Tensor<T>) -> Self {
        Self::Host(tensor)
    }
}

/// Errors with [`TreeLstmError::ShapeMismatch`] unless the shapes are equal.
pub(crate) fn expect_shape(actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(TreeLstmError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use nary_treelstm::tensor;
/// let t = tensor!([[1.0f32, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape, vec![2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = &children[0].shape;
        assert!(children.iter().all(|c| c.shape == *first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children { data.extend(c.data); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_macro_builds_row_major() {
        let t = crate::tensor!([[1.0f64, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        assert_eq!(t.shape, vec![3, 2]);
        assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn map_and_zip_map_are_elementwise() {
        let a = Tensor::new(vec![2, 2], vec![1.0f32, -2.0, 3.0, -4.0]);
        let b = Tensor::new(vec![2, 2], vec![0.5f32, 0.5, 2.0, 2.0]);
        assert_eq!(a.map(|v| v * 2.0).data, vec![2.0, -4.0, 6.0, -8.0]);
        assert_eq!(a.zip_map(&b, |x, y| x * y).data, vec![0.5, -1.0, 6.0, -8.0]);
    }

    #[test]
    fn shape_mismatch_panics() {
        let result = std::panic::catch_unwind(|| Tensor::new(vec![2, 2], vec![1.0f32, 2.0, 3.0]));
        assert!(result.is_err());
    }

    #[test]
    fn dtype_float_kinds() {
        assert!(DType::F32.is_float());
        assert!(DType::BF16.is_float());
        assert!(!DType::I64.is_float());
        assert_eq!(<f64 as Element>::DTYPE.to_string(), "f64");
    }

    #[test]
    fn host_array_reports_residency_and_spec() {
        let arr = Array::from(Tensor::<f32>::zeros(vec![1, 4]));
        assert_eq!(arr.residency(), Residency::Host);
        assert_eq!(arr.spec(), TensorSpec::new(DType::F32, vec![1, 4]));
        assert_eq!(arr.to_host().unwrap().data, vec![0.0; 4]);
    }
}
