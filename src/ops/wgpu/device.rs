use std::fmt;
use std::marker::PhantomData;
use std::sync::{mpsc, Arc};

use wgpu::util::DeviceExt;

use super::{as_bytes, bytes_to_f32_slice, context, GpuError, GpuFailure};
use crate::error::{Result, TreeLstmError};
use crate::tensors::{DType, Element, Tensor};

/// Bytes per device element. Device memory always holds `f32`.
pub(crate) const ELEM_BYTES: u64 = 4;

/// A tensor resident in accelerator memory.
///
/// Clones share the underlying buffer. Buffers are never written after the
/// kernel that produced them has finished.
#[derive(Clone)]
pub struct DeviceTensor<T> {
    shape: Vec<usize>,
    buffer: Arc<wgpu::Buffer>,
    _marker: PhantomData<T>,
}

impl<T> fmt::Debug for DeviceTensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("shape", &self.shape)
            .field("bytes", &self.buffer.size())
            .finish()
    }
}

/// Buffer size for `len` elements. Zero-sized bindings are invalid, so
/// empty tensors still get one element of backing storage.
pub(crate) fn buffer_size(len: usize) -> u64 {
    (len as u64).max(1) * ELEM_BYTES
}

/// Checks that a storage buffer of `len` elements can be created and bound
/// whole under `limits`.
pub(crate) fn check_fits(limits: &wgpu::Limits, len: usize) -> std::result::Result<(), GpuFailure> {
    let bytes = (len as u64).saturating_mul(ELEM_BYTES);
    let cap = limits
        .max_buffer_size
        .min(u64::from(limits.max_storage_buffer_binding_size));
    if bytes > cap {
        Err(GpuFailure::from(format!(
            "buffer of {bytes} bytes exceeds the device limit of {cap} bytes"
        )))
    } else {
        Ok(())
    }
}

impl<T: Element> DeviceTensor<T> {
    pub(crate) fn from_buffer(shape: Vec<usize>, buffer: wgpu::Buffer) -> Self {
        Self {
            shape,
            buffer: Arc::new(buffer),
            _marker: PhantomData,
        }
    }

    fn check_dtype() -> Result<()> {
        if T::DTYPE == DType::F32 {
            Ok(())
        } else {
            Err(TreeLstmError::UnsupportedDeviceDtype(T::DTYPE))
        }
    }

    /// Copies a host tensor into device memory.
    ///
    /// # Errors
    /// `UnsupportedDeviceDtype` unless `T` is `f32`, or a GPU failure.
    pub fn upload(tensor: &Tensor<T>) -> Result<Self> {
        Self::check_dtype()?;
        let ctx = context()?;
        check_fits(&ctx.device.limits(), tensor.len())?;
        let buffer = if tensor.is_empty() {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("tensor"),
                size: buffer_size(0),
                usage: usage(),
                mapped_at_creation: false,
            })
        } else {
            ctx.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("tensor"),
                    contents: as_bytes(&tensor.data),
                    usage: usage(),
                })
        };
        Ok(Self::from_buffer(tensor.shape.clone(), buffer))
    }

    /// A zero-filled device tensor.
    ///
    /// # Errors
    /// `UnsupportedDeviceDtype` unless `T` is `f32`, or a GPU failure.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Result<Self> {
        Self::check_dtype()?;
        let shape = shape.into();
        let buffer = zeroed_buffer(shape.iter().product(), "zeros")?;
        Ok(Self::from_buffer(shape, buffer))
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Reads the tensor back into host memory. Blocks until the copy is done.
    ///
    /// # Errors
    /// A GPU failure while copying or mapping.
    pub fn download(&self) -> Result<Tensor<T>> {
        let len = self.len();
        if len == 0 {
            return Ok(Tensor::new(self.shape.clone(), Vec::new()));
        }
        let ctx = context()?;
        let size = len as u64 * ELEM_BYTES;

        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("download_encoder"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, size);
        ctx.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        ctx.wait()?;
        rx.recv()
            .map_err(|_| GpuFailure::from("buffer map callback dropped"))?
            .map_err(|e| GpuFailure::from(GpuError::Map(e)))?;

        let data = {
            let view = slice.get_mapped_range();
            let words = bytes_to_f32_slice(&view).map_err(GpuFailure::from)?;
            words.iter().map(|&v| T::from_f64(f64::from(v))).collect()
        };
        staging.unmap();
        Ok(Tensor::new(self.shape.clone(), data))
    }
}

fn usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

/// A storage buffer of `len` elements. New wgpu buffers are zero-initialized.
pub(crate) fn zeroed_buffer(len: usize, label: &str) -> std::result::Result<wgpu::Buffer, GpuFailure> {
    let ctx = context()?;
    check_fits(&ctx.device.limits(), len)?;
    Ok(ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: buffer_size(len),
        usage: usage(),
        mapped_at_creation: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_within_limits_fit() {
        let limits = wgpu::Limits::default();
        assert!(check_fits(&limits, 0).is_ok());
        assert!(check_fits(&limits, 1024).is_ok());
        let cap = limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size));
        assert!(check_fits(&limits, (cap / ELEM_BYTES) as usize).is_ok());
    }

    #[test]
    fn buffers_over_binding_size_are_rejected() {
        let limits = wgpu::Limits::default();
        let over = u64::from(limits.max_storage_buffer_binding_size) / ELEM_BYTES + 1;
        assert!(check_fits(&limits, over as usize).is_err());
        assert!(check_fits(&limits, usize::MAX).is_err());

        let tight = wgpu::Limits {
            max_buffer_size: 64,
            ..wgpu::Limits::default()
        };
        assert!(check_fits(&tight, 16).is_ok());
        assert!(check_fits(&tight, 17).is_err());
    }
}
