//! GPU-accelerated Tree-LSTM using WGPU.
//!
//! This module owns the process-wide GPU context, the device-resident tensor
//! type and the fused kernels:
//!
//! - [`GpuContext`]: device, queue, the two fixed bind group layouts and a
//!   per-[`KernelKey`] cache of compiled pipelines.
//! - [`DeviceTensor`]: an `f32` buffer in accelerator memory plus its shape.
//! - [`fused`]: one kernel launch for forward, one for backward.
//!
//! The context is created lazily on first use. If no adapter is available
//! the failure is kept and reported by every later call, so callers (and
//! tests) can check [`is_available`] and fall back to host memory.
//!
//! Kernel sources are generated per arity (see [`crate::ops::kernel`]) and
//! pass through a [`WgslSource`] validation before compilation.

mod device;
pub mod fused;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use briny::prelude::*;
use tracing::{debug, trace, warn};

use crate::ops::kernel::{KernelKey, KernelKind};

pub use device::DeviceTensor;

/// Basic wrapper for common GPU errors.
#[derive(Debug)]
pub enum GpuError {
    /// An error in requesting the adapter.
    Adapter(wgpu::RequestAdapterError),
    /// An error in requesting the GPU (device).
    Device(wgpu::RequestDeviceError),
    /// Waiting for submitted work failed.
    Poll(wgpu::PollError),
    /// Mapping a buffer for readback failed.
    Map(wgpu::BufferAsyncError),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::Adapter(e) => write!(f, "Adapter error: {e}"),
            GpuError::Device(e) => write!(f, "Device error: {e}"),
            GpuError::Poll(e) => write!(f, "Poll error: {e}"),
            GpuError::Map(e) => write!(f, "Buffer map error: {e}"),
        }
    }
}

/// Wrapper for a `GpuError` or `ValidationError` depending on how it fails.
#[derive(Debug)]
pub enum GpuFailureKind {
    /// An error resulting from the GPU.
    Gpu(GpuError),
    /// A generated kernel failed source validation.
    Validation(ValidationError),
}

impl std::fmt::Display for GpuFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuFailureKind::Gpu(err) => write!(f, "GPU error: {err}"),
            GpuFailureKind::Validation(err) => write!(f, "Validation error: {err}"),
        }
    }
}

/// A type of error closely related to the GPU.
#[derive(Debug)]
pub struct GpuFailure {
    /// The optional type of failure that occurred.
    pub kind: Option<GpuFailureKind>,
    /// The optional message explaining the failure.
    pub message: Option<String>,
}

impl From<GpuError> for GpuFailure {
    fn from(kind: GpuError) -> Self {
        Self {
            kind: Some(GpuFailureKind::Gpu(kind)),
            message: None,
        }
    }
}

impl From<ValidationError> for GpuFailure {
    fn from(kind: ValidationError) -> Self {
        Self {
            kind: Some(GpuFailureKind::Validation(kind)),
            message: None,
        }
    }
}

impl From<&str> for GpuFailure {
    fn from(msg: &str) -> Self {
        Self {
            kind: None,
            message: Some(msg.to_string()),
        }
    }
}

impl From<String> for GpuFailure {
    fn from(msg: String) -> Self {
        Self {
            kind: None,
            message: Some(msg),
        }
    }
}

impl std::fmt::Display for GpuFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(kind) = &self.kind {
            write!(f, "GPU failure: {kind}")
        } else if let Some(msg) = &self.message {
            write!(f, "GPU failure: {msg}")
        } else {
            write!(f, "Unknown GPU failure")
        }
    }
}

impl std::error::Error for GpuFailure {}

/// Holds the WGPU device and queue plus everything shared across launches.
///
/// Initialized once globally via `lazy_static`.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// A queue for information related to the device.
    pub queue: wgpu::Queue,
    forward_layout: wgpu::BindGroupLayout,
    backward_layout: wgpu::BindGroupLayout,
    forward_pipeline_layout: wgpu::PipelineLayout,
    backward_pipeline_layout: wgpu::PipelineLayout,
    pipelines: Mutex<HashMap<KernelKey, Arc<wgpu::ComputePipeline>>>,
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext").finish_non_exhaustive()
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuContext {
    /// Initializes a new GPU context, selecting the default adapter and creating a device + queue.
    ///
    /// Also creates the bind group layouts both fused kernels use; they do not
    /// depend on the arity.
    ///
    /// # Errors
    /// `GpuError` if adapter or device acquisition fails.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(GpuError::Adapter)?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::Device)?;
        debug!(adapter = ?adapter.get_info().name, "gpu context initialized");

        // params, x, cells, c_out, h_out
        let forward_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("treelstm_fwd_bgl"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                storage_entry(4, false),
            ],
        });
        // params, c, gc, gh, x, cells, gx, gcells
        let backward_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("treelstm_bwd_bgl"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, true),
                storage_entry(5, true),
                storage_entry(6, false),
                storage_entry(7, false),
            ],
        });
        let forward_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("treelstm_fwd_pipeline_layout"),
                bind_group_layouts: &[&forward_layout],
                push_constant_ranges: &[],
            });
        let backward_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("treelstm_bwd_pipeline_layout"),
                bind_group_layouts: &[&backward_layout],
                push_constant_ranges: &[],
            });

        Ok(Self {
            device,
            queue,
            forward_layout,
            backward_layout,
            forward_pipeline_layout,
            backward_pipeline_layout,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// Bind group layout of the given kernel direction.
    pub(crate) fn bind_group_layout(&self, kind: KernelKind) -> &wgpu::BindGroupLayout {
        match kind {
            KernelKind::Forward => &self.forward_layout,
            KernelKind::Backward => &self.backward_layout,
        }
    }

    /// Returns the compiled pipeline for `key`, generating and compiling it on first use.
    ///
    /// # Errors
    /// If the generated source fails validation or the cache lock is poisoned.
    pub fn pipeline(&self, key: KernelKey) -> Result<Arc<wgpu::ComputePipeline>, GpuFailure> {
        let mut cache = self
            .pipelines
            .lock()
            .map_err(|_| GpuFailure::from("pipeline cache poisoned"))?;
        if let Some(pipeline) = cache.get(&key) {
            trace!(arity = key.arity, kind = ?key.kind, "pipeline cache hit");
            return Ok(Arc::clone(pipeline));
        }

        let label = key.label();
        debug!(arity = key.arity, kind = ?key.kind, "compiling fused kernel");
        let module = load_shader(&self.device, &label, &key.source())?;
        let layout = match key.kind {
            KernelKind::Forward => &self.forward_pipeline_layout,
            KernelKind::Backward => &self.backward_pipeline_layout,
        };
        let pipeline = Arc::new(self.device.create_compute_pipeline(
            &wgpu::ComputePipelineDescriptor {
                label: Some(label.as_str()),
                layout: Some(layout),
                module: &module,
                entry_point: Some("main"),
                cache: None,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
        ));
        cache.insert(key, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Whether a pipeline for `key` has been compiled already.
    pub fn has_pipeline(&self, key: KernelKey) -> bool {
        self.pipelines
            .lock()
            .is_ok_and(|cache| cache.contains_key(&key))
    }

    /// Blocks until all submitted work has finished.
    pub(crate) fn wait(&self) -> Result<(), GpuFailure> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| GpuError::Poll(e).into())
    }
}

/// Secure wrapper for generated WGSL source code.
pub struct WgslSource<'a>(pub &'a str);

impl<'a> Validate for WgslSource<'a> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;

        // unrolled kernels grow with the arity
        if src.len() > 1 << 20 {
            return Err(ValidationError);
        }

        if !src.contains("fn main") {
            return Err(ValidationError);
        }

        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }

        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// Validates WGSL source and compiles it into a labeled shader module.
pub fn load_shader(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source).validate()?;

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Result<GpuContext, String> = GpuContext::new().map_err(|e| {
        warn!(error = %e, "gpu context unavailable");
        e.to_string()
    });
}

/// The process-wide GPU context.
///
/// # Errors
/// If initialization failed; the original error is included in the message.
pub fn context() -> Result<&'static GpuContext, GpuFailure> {
    GPU_CONTEXT
        .as_ref()
        .map_err(|e| GpuFailure::from(format!("GPU context unavailable: {e}")))
}

/// Whether a GPU context could be created on this machine.
pub fn is_available() -> bool {
    GPU_CONTEXT.is_ok()
}

pub(crate) fn as_bytes<T: Copy>(data: &[T]) -> &[u8] {
    let len = std::mem::size_of_val(data);
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, len) }
}

pub(crate) fn bytes_to_f32_slice(data: &[u8]) -> Result<&[f32], &'static str> {
    use std::mem::{align_of, size_of};

    if data.as_ptr() as usize % align_of::<f32>() != 0 {
        return Err("unaligned buffer");
    }

    if data.len() % size_of::<f32>() != 0 {
        return Err("buffer length is not a multiple of f32");
    }

    let len = data.len() / size_of::<f32>();
    let ptr = data.as_ptr() as *const f32;
    unsafe { Ok(std::slice::from_raw_parts(ptr, len)) }
}
