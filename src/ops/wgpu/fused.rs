//! Fused strategy: each direction is a single kernel launch.
//!
//! Children are packed into one contiguous buffer with
//! `copy_buffer_to_buffer` in the same command encoder as the launch, so a
//! launch costs one submission regardless of the arity. Backward gradients
//! come out packed the same way and are split into per-child buffers before
//! the submission ends.
//!
//! Absent upstream gradients bind a zero-filled buffer; the kernel then adds
//! exact zeros. Both functions block until the work is done, so their outputs
//! are readable as soon as they return.

use tracing::trace;
use wgpu::util::DeviceExt;

use super::device::{buffer_size, check_fits, zeroed_buffer, ELEM_BYTES};
use super::{as_bytes, context, DeviceTensor, GpuContext, GpuFailure};
use crate::backprop::Upstream;
use crate::error::Result;
use crate::gates::{gate_count, inner_len};
use crate::ops::kernel::{workgroup_grid, KernelKey, KernelKind, KernelParams};
use crate::tensors::Element;

/// Launch parameters for a child shape.
///
/// Every buffer a launch binds (`x`, the packed children and the per-element
/// outputs) must fit the device limits and be indexable with `u32`.
fn params_for(
    limits: &wgpu::Limits,
    child_shape: &[usize],
    arity: usize,
    x_len: usize,
) -> std::result::Result<KernelParams, GpuFailure> {
    let len: usize = child_shape.iter().product();
    let packed = arity
        .checked_mul(len)
        .ok_or_else(|| GpuFailure::from("tensor too large for a fused launch"))?;
    for n in [x_len, packed, len] {
        check_fits(limits, n)?;
    }
    let too_large = |_| GpuFailure::from("tensor too large for a fused launch");
    u32::try_from(x_len).map_err(too_large)?;
    u32::try_from(packed).map_err(too_large)?;
    Ok(KernelParams {
        len: u32::try_from(len).map_err(too_large)?,
        inner: u32::try_from(inner_len(child_shape)).map_err(too_large)?,
        groups: u32::try_from(gate_count(arity)).map_err(too_large)?,
        _pad: 0,
    })
}

fn storage_buffer(ctx: &GpuContext, len: usize, label: &str) -> wgpu::Buffer {
    ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: buffer_size(len),
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn params_buffer(ctx: &GpuContext, params: &KernelParams) -> wgpu::Buffer {
    ctx.device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("treelstm_params"),
            contents: as_bytes(&params.as_words()),
            usage: wgpu::BufferUsages::UNIFORM,
        })
}

/// Copies every child into consecutive `len`-element blocks of one buffer.
fn pack_children<T: Element>(
    ctx: &GpuContext,
    encoder: &mut wgpu::CommandEncoder,
    children: &[&DeviceTensor<T>],
    len: usize,
) -> wgpu::Buffer {
    let packed = storage_buffer(ctx, children.len() * len, "treelstm_cells");
    let bytes = len as u64 * ELEM_BYTES;
    for (n, child) in children.iter().enumerate() {
        encoder.copy_buffer_to_buffer(child.buffer(), 0, &packed, n as u64 * bytes, bytes);
    }
    packed
}

fn bind(ctx: &GpuContext, kind: KernelKind, buffers: &[&wgpu::Buffer]) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(binding, buffer)| wgpu::BindGroupEntry {
            binding: binding as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("treelstm_bind_group"),
        layout: ctx.bind_group_layout(kind),
        entries: &entries,
    })
}

fn launch(
    encoder: &mut wgpu::CommandEncoder,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    len: u32,
) {
    let (x, y) = workgroup_grid(len);
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some("treelstm_pass"),
        timestamp_writes: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind_group, &[]);
    pass.dispatch_workgroups(x, y, 1);
}

/// Fused forward. Returns `(c, h)`.
///
/// # Errors
/// GPU failures, or buffers beyond the device limits.
pub fn forward<T: Element>(
    children: &[&DeviceTensor<T>],
    x: &DeviceTensor<T>,
) -> Result<(DeviceTensor<T>, DeviceTensor<T>)> {
    let ctx = context()?;
    let arity = children.len();
    let shape = children[0].shape().to_vec();
    let len = children[0].len();
    if len == 0 {
        return Ok((DeviceTensor::zeros(shape.clone())?, DeviceTensor::zeros(shape)?));
    }
    let params = params_for(&ctx.device.limits(), &shape, arity, x.len())?;
    let pipeline = ctx.pipeline(KernelKey::forward(arity))?;
    trace!(arity, len, "fused forward launch");

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("treelstm_fwd_encoder"),
        });
    let cells = pack_children(ctx, &mut encoder, children, len);
    let params_buf = params_buffer(ctx, &params);
    let c_out = storage_buffer(ctx, len, "treelstm_c");
    let h_out = storage_buffer(ctx, len, "treelstm_h");

    let bind_group = bind(
        ctx,
        KernelKind::Forward,
        &[&params_buf, x.buffer(), &cells, &c_out, &h_out],
    );
    launch(&mut encoder, &pipeline, &bind_group, params.len);
    ctx.queue.submit(Some(encoder.finish()));
    ctx.wait()?;

    Ok((
        DeviceTensor::from_buffer(shape.clone(), c_out),
        DeviceTensor::from_buffer(shape, h_out),
    ))
}

/// Fused backward. Returns `(gc_1..gc_N, gx)`.
///
/// `c` is the cell state produced by the matching forward call; the gate
/// activations are recomputed from `x`.
///
/// # Errors
/// GPU failures, or buffers beyond the device limits.
pub fn backward<T: Element>(
    c: &DeviceTensor<T>,
    children: &[&DeviceTensor<T>],
    x: &DeviceTensor<T>,
    grad_c: Upstream<'_, DeviceTensor<T>>,
    grad_h: Upstream<'_, DeviceTensor<T>>,
) -> Result<(Vec<DeviceTensor<T>>, DeviceTensor<T>)> {
    let ctx = context()?;
    let arity = children.len();
    let shape = children[0].shape().to_vec();
    let len = children[0].len();
    if len == 0 {
        let gcs = (0..arity)
            .map(|_| DeviceTensor::zeros(shape.clone()))
            .collect::<Result<Vec<_>>>()?;
        return Ok((gcs, DeviceTensor::zeros(x.shape().to_vec())?));
    }
    let params = params_for(&ctx.device.limits(), &shape, arity, x.len())?;
    let pipeline = ctx.pipeline(KernelKey::backward(arity))?;
    trace!(
        arity,
        len,
        grad_c = grad_c.given().is_some(),
        grad_h = grad_h.given().is_some(),
        "fused backward launch"
    );

    let zero_c;
    let gc = match grad_c {
        Upstream::Given(g) => g.buffer(),
        Upstream::Zero => {
            zero_c = zeroed_buffer(len, "treelstm_gc_zero")?;
            &zero_c
        }
    };
    let zero_h;
    let gh = match grad_h {
        Upstream::Given(g) => g.buffer(),
        Upstream::Zero => {
            zero_h = zeroed_buffer(len, "treelstm_gh_zero")?;
            &zero_h
        }
    };

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("treelstm_bwd_encoder"),
        });
    let cells = pack_children(ctx, &mut encoder, children, len);
    let params_buf = params_buffer(ctx, &params);
    let gx = storage_buffer(ctx, x.len(), "treelstm_gx");
    let gcells = storage_buffer(ctx, arity * len, "treelstm_gcells");

    let bind_group = bind(
        ctx,
        KernelKind::Backward,
        &[&params_buf, c.buffer(), gc, gh, x.buffer(), &cells, &gx, &gcells],
    );
    launch(&mut encoder, &pipeline, &bind_group, params.len);

    let bytes = len as u64 * ELEM_BYTES;
    let gcs: Vec<wgpu::Buffer> = (0..arity)
        .map(|n| {
            let out = storage_buffer(ctx, len, "treelstm_gchild");
            encoder.copy_buffer_to_buffer(&gcells, n as u64 * bytes, &out, 0, bytes);
            out
        })
        .collect();
    ctx.queue.submit(Some(encoder.finish()));
    ctx.wait()?;

    let gcs = gcs
        .into_iter()
        .map(|buffer| DeviceTensor::from_buffer(shape.clone(), buffer))
        .collect();
    Ok((gcs, DeviceTensor::from_buffer(x.shape().to_vec(), gx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_follow_child_shape() {
        let limits = wgpu::Limits::default();
        let p = params_for(&limits, &[4, 3, 2], 5, 4 * 8 * 3 * 2).unwrap();
        assert_eq!(p.len, 24);
        assert_eq!(p.inner, 6);
        assert_eq!(p.groups, 8);
    }

    #[test]
    fn oversized_launch_is_rejected() {
        let limits = wgpu::Limits::default();
        let huge = u32::MAX as usize + 1;
        assert!(params_for(&limits, &[1, 1], 2, huge).is_err());
    }

    #[test]
    fn packed_children_over_binding_size_are_rejected() {
        let limits = wgpu::Limits::default();
        // 5 * 8M f32 children is 160 MiB, over the default 128 MiB binding
        let child = [8, 1 << 20];
        assert!(params_for(&limits, &child, 5, 8 * 8 * (1 << 20)).is_err());
        // the same launch at arity 2 with a small x still trips on x alone
        let x_over = (u64::from(limits.max_storage_buffer_binding_size) / ELEM_BYTES + 1) as usize;
        assert!(params_for(&limits, &[1, 4], 2, x_over).is_err());
        assert!(params_for(&limits, &[8, 1 << 10], 5, 8 * 8 * (1 << 10)).is_ok());
    }
}
