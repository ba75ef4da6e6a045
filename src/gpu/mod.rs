//! GPU plumbing: device context, compiled kernel bundle, buffer registry
//! and small launch/read-back helpers shared by the pipeline and the
//! correctness tests.

pub mod context;
pub mod kernels;
pub mod registry;

pub use context::{DevicePreference, GpuContext};
pub use kernels::{Kernel, KernelBundle};
pub use registry::{BufferRegistry, DeviceBuffer, OctaveBuffers, OctaveKind};

use wgpu::util::DeviceExt;

use crate::error::{Error, Result};

/// Workgroup tile of the image kernels. Threads run along the row (x is
/// the fastest axis) with one row of tiles per image row.
pub const TILE_WIDTH: u32 = 64;

/// Workgroup size of the one-dimensional keypoint-list kernels.
pub const LIST_TILE: u32 = 64;

/// Workgroup size of the min/max reduction.
pub const REDUCE_TILE: u32 = 256;

/// Upper bound on reduction workgroups; threads grid-stride past it.
pub const REDUCE_MAX_GROUPS: u32 = 1024;

/// Rounds a processing size up to whole workgroups, one thread per pixel.
pub fn calc_size(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(TILE_WIDTH), height)
}

/// Workgroup count for a keypoint-list dispatch over `count` records.
pub fn calc_list_size(count: u32) -> u32 {
    count.div_ceil(LIST_TILE).max(1)
}

/// Workgroup count for the min/max reduction over `len` elements.
pub fn calc_reduce_size(len: usize) -> u32 {
    ((len as u32).div_ceil(REDUCE_TILE)).clamp(1, REDUCE_MAX_GROUPS)
}

/// Records one compute dispatch: bind the kernel's buffers in binding
/// order, append a transient uniform block as the last binding and issue
/// `groups` workgroups. The uniform buffer plays the role kernel scalar
/// arguments have on other compute stacks.
pub fn encode_dispatch(
    device: &wgpu::Device,
    encoder: &mut wgpu::CommandEncoder,
    kernel: &Kernel,
    name: &str,
    buffers: &[&wgpu::Buffer],
    params: &[u8],
    groups: (u32, u32),
) {
    let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(name),
        contents: params,
        usage: wgpu::BufferUsages::UNIFORM,
    });
    let mut entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(i, buffer)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    entries.push(wgpu::BindGroupEntry {
        binding: buffers.len() as u32,
        resource: params_buffer.as_entire_binding(),
    });
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(name),
        layout: &kernel.layout,
        entries: &entries,
    });

    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(name),
        timestamp_writes: None,
    });
    pass.set_pipeline(&kernel.pipeline);
    pass.set_bind_group(0, &bind_group, &[]);
    pass.dispatch_workgroups(groups.0, groups.1, 1);
}

/// Copies `bytes` from a device buffer into host memory, blocking until
/// the transfer completes.
pub fn read_buffer(ctx: &GpuContext, buffer: &wgpu::Buffer, bytes: u64) -> Result<Vec<u8>> {
    let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging"),
        size: bytes,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, bytes);
    ctx.queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (sender, receiver) = futures::channel::oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    ctx.wait_idle()?;
    pollster::block_on(receiver)
        .map_err(|_| Error::Gpu("buffer map result channel closed".to_string()))?
        .map_err(|e| Error::Gpu(format!("buffer mapping failed: {e:?}")))?;

    let data = slice.get_mapped_range().to_vec();
    staging.unmap();
    Ok(data)
}

/// Reads a float buffer back as a vector. The byte copy is re-packed
/// explicitly since the mapped bytes carry no alignment guarantee.
pub fn read_buffer_f32(ctx: &GpuContext, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<f32>> {
    let bytes = read_buffer(ctx, buffer, (len * 4) as u64)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Reads a single u32, used for the keypoint counter.
pub fn read_counter(ctx: &GpuContext, buffer: &wgpu::Buffer) -> Result<u32> {
    let bytes = read_buffer(ctx, buffer, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
