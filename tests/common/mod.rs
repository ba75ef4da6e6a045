//! Shared helpers for the GPU correctness tests.

#![allow(dead_code)]

use bytemuck::{Pod, Zeroable};
use sift_gpu::gpu::{DevicePreference, GpuContext};
use wgpu::util::DeviceExt;

/// Acquire a compute context or skip the test when no adapter exists.
pub fn try_context() -> Option<GpuContext> {
    let _ = env_logger::builder().is_test(true).try_init();
    match GpuContext::new(DevicePreference::Any) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("GPU not available, skipping test: {e}");
            None
        }
    }
}

pub fn storage_from_f32(ctx: &GpuContext, label: &str, data: &[f32]) -> wgpu::Buffer {
    ctx.device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        })
}

pub fn storage_empty_f32(ctx: &GpuContext, label: &str, len: usize) -> wgpu::Buffer {
    ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: (len * 4) as u64,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

pub fn storage_counter(ctx: &GpuContext) -> wgpu::Buffer {
    ctx.device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("counter"),
            contents: &0u32.to_le_bytes(),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        })
}

/// Deterministic pseudo-random floats in [0, 1).
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_f32(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x >> 40) as f32 / (1u64 << 24) as f32
    }
}

// Uniform parameter blocks matching the shader-side structs.

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ConvParams {
    pub width: u32,
    pub height: u32,
    pub ksize: u32,
    pub _pad0: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct GradientParams {
    pub width: u32,
    pub height: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct MaxminParams {
    pub width: u32,
    pub height: u32,
    pub border_dist: u32,
    pub capacity: u32,
    pub peak_thresh: f32,
    pub edge_thresh0: f32,
    pub edge_thresh: f32,
    pub octsize: f32,
    pub scale_index: f32,
    pub _pad0: u32,
    pub _pad1: u32,
    pub _pad2: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct InterpParams {
    pub width: u32,
    pub height: u32,
    pub start: u32,
    pub end: u32,
    pub peak_thresh: f32,
    pub init_sigma: f32,
    pub scales: f32,
    pub moves: u32,
}
