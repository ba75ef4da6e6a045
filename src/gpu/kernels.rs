//! Compiled compute kernels, addressable by entry-point name.
//!
//! Every shader is embedded in the binary and compiled eagerly when the
//! bundle is built, so a missing or malformed kernel fails plan
//! construction rather than the first image.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Binding slot kinds, in binding-index order. The uniform parameter block
/// is always the last binding of a kernel.
#[derive(Debug, Clone, Copy)]
pub enum Binding {
    ReadStorage,
    RwStorage,
    Uniform,
}

pub struct Kernel {
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
}

/// Every compute pipeline of the detection pipeline, keyed by kernel name.
pub struct KernelBundle {
    kernels: HashMap<&'static str, Kernel>,
}

struct ShaderSpec {
    source: &'static str,
    label: &'static str,
    entries: &'static [(&'static str, &'static [Binding])],
}

const READ: Binding = Binding::ReadStorage;
const RW: Binding = Binding::RwStorage;
const UNIFORM: Binding = Binding::Uniform;

const SHADERS: &[ShaderSpec] = &[
    ShaderSpec {
        source: include_str!("shaders/convert.wgsl"),
        label: "convert",
        entries: &[
            ("u8_to_float", &[READ, RW, UNIFORM]),
            ("u16_to_float", &[READ, RW, UNIFORM]),
            ("s32_to_float", &[READ, RW, UNIFORM]),
            ("s64_to_float", &[READ, RW, UNIFORM]),
            ("rgb_to_float", &[READ, RW, UNIFORM]),
        ],
    },
    ShaderSpec {
        source: include_str!("shaders/normalize.wgsl"),
        label: "normalize",
        entries: &[("normalizes", &[RW, UNIFORM])],
    },
    ShaderSpec {
        source: include_str!("shaders/reduce_minmax.wgsl"),
        label: "reduce_minmax",
        entries: &[("reduce_min_max", &[READ, RW, UNIFORM])],
    },
    ShaderSpec {
        source: include_str!("shaders/convolution.wgsl"),
        label: "convolution",
        entries: &[
            ("horizontal_convolution", &[READ, RW, READ, UNIFORM]),
            ("vertical_convolution", &[READ, RW, READ, UNIFORM]),
        ],
    },
    ShaderSpec {
        source: include_str!("shaders/combine.wgsl"),
        label: "combine",
        entries: &[("combine", &[READ, READ, RW, UNIFORM])],
    },
    ShaderSpec {
        source: include_str!("shaders/shrink.wgsl"),
        label: "shrink",
        entries: &[("shrink", &[READ, RW, UNIFORM])],
    },
    ShaderSpec {
        source: include_str!("shaders/gradient.wgsl"),
        label: "gradient",
        entries: &[("compute_gradient_orientation", &[READ, RW, RW, UNIFORM])],
    },
    ShaderSpec {
        source: include_str!("shaders/local_maxmin.wgsl"),
        label: "local_maxmin",
        entries: &[("local_maxmin", &[READ, READ, READ, RW, RW, UNIFORM])],
    },
    ShaderSpec {
        source: include_str!("shaders/interp_keypoint.wgsl"),
        label: "interp_keypoint",
        entries: &[("interp_keypoint", &[READ, READ, READ, RW, UNIFORM])],
    },
    ShaderSpec {
        source: include_str!("shaders/orientation.wgsl"),
        label: "orientation",
        entries: &[("orientation_assignment", &[RW, READ, READ, RW, UNIFORM])],
    },
];

fn layout_entry(binding: u32, kind: Binding) -> wgpu::BindGroupLayoutEntry {
    let ty = match kind {
        Binding::ReadStorage => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        Binding::RwStorage => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        Binding::Uniform => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
    };
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: None,
    }
}

impl KernelBundle {
    pub fn new(device: &wgpu::Device) -> Result<Self> {
        let mut kernels = HashMap::new();
        for spec in SHADERS {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(spec.label),
                source: wgpu::ShaderSource::Wgsl(spec.source.into()),
            });
            for (entry_point, bindings) in spec.entries {
                let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
                    .iter()
                    .enumerate()
                    .map(|(i, kind)| layout_entry(i as u32, *kind))
                    .collect();
                let layout =
                    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some(entry_point),
                        entries: &layout_entries,
                    });
                let pipeline_layout =
                    device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some(entry_point),
                        bind_group_layouts: &[&layout],
                        push_constant_ranges: &[],
                    });
                let pipeline =
                    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(entry_point),
                        layout: Some(&pipeline_layout),
                        module: &module,
                        entry_point: Some(entry_point),
                        compilation_options: Default::default(),
                        cache: None,
                    });
                kernels.insert(*entry_point, Kernel { pipeline, layout });
            }
        }
        log::debug!("compiled {} compute kernels", kernels.len());
        Ok(Self { kernels })
    }

    pub fn get(&self, name: &str) -> Result<&Kernel> {
        self.kernels
            .get(name)
            .ok_or_else(|| Error::KernelMissing(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}
