//! Device buffer registry.
//!
//! Two typed tables behind one owner: a string-keyed map for singleton
//! buffers (input image, raw upload words, Gaussian taps, the keypoint
//! array and its counter) and a dense per-octave structure holding the
//! Gaussian stack, the DoG stack and the scratch planes. Everything is
//! allocated eagerly at plan construction and reused across images.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Scratch and stack planes of one octave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OctaveKind {
    Gaussian,
    Dog,
    Tmp,
    Grad,
    Ori,
}

pub struct DeviceBuffer {
    pub buffer: wgpu::Buffer,
    /// Element count, not bytes.
    pub len: usize,
}

pub struct OctaveBuffers {
    pub width: u32,
    pub height: u32,
    gauss: Vec<DeviceBuffer>,
    dog: Vec<DeviceBuffer>,
    tmp: DeviceBuffer,
    grad: DeviceBuffer,
    ori: DeviceBuffer,
}

impl OctaveBuffers {
    pub fn get(&self, level: usize, kind: OctaveKind) -> Result<&DeviceBuffer> {
        let buf = match kind {
            OctaveKind::Gaussian => self.gauss.get(level),
            OctaveKind::Dog => self.dog.get(level),
            OctaveKind::Tmp => Some(&self.tmp),
            OctaveKind::Grad => Some(&self.grad),
            OctaveKind::Ori => Some(&self.ori),
        };
        buf.ok_or_else(|| {
            Error::BufferMissing(format!("octave level {level} kind {kind:?}"))
        })
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[derive(Default)]
pub struct BufferRegistry {
    named: HashMap<String, DeviceBuffer>,
    octaves: Vec<OctaveBuffers>,
}

fn storage_buffer(device: &wgpu::Device, label: &str, len: usize, bytes_per: usize) -> DeviceBuffer {
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: (len * bytes_per) as u64,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });
    DeviceBuffer { buffer, len }
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a named float buffer of `len` elements.
    pub fn allocate_named(&mut self, device: &wgpu::Device, name: &str, len: usize) {
        log::debug!("allocating {len} floats for buffer {name}");
        self.named
            .insert(name.to_string(), storage_buffer(device, name, len, 4));
    }

    /// Allocate a named u32 word buffer, used for raw pixel uploads.
    pub fn allocate_named_words(&mut self, device: &wgpu::Device, name: &str, words: usize) {
        log::debug!("allocating {words} words for buffer {name}");
        self.named
            .insert(name.to_string(), storage_buffer(device, name, words, 4));
    }

    /// Allocate the full stack of one octave: S + 3 Gaussian planes,
    /// S + 2 DoG planes and the three scratch planes.
    pub fn allocate_octave(
        &mut self,
        device: &wgpu::Device,
        octave: usize,
        width: u32,
        height: u32,
        scales: u32,
    ) {
        let pixels = width as usize * height as usize;
        log::debug!(
            "allocating octave {octave}: {width}x{height}, {} planes",
            scales as usize * 2 + 8
        );
        let gauss = (0..scales + 3)
            .map(|i| storage_buffer(device, &format!("g_{octave}_{i}"), pixels, 4))
            .collect();
        let dog = (0..scales + 2)
            .map(|i| storage_buffer(device, &format!("dog_{octave}_{i}"), pixels, 4))
            .collect();
        self.octaves.push(OctaveBuffers {
            width,
            height,
            gauss,
            dog,
            tmp: storage_buffer(device, &format!("tmp_{octave}"), pixels, 4),
            grad: storage_buffer(device, &format!("grad_{octave}"), pixels, 4),
            ori: storage_buffer(device, &format!("ori_{octave}"), pixels, 4),
        });
    }

    pub fn named(&self, name: &str) -> Result<&DeviceBuffer> {
        self.named
            .get(name)
            .ok_or_else(|| Error::BufferMissing(name.to_string()))
    }

    pub fn has_named(&self, name: &str) -> bool {
        self.named.contains_key(name)
    }

    pub fn octave(&self, octave: usize) -> Result<&OctaveBuffers> {
        self.octaves
            .get(octave)
            .ok_or_else(|| Error::BufferMissing(format!("octave {octave}")))
    }

    pub fn octave_count(&self) -> usize {
        self.octaves.len()
    }

    /// Release every allocation in a single pass. Individual buffer
    /// destruction cannot report failure here, so teardown always runs to
    /// completion; anything still in flight is released when the last
    /// reference drops.
    pub fn teardown(&mut self) {
        let mut released = 0usize;
        for (_, entry) in self.named.drain() {
            entry.buffer.destroy();
            released += 1;
        }
        for octave in self.octaves.drain(..) {
            for entry in octave
                .gauss
                .into_iter()
                .chain(octave.dog)
                .chain([octave.tmp, octave.grad, octave.ori])
            {
                entry.buffer.destroy();
                released += 1;
            }
        }
        log::debug!("released {released} device buffers");
    }
}

impl Drop for BufferRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}
