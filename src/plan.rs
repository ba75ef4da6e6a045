//! The detection pipeline.
//!
//! A `SiftPlan` is built once for a given image shape and pixel type: it
//! acquires a device, compiles the kernel bundle, precomputes the Gaussian
//! taps and eagerly allocates every octave buffer. `keypoints` then runs
//! the whole scale-space pipeline on the device for each image, reading
//! back only reduction results, per-level counters and the final records.
//!
//! ```no_run
//! use ndarray::Array2;
//! use sift_gpu::prelude::*;
//!
//! # fn main() -> sift_gpu::error::Result<()> {
//! let image = Array2::<f32>::zeros((512, 512));
//! let input = ImageInput::F32(image.view());
//! let mut plan = SiftPlan::for_image(&input, SiftParams::default(), DevicePreference::Gpu, false)?;
//! let keypoints = plan.keypoints(&input)?;
//! println!("{} keypoints", keypoints.nrows());
//! # Ok(())
//! # }
//! ```

use std::time::Instant;

use bytemuck::{Pod, Zeroable};
use ndarray::Array2;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::descriptor::compute_descriptor;
use crate::error::{Error, Result};
use crate::gaussian::{required_sigmas, GaussianTable};
use crate::gpu::{
    calc_list_size, calc_reduce_size, calc_size, encode_dispatch, read_buffer_f32, read_counter,
    BufferRegistry, DevicePreference, GpuContext, KernelBundle, OctaveKind,
};
use crate::image::{ImageInput, ImageShape, PixelType};
use crate::keypoint::{is_sentinel, Keypoint, ROW_LEN};
use crate::params::SiftParams;

/// Upper bound on re-centering moves during sub-pixel refinement.
const MOVE_BUDGET: u32 = 5;

/// Observed value range is rescaled to [0, NORMALIZE_TARGET].
const NORMALIZE_TARGET: f32 = 255.0;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ConvertParams {
    width: u32,
    height: u32,
    _pad0: u32,
    _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct NormalizeParams {
    width: u32,
    height: u32,
    min_val: f32,
    max_val: f32,
    target: f32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ReduceParams {
    length: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ConvParams {
    width: u32,
    height: u32,
    ksize: u32,
    _pad0: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct CombineParams {
    width: u32,
    height: u32,
    coef_a: f32,
    coef_b: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ShrinkParams {
    out_width: u32,
    out_height: u32,
    in_width: u32,
    in_height: u32,
    stride_x: u32,
    stride_y: u32,
    _pad0: u32,
    _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct GradientParams {
    width: u32,
    height: u32,
    _pad0: u32,
    _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct MaxminParams {
    width: u32,
    height: u32,
    border_dist: u32,
    capacity: u32,
    peak_thresh: f32,
    edge_thresh0: f32,
    edge_thresh: f32,
    octsize: f32,
    scale_index: f32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct InterpParams {
    width: u32,
    height: u32,
    start: u32,
    end: u32,
    peak_thresh: f32,
    init_sigma: f32,
    scales: f32,
    moves: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct OrientationParams {
    width: u32,
    height: u32,
    start: u32,
    end: u32,
    capacity: u32,
    _pad0: u32,
    ori_sigma: f32,
    peak_frac: f32,
}

/// Opt-in stage timing. When disabled no synchronization is inserted.
struct Profiler {
    enabled: bool,
    last: Instant,
}

impl Profiler {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last: Instant::now(),
        }
    }

    fn stage(&mut self, ctx: &GpuContext, label: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        ctx.wait_idle()?;
        let now = Instant::now();
        log::info!(
            "{label} took {:.3}ms",
            now.duration_since(self.last).as_secs_f64() * 1000.0
        );
        self.last = now;
        Ok(())
    }
}

/// Per-level record ranges produced by detection, in raw counter values
/// clamped to the array capacity.
type LevelRanges = Vec<(u32, u32)>;

/// Read-back gradient planes of one octave, indexed by level.
type GradientPlanes = Vec<Option<(Array2<f32>, Array2<f32>)>>;

/// A configured detection pipeline bound to one device.
///
/// The plan owns every device resource it uses; it is not meant to be
/// shared between threads and `keypoints` takes `&mut self`.
pub struct SiftPlan {
    params: SiftParams,
    shape: ImageShape,
    pixel_type: PixelType,
    profile: bool,
    // Registry precedes the context so buffers are torn down while the
    // device is still alive.
    registry: BufferRegistry,
    kernels: KernelBundle,
    ctx: GpuContext,
    gaussians: GaussianTable,
    sentinel: Vec<u8>,
    last_count: usize,
}

/// Octave shapes, halving until the shorter side can no longer hold the
/// bordered 3x3 scan. The last shape produced by the loop is dropped so
/// every kept octave scans with a full neighborhood margin.
fn octave_shapes(shape: &ImageShape, border_dist: u32) -> Vec<(u32, u32)> {
    let min_size = 2 * border_dist + 2;
    let mut width = shape.width as u32;
    let mut height = shape.height as u32;
    let mut shapes = vec![(width, height)];
    while width.min(height) > min_size {
        width /= 2;
        height /= 2;
        shapes.push((width, height));
    }
    shapes.pop();
    shapes
}

impl SiftPlan {
    /// Builds a plan for the given shape and pixel type, acquiring a
    /// device matching the preference.
    pub fn new(
        shape: ImageShape,
        pixel_type: PixelType,
        params: SiftParams,
        preference: DevicePreference,
        profile: bool,
    ) -> Result<Self> {
        let ctx = GpuContext::new(preference)?;
        Self::with_context(ctx, shape, pixel_type, params, profile)
    }

    /// Builds a plan shaped after an example image.
    pub fn for_image(
        image: &ImageInput<'_>,
        params: SiftParams,
        preference: DevicePreference,
        profile: bool,
    ) -> Result<Self> {
        Self::new(image.shape(), image.pixel_type(), params, preference, profile)
    }

    /// Builds a plan on an already-acquired context, for callers that
    /// selected a specific adapter themselves.
    pub fn with_context(
        ctx: GpuContext,
        shape: ImageShape,
        pixel_type: PixelType,
        params: SiftParams,
        profile: bool,
    ) -> Result<Self> {
        params.validate()?;
        shape.validate(pixel_type)?;

        let shapes = octave_shapes(&shape, params.border_dist);
        if shapes.is_empty() {
            return Err(Error::InvalidShape(format!(
                "image {}x{} too small for border distance {}",
                shape.height, shape.width, params.border_dist
            )));
        }

        let kernels = KernelBundle::new(&ctx.device)?;
        let mut registry = BufferRegistry::new();

        let pixels = shape.pixels();
        registry.allocate_named(&ctx.device, "input", pixels);
        if pixel_type != PixelType::F32 || shape.channels != 1 {
            let raw_bytes = pixels * shape.channels * pixel_type.sample_bytes();
            registry.allocate_named_words(&ctx.device, "raw", raw_bytes.div_ceil(4));
        }
        for (octave, &(width, height)) in shapes.iter().enumerate() {
            registry.allocate_octave(&ctx.device, octave, width, height, params.scales);
        }
        registry.allocate_named(&ctx.device, "keypoints", params.keypoint_capacity * 4);
        registry.allocate_named(&ctx.device, "counter", 1);
        registry.allocate_named(
            &ctx.device,
            "minmax_partials",
            crate::gpu::REDUCE_MAX_GROUPS as usize * 2,
        );

        let mut gaussians = GaussianTable::new();
        for sigma in required_sigmas(params.scales, params.init_sigma, params.initial_blur()) {
            if let Some(taps) = gaussians.insert(sigma) {
                let name = crate::gaussian::taps_buffer_name(sigma);
                registry.allocate_named(&ctx.device, &name, taps.len());
                let buffer = registry.named(&name)?;
                ctx.queue
                    .write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(&taps));
            }
        }

        let sentinel = bytemuck::cast_slice(&vec![-1.0f32; params.keypoint_capacity * 4]).to_vec();

        let plan = Self {
            params,
            shape,
            pixel_type,
            profile,
            ctx,
            kernels,
            registry,
            gaussians,
            sentinel,
            last_count: 0,
        };
        log::debug!(
            "plan ready: {} octaves, estimated device footprint {} MB",
            plan.registry.octave_count(),
            plan.estimated_device_memory() >> 20
        );
        Ok(plan)
    }

    /// Number of pyramid octaves this plan processes.
    pub fn octave_count(&self) -> usize {
        self.registry.octave_count()
    }

    /// Shape (height, width) of one octave.
    pub fn octave_shape(&self, octave: usize) -> Result<(usize, usize)> {
        let oct = self.registry.octave(octave)?;
        Ok((oct.height as usize, oct.width as usize))
    }

    /// Keypoint count of the most recent `keypoints` call.
    pub fn keypoint_count(&self) -> usize {
        self.last_count
    }

    /// Rough device memory footprint, matching what construction
    /// allocates: context overhead, the input buffers, every octave stack
    /// and the keypoint array.
    pub fn estimated_device_memory(&self) -> usize {
        let mut bytes = 75 << 20;
        let pixels = self.shape.pixels();
        bytes += pixels * 4;
        if self.pixel_type != PixelType::F32 || self.shape.channels != 1 {
            bytes += pixels * self.shape.channels * self.pixel_type.sample_bytes();
        }
        for octave in 0..self.registry.octave_count() {
            if let Ok(oct) = self.registry.octave(octave) {
                let planes = 2 * self.params.scales as usize + 8;
                bytes += oct.pixels() * planes * 4;
            }
        }
        bytes += self.params.keypoint_capacity * 16 + 4;
        bytes
    }

    /// Detects keypoints in one image, producing an N x 132 array whose
    /// rows are (x, y, sigma, angle, d0..d127) in input-image coordinates.
    pub fn keypoints(&mut self, image: &ImageInput<'_>) -> Result<Array2<f32>> {
        if image.shape() != self.shape {
            return Err(Error::ImageMismatch(format!(
                "expected {:?}, got {:?}",
                self.shape,
                image.shape()
            )));
        }
        if image.pixel_type() != self.pixel_type {
            return Err(Error::ImageMismatch(format!(
                "expected {:?} pixels, got {:?}",
                self.pixel_type,
                image.pixel_type()
            )));
        }

        let start_time = Instant::now();
        let mut profiler = Profiler::new(self.profile);

        self.upload_image(image)?;
        self.normalize_input()?;
        self.build_base()?;
        profiler.stage(&self.ctx, "preprocess")?;

        let mut rows: Vec<f32> = Vec::new();
        let mut total = 0usize;
        for octave in 0..self.registry.octave_count() {
            log::debug!("working on octave {octave}");
            self.build_octave(octave)?;
            profiler.stage(&self.ctx, &format!("octave {octave} pyramid"))?;

            let ranges = self.detect_octave(octave)?;
            profiler.stage(&self.ctx, &format!("octave {octave} detection"))?;

            self.refine_octave(octave, &ranges)?;
            let planes = self.orient_octave(octave, &ranges)?;
            profiler.stage(&self.ctx, &format!("octave {octave} refinement"))?;

            total += self.collect_octave(octave, &planes, &mut rows)?;
            profiler.stage(&self.ctx, &format!("octave {octave} descriptors"))?;
        }

        self.last_count = total;
        log::info!(
            "{total} keypoints in {:.3}s",
            start_time.elapsed().as_secs_f64()
        );
        Array2::from_shape_vec((total, ROW_LEN), rows)
            .map_err(|e| Error::Gpu(format!("keypoint array shape: {e}")))
    }

    /// Copy of one Gaussian plane, mainly for diagnostics and tests.
    pub fn gaussian_level(&self, octave: usize, level: usize) -> Result<Array2<f32>> {
        self.read_plane(octave, level, OctaveKind::Gaussian)
    }

    /// Copy of one DoG plane.
    pub fn dog_level(&self, octave: usize, level: usize) -> Result<Array2<f32>> {
        self.read_plane(octave, level, OctaveKind::Dog)
    }

    fn read_plane(&self, octave: usize, level: usize, kind: OctaveKind) -> Result<Array2<f32>> {
        let oct = self.registry.octave(octave)?;
        let buffer = oct.get(level, kind)?;
        let data = read_buffer_f32(&self.ctx, &buffer.buffer, oct.pixels())?;
        Array2::from_shape_vec((oct.height as usize, oct.width as usize), data)
            .map_err(|e| Error::Gpu(format!("plane shape: {e}")))
    }

    fn upload_image(&self, image: &ImageInput<'_>) -> Result<()> {
        let bytes = image.to_bytes();
        let (width, height) = (self.shape.width as u32, self.shape.height as u32);

        if self.pixel_type == PixelType::F32 && self.shape.channels == 1 {
            let input = self.registry.named("input")?;
            self.ctx.queue.write_buffer(&input.buffer, 0, &bytes);
            return Ok(());
        }

        let raw = self.registry.named("raw")?;
        self.ctx.queue.write_buffer(&raw.buffer, 0, &bytes);

        let kernel_name = match (self.pixel_type, self.shape.channels) {
            (PixelType::U8, 3) => "rgb_to_float",
            (PixelType::U8, _) => "u8_to_float",
            (PixelType::U16, _) => "u16_to_float",
            (PixelType::S32, _) => "s32_to_float",
            (PixelType::S64, _) => "s64_to_float",
            (other, _) => {
                return Err(Error::UnsupportedPixelType(format!("{other:?}")));
            }
        };
        let input = self.registry.named("input")?;
        let params = ConvertParams {
            width,
            height,
            _pad0: 0,
            _pad1: 0,
        };
        let mut encoder = self.encoder("convert");
        encode_dispatch(
            &self.ctx.device,
            &mut encoder,
            self.kernels.get(kernel_name)?,
            kernel_name,
            &[&raw.buffer, &input.buffer],
            bytemuck::bytes_of(&params),
            calc_size(width, height),
        );
        self.ctx.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    /// On-device min/max reduction followed by the linear rescale of the
    /// observed range to [0, 255]. The rescale applies to every pixel
    /// type, including f32 input.
    fn normalize_input(&self) -> Result<()> {
        let pixels = self.shape.pixels();
        let (width, height) = (self.shape.width as u32, self.shape.height as u32);
        let input = self.registry.named("input")?;
        let partials = self.registry.named("minmax_partials")?;

        let groups = calc_reduce_size(pixels);
        let params = ReduceParams {
            length: pixels as u32,
            _pad0: 0,
            _pad1: 0,
            _pad2: 0,
        };
        let mut encoder = self.encoder("reduce");
        encode_dispatch(
            &self.ctx.device,
            &mut encoder,
            self.kernels.get("reduce_min_max")?,
            "reduce_min_max",
            &[&input.buffer, &partials.buffer],
            bytemuck::bytes_of(&params),
            (groups, 1),
        );
        self.ctx.queue.submit(Some(encoder.finish()));

        let folded = read_buffer_f32(&self.ctx, &partials.buffer, groups as usize * 2)?;
        let (min_val, max_val) = folded.chunks(2).fold(
            (f32::MAX, f32::MIN),
            |(lo, hi), pair| (lo.min(pair[0]), hi.max(pair[1])),
        );
        log::debug!("input range [{min_val}, {max_val}]");

        let params = NormalizeParams {
            width,
            height,
            min_val,
            max_val,
            target: NORMALIZE_TARGET,
            _pad0: 0,
            _pad1: 0,
            _pad2: 0,
        };
        let mut encoder = self.encoder("normalize");
        encode_dispatch(
            &self.ctx.device,
            &mut encoder,
            self.kernels.get("normalizes")?,
            "normalizes",
            &[&input.buffer],
            bytemuck::bytes_of(&params),
            calc_size(width, height),
        );
        self.ctx.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    /// Writes the first Gaussian plane: pre-blur up to `init_sigma` when
    /// the assumed input blur is below it, otherwise a plain copy.
    fn build_base(&self) -> Result<()> {
        let cur_sigma = self.params.initial_blur();
        let input = self.registry.named("input")?;
        let oct = self.registry.octave(0)?;
        let base = oct.get(0, OctaveKind::Gaussian)?;

        if self.params.init_sigma > cur_sigma {
            let sigma =
                (self.params.init_sigma * self.params.init_sigma - cur_sigma * cur_sigma).sqrt();
            log::debug!("blurring image to reach sigma {}", self.params.init_sigma);
            let mut encoder = self.encoder("base blur");
            self.encode_convolution(&mut encoder, 0, &input.buffer, &base.buffer, sigma)?;
            self.ctx.queue.submit(Some(encoder.finish()));
        } else {
            let mut encoder = self.encoder("base copy");
            encoder.copy_buffer_to_buffer(
                &input.buffer,
                0,
                &base.buffer,
                0,
                (oct.pixels() * 4) as u64,
            );
            self.ctx.queue.submit(Some(encoder.finish()));
        }
        Ok(())
    }

    /// Gaussian stack and DoG planes for one octave, then the decimated
    /// base of the next octave.
    fn build_octave(&self, octave: usize) -> Result<()> {
        let oct = self.registry.octave(octave)?;
        let (width, height) = (oct.width, oct.height);
        let ratio = self.params.sigma_ratio();
        let increment = (ratio * ratio - 1.0).sqrt();
        let mut prev_sigma = self.params.init_sigma;

        let mut encoder = self.encoder("pyramid");
        for i in 0..(self.params.scales + 2) as usize {
            let sigma = prev_sigma * increment;
            log::debug!("blur with sigma {sigma}");
            let src = oct.get(i, OctaveKind::Gaussian)?;
            let dst = oct.get(i + 1, OctaveKind::Gaussian)?;
            self.encode_convolution(&mut encoder, octave, &src.buffer, &dst.buffer, sigma)?;
            prev_sigma *= ratio;

            let dog = oct.get(i, OctaveKind::Dog)?;
            let params = CombineParams {
                width,
                height,
                coef_a: 1.0,
                coef_b: -1.0,
            };
            encode_dispatch(
                &self.ctx.device,
                &mut encoder,
                self.kernels.get("combine")?,
                "combine",
                &[&dst.buffer, &src.buffer, &dog.buffer],
                bytemuck::bytes_of(&params),
                calc_size(width, height),
            );
        }

        if octave + 1 < self.registry.octave_count() {
            let next = self.registry.octave(octave + 1)?;
            let src = oct.get(self.params.scales as usize, OctaveKind::Gaussian)?;
            let dst = next.get(0, OctaveKind::Gaussian)?;
            let params = ShrinkParams {
                out_width: next.width,
                out_height: next.height,
                in_width: width,
                in_height: height,
                stride_x: 2,
                stride_y: 2,
                _pad0: 0,
                _pad1: 0,
            };
            encode_dispatch(
                &self.ctx.device,
                &mut encoder,
                self.kernels.get("shrink")?,
                "shrink",
                &[&src.buffer, &dst.buffer],
                bytemuck::bytes_of(&params),
                calc_size(next.width, next.height),
            );
        }
        self.ctx.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    /// Scans the inner DoG levels for extremum candidates. The record
    /// array and counter are sentinel-cleared first; the counter value is
    /// read back after every level so refinement and orientation can run
    /// on per-level index ranges.
    fn detect_octave(&self, octave: usize) -> Result<LevelRanges> {
        let oct = self.registry.octave(octave)?;
        let records = self.registry.named("keypoints")?;
        let counter = self.registry.named("counter")?;
        let capacity = self.params.keypoint_capacity as u32;

        self.ctx
            .queue
            .write_buffer(&records.buffer, 0, &self.sentinel);
        self.ctx
            .queue
            .write_buffer(&counter.buffer, 0, &0u32.to_le_bytes());

        let octsize = (1u32 << octave) as f32;
        let mut ranges = Vec::new();
        let mut start = 0u32;
        for level in 1..=self.params.scales as usize {
            let prev = oct.get(level - 1, OctaveKind::Dog)?;
            let cur = oct.get(level, OctaveKind::Dog)?;
            let next = oct.get(level + 1, OctaveKind::Dog)?;
            let params = MaxminParams {
                width: oct.width,
                height: oct.height,
                border_dist: self.params.border_dist,
                capacity,
                peak_thresh: self.params.peak_thresh,
                edge_thresh0: self.params.edge_thresh0,
                edge_thresh: self.params.edge_thresh,
                octsize,
                scale_index: level as f32,
                _pad0: 0,
                _pad1: 0,
                _pad2: 0,
            };
            let mut encoder = self.encoder("local_maxmin");
            encode_dispatch(
                &self.ctx.device,
                &mut encoder,
                self.kernels.get("local_maxmin")?,
                "local_maxmin",
                &[
                    &prev.buffer,
                    &cur.buffer,
                    &next.buffer,
                    &records.buffer,
                    &counter.buffer,
                ],
                bytemuck::bytes_of(&params),
                calc_size(oct.width, oct.height),
            );
            self.ctx.queue.submit(Some(encoder.finish()));

            let end = read_counter(&self.ctx, &counter.buffer)?;
            ranges.push((start.min(capacity), end.min(capacity)));
            start = end;
        }
        Ok(ranges)
    }

    /// Sub-pixel refinement of every candidate range.
    fn refine_octave(&self, octave: usize, ranges: &LevelRanges) -> Result<()> {
        let oct = self.registry.octave(octave)?;
        let records = self.registry.named("keypoints")?;

        let mut encoder = self.encoder("interp");
        let mut any = false;
        for (level, &(start, end)) in (1..).zip(ranges) {
            if end <= start {
                continue;
            }
            any = true;
            let prev = oct.get(level - 1, OctaveKind::Dog)?;
            let cur = oct.get(level, OctaveKind::Dog)?;
            let next = oct.get(level + 1, OctaveKind::Dog)?;
            let params = InterpParams {
                width: oct.width,
                height: oct.height,
                start,
                end,
                peak_thresh: self.params.peak_thresh,
                init_sigma: self.params.init_sigma,
                scales: self.params.scales as f32,
                moves: MOVE_BUDGET,
            };
            encode_dispatch(
                &self.ctx.device,
                &mut encoder,
                self.kernels.get("interp_keypoint")?,
                "interp_keypoint",
                &[
                    &prev.buffer,
                    &cur.buffer,
                    &next.buffer,
                    &records.buffer,
                ],
                bytemuck::bytes_of(&params),
                (calc_list_size(end - start), 1),
            );
        }
        if any {
            self.ctx.queue.submit(Some(encoder.finish()));
        }
        Ok(())
    }

    /// Gradient planes and orientation assignment per level. The planes
    /// are read back for the descriptor postprocess, every level of the
    /// octave, since refinement may shift a keypoint's nearest level.
    fn orient_octave(&self, octave: usize, ranges: &LevelRanges) -> Result<GradientPlanes> {
        let scales = self.params.scales as usize;
        let mut planes: GradientPlanes = vec![None; scales + 1];
        if ranges.iter().all(|&(start, end)| end <= start) {
            return Ok(planes);
        }

        let oct = self.registry.octave(octave)?;
        let records = self.registry.named("keypoints")?;
        let counter = self.registry.named("counter")?;
        let grad = oct.get(0, OctaveKind::Grad)?;
        let ori = oct.get(0, OctaveKind::Ori)?;

        for level in 1..=scales {
            let gauss = oct.get(level, OctaveKind::Gaussian)?;
            let mut encoder = self.encoder("orientation");
            let params = GradientParams {
                width: oct.width,
                height: oct.height,
                _pad0: 0,
                _pad1: 0,
            };
            encode_dispatch(
                &self.ctx.device,
                &mut encoder,
                self.kernels.get("compute_gradient_orientation")?,
                "compute_gradient_orientation",
                &[&gauss.buffer, &grad.buffer, &ori.buffer],
                bytemuck::bytes_of(&params),
                calc_size(oct.width, oct.height),
            );

            let (start, end) = ranges[level - 1];
            if end > start {
                let params = OrientationParams {
                    width: oct.width,
                    height: oct.height,
                    start,
                    end,
                    capacity: self.params.keypoint_capacity as u32,
                    _pad0: 0,
                    ori_sigma: self.params.ori_sigma,
                    peak_frac: self.params.ori_hist_thresh,
                };
                encode_dispatch(
                    &self.ctx.device,
                    &mut encoder,
                    self.kernels.get("orientation_assignment")?,
                    "orientation_assignment",
                    &[
                        &records.buffer,
                        &grad.buffer,
                        &ori.buffer,
                        &counter.buffer,
                    ],
                    bytemuck::bytes_of(&params),
                    (calc_list_size(end - start), 1),
                );
            }
            self.ctx.queue.submit(Some(encoder.finish()));

            let shape = (oct.height as usize, oct.width as usize);
            let grad_data = read_buffer_f32(&self.ctx, &grad.buffer, oct.pixels())?;
            let ori_data = read_buffer_f32(&self.ctx, &ori.buffer, oct.pixels())?;
            let grad_plane = Array2::from_shape_vec(shape, grad_data)
                .map_err(|e| Error::Gpu(format!("gradient plane shape: {e}")))?;
            let ori_plane = Array2::from_shape_vec(shape, ori_data)
                .map_err(|e| Error::Gpu(format!("orientation plane shape: {e}")))?;
            planes[level] = Some((grad_plane, ori_plane));
        }
        Ok(planes)
    }

    /// Reads back the oriented records, computes descriptors on the host
    /// and appends finished rows in input-image coordinates.
    fn collect_octave(
        &self,
        octave: usize,
        planes: &GradientPlanes,
        rows: &mut Vec<f32>,
    ) -> Result<usize> {
        let records_buf = self.registry.named("keypoints")?;
        let counter = self.registry.named("counter")?;
        let capacity = self.params.keypoint_capacity as u32;

        let raw_count = read_counter(&self.ctx, &counter.buffer)?;
        if raw_count > capacity {
            log::warn!(
                "keypoint capacity exceeded in octave {octave}: {raw_count} > {capacity}, excess dropped"
            );
        }
        let count = raw_count.min(capacity) as usize;
        if count == 0 {
            return Ok(0);
        }

        let data = read_buffer_f32(&self.ctx, &records_buf.buffer, count * 4)?;
        let octsize = (1u32 << octave) as f32;
        let scales = self.params.scales as f32;
        let init_sigma = self.params.init_sigma;
        let clip = self.params.desc_clip;

        let records: Vec<&[f32]> = data
            .chunks_exact(4)
            .filter(|record| !is_sentinel(record))
            .collect();

        let describe = |record: &&[f32]| -> Option<[f32; ROW_LEN]> {
            let sigma = record[2];
            let level = (scales * (sigma / init_sigma).log2())
                .round()
                .clamp(1.0, scales) as usize;
            let (grad, ori) = planes[level].as_ref()?;
            let descriptor = compute_descriptor(
                &grad.view(),
                &ori.view(),
                record[0],
                record[1],
                record[3],
                clip,
            );
            let kp = Keypoint::from_record(
                [record[0], record[1], record[2], record[3]],
                octsize,
            );
            let mut row = [0.0f32; ROW_LEN];
            row[0] = kp.x;
            row[1] = kp.y;
            row[2] = kp.sigma;
            row[3] = kp.angle;
            row[4..].copy_from_slice(&descriptor);
            Some(row)
        };

        #[cfg(feature = "rayon")]
        let finished: Vec<[f32; ROW_LEN]> = records.par_iter().filter_map(describe).collect();
        #[cfg(not(feature = "rayon"))]
        let finished: Vec<[f32; ROW_LEN]> = records.iter().filter_map(describe).collect();

        for row in &finished {
            rows.extend_from_slice(row);
        }
        Ok(finished.len())
    }

    /// Two-pass separable convolution through the octave's scratch plane,
    /// using the precomputed taps for `sigma`.
    fn encode_convolution(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        octave: usize,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        sigma: f32,
    ) -> Result<()> {
        let oct = self.registry.octave(octave)?;
        let entry = self
            .gaussians
            .get(sigma)
            .ok_or_else(|| Error::BufferMissing(format!("gaussian taps for sigma {sigma}")))?;
        let taps = self.registry.named(&entry.buffer_name)?;
        let tmp = oct.get(0, OctaveKind::Tmp)?;
        let params = ConvParams {
            width: oct.width,
            height: oct.height,
            ksize: entry.len as u32,
            _pad0: 0,
        };
        encode_dispatch(
            &self.ctx.device,
            encoder,
            self.kernels.get("horizontal_convolution")?,
            "horizontal_convolution",
            &[src, &tmp.buffer, &taps.buffer],
            bytemuck::bytes_of(&params),
            calc_size(oct.width, oct.height),
        );
        encode_dispatch(
            &self.ctx.device,
            encoder,
            self.kernels.get("vertical_convolution")?,
            "vertical_convolution",
            &[&tmp.buffer, dst, &taps.buffer],
            bytemuck::bytes_of(&params),
            calc_size(oct.width, oct.height),
        );
        Ok(())
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_octave_shapes_drop_last() {
        let shapes = octave_shapes(&ImageShape::new(128, 128), 5);
        assert_eq!(shapes, vec![(128, 128), (64, 64), (32, 32), (16, 16)]);
    }

    #[test]
    fn test_octave_shapes_rectangular() {
        let shapes = octave_shapes(&ImageShape::new(100, 40), 5);
        // 40 -> 20 -> 10: the 10-wide shape is dropped.
        assert_eq!(shapes, vec![(40, 100), (20, 50)]);
    }

    #[test]
    fn test_octave_shapes_too_small() {
        assert!(octave_shapes(&ImageShape::new(12, 12), 5).is_empty());
    }

    #[test]
    fn test_param_block_sizes_match_uniform_layout() {
        assert_eq!(std::mem::size_of::<ConvertParams>(), 16);
        assert_eq!(std::mem::size_of::<NormalizeParams>(), 32);
        assert_eq!(std::mem::size_of::<ConvParams>(), 16);
        assert_eq!(std::mem::size_of::<CombineParams>(), 16);
        assert_eq!(std::mem::size_of::<ShrinkParams>(), 32);
        assert_eq!(std::mem::size_of::<MaxminParams>(), 48);
        assert_eq!(std::mem::size_of::<InterpParams>(), 32);
        assert_eq!(std::mem::size_of::<OrientationParams>(), 32);
    }
}
