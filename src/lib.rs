//! # sift-gpu
//!
//! GPU-accelerated SIFT keypoint detection.
//!
//! The pipeline builds a Gaussian / Difference-of-Gaussians pyramid on a
//! compute device, detects scale-space extrema, refines them sub-pixel,
//! assigns dominant gradient orientations and attaches 128-float
//! appearance descriptors. The device work runs through WebGPU compute
//! shaders; CPU reference implementations of the kernels live in
//! [`reference`] and back the correctness tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ndarray::Array2;
//! use sift_gpu::prelude::*;
//!
//! # fn main() -> sift_gpu::error::Result<()> {
//! let image = Array2::<f32>::zeros((480, 640));
//! let input = ImageInput::F32(image.view());
//! let mut plan = SiftPlan::for_image(&input, SiftParams::default(), DevicePreference::Gpu, false)?;
//! // Rows are (x, y, sigma, angle, d0..d127).
//! let keypoints = plan.keypoints(&input)?;
//! # let _ = keypoints;
//! # Ok(())
//! # }
//! ```

pub mod descriptor;
pub mod error;
pub mod gaussian;
pub mod gpu;
pub mod image;
pub mod keypoint;
pub mod params;
pub mod plan;
pub mod reference;

pub mod prelude {
    //! Convenience re-exports of the common entry points.
    pub use crate::error::{Error, Result};
    pub use crate::gpu::{DevicePreference, GpuContext};
    pub use crate::image::{ImageInput, ImageShape, PixelType};
    pub use crate::keypoint::Keypoint;
    pub use crate::params::SiftParams;
    pub use crate::plan::SiftPlan;
}
