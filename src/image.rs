use ndarray::{Array2, ArrayView2, ArrayView3};
use num_traits::ToPrimitive;

use crate::error::{Error, Result};

/// Pixel storage type of the input raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    F32,
    U8,
    U16,
    S32,
    S64,
}

impl PixelType {
    /// Size of one sample in bytes, as stored in the raw upload buffer.
    pub fn sample_bytes(self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
            PixelType::F32 | PixelType::S32 => 4,
            PixelType::S64 => 8,
        }
    }
}

/// Shape of the input raster. Three-channel images are only accepted for u8
/// data and are collapsed to luminance on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            channels: 1,
        }
    }

    pub fn new_rgb(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            channels: 3,
        }
    }

    /// Number of pixels in the working (single channel) image.
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }

    pub fn validate(&self, pixel_type: PixelType) -> Result<()> {
        if self.height == 0 || self.width == 0 {
            return Err(Error::InvalidShape(format!(
                "empty image {}x{}",
                self.height, self.width
            )));
        }
        match self.channels {
            1 => Ok(()),
            3 if pixel_type == PixelType::U8 => Ok(()),
            3 => Err(Error::UnsupportedPixelType(format!(
                "3-channel input requires u8 pixels, got {pixel_type:?}"
            ))),
            n => Err(Error::InvalidShape(format!(
                "unable to process image with {n} channels"
            ))),
        }
    }
}

/// Borrowed view of one input image in any of the accepted pixel types.
#[derive(Debug, Clone)]
pub enum ImageInput<'a> {
    F32(ArrayView2<'a, f32>),
    U8(ArrayView2<'a, u8>),
    Rgb(ArrayView3<'a, u8>),
    U16(ArrayView2<'a, u16>),
    S32(ArrayView2<'a, i32>),
    S64(ArrayView2<'a, i64>),
}

impl<'a> ImageInput<'a> {
    pub fn shape(&self) -> ImageShape {
        match self {
            ImageInput::F32(a) => ImageShape::new(a.nrows(), a.ncols()),
            ImageInput::U8(a) => ImageShape::new(a.nrows(), a.ncols()),
            ImageInput::U16(a) => ImageShape::new(a.nrows(), a.ncols()),
            ImageInput::S32(a) => ImageShape::new(a.nrows(), a.ncols()),
            ImageInput::S64(a) => ImageShape::new(a.nrows(), a.ncols()),
            ImageInput::Rgb(a) => {
                let d = a.dim();
                // Report the actual channel count; validation rejects
                // anything other than three.
                ImageShape {
                    height: d.0,
                    width: d.1,
                    channels: d.2,
                }
            }
        }
    }

    pub fn pixel_type(&self) -> PixelType {
        match self {
            ImageInput::F32(_) => PixelType::F32,
            ImageInput::U8(_) | ImageInput::Rgb(_) => PixelType::U8,
            ImageInput::U16(_) => PixelType::U16,
            ImageInput::S32(_) => PixelType::S32,
            ImageInput::S64(_) => PixelType::S64,
        }
    }

    /// Raw little-endian sample bytes in row-major order, padded with zeros
    /// to a multiple of four so the result can be copied into a word buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        fn collect<T: Copy, F: Fn(T, &mut Vec<u8>)>(
            it: impl Iterator<Item = T>,
            push: F,
        ) -> Vec<u8> {
            let mut out = Vec::new();
            for v in it {
                push(v, &mut out);
            }
            while out.len() % 4 != 0 {
                out.push(0);
            }
            out
        }
        match self {
            ImageInput::F32(a) => collect(a.iter().copied(), |v, out| {
                out.extend_from_slice(&v.to_le_bytes())
            }),
            ImageInput::U8(a) => collect(a.iter().copied(), |v, out| out.push(v)),
            ImageInput::Rgb(a) => collect(a.iter().copied(), |v, out| out.push(v)),
            ImageInput::U16(a) => collect(a.iter().copied(), |v, out| {
                out.extend_from_slice(&v.to_le_bytes())
            }),
            ImageInput::S32(a) => collect(a.iter().copied(), |v, out| {
                out.extend_from_slice(&v.to_le_bytes())
            }),
            ImageInput::S64(a) => collect(a.iter().copied(), |v, out| {
                out.extend_from_slice(&v.to_le_bytes())
            }),
        }
    }

    /// Lossy conversion to a single-channel float image, collapsing RGB to
    /// luminance the same way the device kernel does.
    pub fn to_f32_array(&self) -> Array2<f32> {
        fn cast<T: ToPrimitive + Copy>(a: &ArrayView2<'_, T>) -> Array2<f32> {
            a.map(|v| v.to_f32().unwrap_or(0.0))
        }
        match self {
            ImageInput::F32(a) => a.to_owned(),
            ImageInput::U8(a) => cast(a),
            ImageInput::U16(a) => cast(a),
            ImageInput::S32(a) => cast(a),
            ImageInput::S64(a) => cast(a),
            ImageInput::Rgb(a) => {
                let (h, w, _) = a.dim();
                Array2::from_shape_fn((h, w), |(r, c)| {
                    0.299 * f32::from(a[(r, c, 0)])
                        + 0.587 * f32::from(a[(r, c, 1)])
                        + 0.114 * f32::from(a[(r, c, 2)])
                })
            }
        }
    }
}
