use crate::error::{Error, Result};

/// Tuning parameters for the detection pipeline, frozen at plan construction.
///
/// The defaults reproduce the classic SIFT configuration on images
/// range-normalized to [0, 255].
#[derive(Debug, Clone)]
pub struct SiftParams {
    /// Number of DoG levels per octave usable for extrema detection (S).
    pub scales: u32,
    /// Target blur of the first Gaussian level (sigma zero).
    pub init_sigma: f32,
    /// When true the input is assumed to have been upsampled 2x beforehand,
    /// so the starting blur is 1.0 instead of 0.5.
    pub double_im_size: bool,
    /// Pixel margin ignored on all four sides of every octave.
    pub border_dist: u32,
    /// Minimum |DoG| for a refined keypoint. The detector pre-filters at
    /// 0.8 times this value.
    pub peak_thresh: f32,
    /// Hessian ratio threshold (det vs trace squared) for octave 0.
    pub edge_thresh0: f32,
    /// Hessian ratio threshold for octaves past the first.
    pub edge_thresh: f32,
    /// Fixed size of the device-side keypoint array. Candidates past this
    /// bound are dropped silently.
    pub keypoint_capacity: usize,
    /// Number of bins in the orientation histogram.
    pub ori_bins: u32,
    /// Gaussian window factor for orientation weighting (sigma multiplier).
    pub ori_sigma: f32,
    /// A histogram peak must reach this fraction of the global maximum to
    /// emit an additional orientation.
    pub ori_hist_thresh: f32,
    /// Descriptor grid width (grid x grid cells of `desc_ori_bins` bins).
    pub desc_grid: usize,
    /// Orientation bins per descriptor cell.
    pub desc_ori_bins: usize,
    /// Descriptor taps are clipped at this value between the two
    /// normalization passes.
    pub desc_clip: f32,
}

impl Default for SiftParams {
    fn default() -> Self {
        Self {
            scales: 3,
            init_sigma: 1.6,
            double_im_size: false,
            border_dist: 5,
            peak_thresh: 255.0 * 0.04 / 3.0,
            edge_thresh0: 0.08,
            edge_thresh: 0.06,
            keypoint_capacity: 10_000,
            ori_bins: 36,
            ori_sigma: 1.5,
            ori_hist_thresh: 0.8,
            desc_grid: 4,
            desc_ori_bins: 8,
            desc_clip: 0.2,
        }
    }
}

impl SiftParams {
    /// Ratio between the blur of two successive scale levels, 2^(1/S).
    pub fn sigma_ratio(&self) -> f32 {
        2.0_f32.powf(1.0 / self.scales as f32)
    }

    /// Blur assumed present in the input before any processing.
    pub fn initial_blur(&self) -> f32 {
        if self.double_im_size {
            1.0
        } else {
            0.5
        }
    }

    /// Number of floats in one descriptor (grid * grid * bins).
    pub fn descriptor_len(&self) -> usize {
        self.desc_grid * self.desc_grid * self.desc_ori_bins
    }

    pub fn validate(&self) -> Result<()> {
        if self.scales == 0 {
            return Err(Error::InvalidParameter(
                "scales must be at least 1".to_string(),
            ));
        }
        if !(self.init_sigma > 0.0) {
            return Err(Error::InvalidParameter(
                "init_sigma must be positive".to_string(),
            ));
        }
        if !(self.peak_thresh > 0.0) {
            return Err(Error::InvalidParameter(
                "peak_thresh must be positive".to_string(),
            ));
        }
        if self.border_dist < 2 {
            return Err(Error::InvalidParameter(
                "border_dist must be at least 2 for neighborhood scans".to_string(),
            ));
        }
        if self.keypoint_capacity == 0 {
            return Err(Error::InvalidParameter(
                "keypoint_capacity must be positive".to_string(),
            ));
        }
        if self.ori_bins < 4 {
            return Err(Error::InvalidParameter(
                "ori_bins must be at least 4".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let params = SiftParams::default();
        params.validate().unwrap();
        assert_eq!(params.scales, 3);
        assert_eq!(params.descriptor_len(), 128);
    }

    #[test]
    fn test_sigma_ratio() {
        let params = SiftParams::default();
        let r = params.sigma_ratio();
        assert!((r - 2.0_f32.powf(1.0 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_zero_scales() {
        let params = SiftParams {
            scales: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_initial_blur_depends_on_doubling() {
        let mut params = SiftParams::default();
        assert_eq!(params.initial_blur(), 0.5);
        params.double_im_size = true;
        assert_eq!(params.initial_blur(), 1.0);
    }
}
