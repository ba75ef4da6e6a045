//! Precomputed 1-D Gaussian filter taps.
//!
//! Taps are generated and normalized on the host (a device-side norm would
//! cost three extra kernel launches) and uploaded once per distinct sigma.

use std::collections::HashMap;

/// Builds the tap array for one sigma: length floor(8*sigma + 1), centered
/// at (len - 1)/2, normalized so the taps sum to 1.0 in f32.
pub fn gaussian_taps(sigma: f32) -> Vec<f32> {
    let len = (8.0 * sigma + 1.0).floor().max(1.0) as usize;
    let center = (len as f32 - 1.0) / 2.0;
    let mut taps: Vec<f32> = (0..len)
        .map(|i| {
            let x = (i as f32 - center) / sigma;
            (-x * x / 2.0).exp()
        })
        .collect();
    let sum: f32 = taps.iter().sum();
    for t in &mut taps {
        *t /= sum;
    }
    taps
}

/// Buffer name used for the taps of one sigma, shared with the registry.
pub fn taps_buffer_name(sigma: f32) -> String {
    format!("gaussian_{sigma}")
}

/// Host-side index of uploaded tap buffers, keyed by the sigma bit pattern
/// so that repeated requests for the same width share one device buffer.
#[derive(Default)]
pub struct GaussianTable {
    entries: HashMap<u32, TapEntry>,
}

pub struct TapEntry {
    pub buffer_name: String,
    pub len: usize,
}

impl GaussianTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sigma: f32) -> Option<&TapEntry> {
        self.entries.get(&sigma.to_bits())
    }

    /// Registers a sigma, returning the taps to upload when it is new.
    pub fn insert(&mut self, sigma: f32) -> Option<Vec<f32>> {
        if self.entries.contains_key(&sigma.to_bits()) {
            return None;
        }
        let taps = gaussian_taps(sigma);
        self.entries.insert(
            sigma.to_bits(),
            TapEntry {
                buffer_name: taps_buffer_name(sigma),
                len: taps.len(),
            },
        );
        Some(taps)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The distinct blur widths one plan needs: the optional pre-blur to reach
/// `init_sigma` from the assumed input blur, then the S + 2 incremental
/// widths sigma_i = r^i * init_sigma * sqrt(r^2 - 1).
pub fn required_sigmas(scales: u32, init_sigma: f32, initial_blur: f32) -> Vec<f32> {
    let mut sigmas = Vec::new();
    if init_sigma > initial_blur {
        sigmas.push((init_sigma * init_sigma - initial_blur * initial_blur).sqrt());
    }
    let ratio = 2.0_f32.powf(1.0 / scales as f32);
    let mut prev = init_sigma;
    for _ in 0..scales + 2 {
        sigmas.push(prev * (ratio * ratio - 1.0).sqrt());
        prev *= ratio;
    }
    sigmas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taps_length_and_sum() {
        for &sigma in &[0.8_f32, 1.2, 1.6, 2.5, 3.11] {
            let taps = gaussian_taps(sigma);
            assert_eq!(taps.len(), (8.0 * sigma + 1.0).floor() as usize);
            let sum: f32 = taps.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6, "sum={sum} for sigma={sigma}");
        }
    }

    #[test]
    fn test_taps_are_symmetric() {
        let taps = gaussian_taps(1.6);
        for i in 0..taps.len() / 2 {
            let j = taps.len() - 1 - i;
            assert!((taps[i] - taps[j]).abs() < 1e-7);
        }
    }

    #[test]
    fn test_table_shares_equal_sigmas() {
        let mut table = GaussianTable::new();
        assert!(table.insert(1.6).is_some());
        assert!(table.insert(1.6).is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(1.6).unwrap().len, 13);
    }

    #[test]
    fn test_required_sigmas_default_config() {
        // init_sigma 1.6 > initial blur 0.5, so one pre-blur plus S + 2
        // incremental widths.
        let sigmas = required_sigmas(3, 1.6, 0.5);
        assert_eq!(sigmas.len(), 6);
        let pre = (1.6_f32 * 1.6 - 0.25).sqrt();
        assert!((sigmas[0] - pre).abs() < 1e-6);
        // Incremental widths grow by the ratio each level.
        let r = 2.0_f32.powf(1.0 / 3.0);
        assert!((sigmas[2] / sigmas[1] - r).abs() < 1e-5);
    }
}
