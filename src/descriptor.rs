//! Appearance descriptors, computed on the host from the read-back
//! gradient planes as a postprocess on the oriented keypoint array.

use ndarray::ArrayView2;

/// Descriptor length: a 4x4 grid of 8-bin orientation histograms.
pub const DESCRIPTOR_LEN: usize = 128;

const GRID: usize = 4;
const ORI_BINS: usize = 8;
const PATCH: i32 = 16;
const TWO_PI: f32 = std::f32::consts::TAU;

/// Builds the 128-float descriptor for one oriented keypoint.
///
/// A 16x16 gradient patch is rotated by the negated keypoint angle around
/// the sub-pixel location and distributed into the cell histograms with
/// trilinear weighting, then L2-normalized, clipped at `clip` and
/// normalized again.
pub fn compute_descriptor(
    grad: &ArrayView2<'_, f32>,
    ori: &ArrayView2<'_, f32>,
    x: f32,
    y: f32,
    angle: f32,
    clip: f32,
) -> [f32; DESCRIPTOR_LEN] {
    let (h, w) = grad.dim();
    let cos_t = angle.cos();
    let sin_t = angle.sin();
    let mut hist = [0.0f32; DESCRIPTOR_LEN];

    let half = PATCH / 2;
    for dv in -half..half {
        for du in -half..half {
            let u = du as f32 + 0.5;
            let v = dv as f32 + 0.5;
            // Rotate the sampling offset into image coordinates.
            let sx = x + u * cos_t - v * sin_t;
            let sy = y + u * sin_t + v * cos_t;
            let px = sx.round() as i32;
            let py = sy.round() as i32;
            if px < 0 || px >= w as i32 || py < 0 || py >= h as i32 {
                continue;
            }
            let mag = grad[(py as usize, px as usize)];
            let mut rel = ori[(py as usize, px as usize)] - angle;
            while rel < 0.0 {
                rel += TWO_PI;
            }
            while rel >= TWO_PI {
                rel -= TWO_PI;
            }

            // Continuous bin coordinates: cells of 4 pixels, orientation
            // bins of 2*pi/8.
            let rbin = v / 4.0 + 1.5;
            let cbin = u / 4.0 + 1.5;
            let obin = rel * ORI_BINS as f32 / TWO_PI;

            let r0 = rbin.floor();
            let c0 = cbin.floor();
            let o0 = obin.floor();
            let dr = rbin - r0;
            let dc = cbin - c0;
            let dob = obin - o0;

            for (ri, rw) in [(r0 as i32, 1.0 - dr), (r0 as i32 + 1, dr)] {
                if ri < 0 || ri >= GRID as i32 {
                    continue;
                }
                for (ci, cw) in [(c0 as i32, 1.0 - dc), (c0 as i32 + 1, dc)] {
                    if ci < 0 || ci >= GRID as i32 {
                        continue;
                    }
                    for (oi, ow) in [(o0 as i32, 1.0 - dob), (o0 as i32 + 1, dob)] {
                        let ob = (oi as usize) % ORI_BINS;
                        let idx = (ri as usize * GRID + ci as usize) * ORI_BINS + ob;
                        hist[idx] += mag * rw * cw * ow;
                    }
                }
            }
        }
    }

    normalize(&mut hist);
    for v in &mut hist {
        *v = v.min(clip);
    }
    normalize(&mut hist);
    hist
}

fn normalize(hist: &mut [f32; DESCRIPTOR_LEN]) {
    let norm: f32 = hist.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in hist.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn textured_planes(h: usize, w: usize) -> (Array2<f32>, Array2<f32>) {
        let grad = Array2::from_shape_fn((h, w), |(y, x)| {
            1.0 + ((x * 31 + y * 17) % 13) as f32 / 13.0
        });
        let ori = Array2::from_shape_fn((h, w), |(y, x)| {
            ((x * 7 + y * 3) % 11) as f32 / 11.0 * (TWO_PI - 1e-3) - std::f32::consts::PI
        });
        (grad, ori)
    }

    #[test]
    fn test_descriptor_norm_and_clip() {
        let (grad, ori) = textured_planes(64, 64);
        let desc = compute_descriptor(&grad.view(), &ori.view(), 32.0, 32.0, 0.7, 0.2);
        let norm: f32 = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!(norm <= 1.0 + 1e-5, "norm={norm}");
        assert!(norm > 0.5, "descriptor should not be empty, norm={norm}");
        assert!(desc.iter().all(|&v| v >= 0.0));
        // Clipping happens before the final normalization, so no tap can
        // dominate: the largest tap is bounded by clip / post-clip norm.
        let max = desc.iter().cloned().fold(0.0f32, f32::max);
        assert!(max < 1.0, "max tap {max}");
    }

    #[test]
    fn test_descriptor_zero_gradient() {
        let grad = Array2::<f32>::zeros((32, 32));
        let ori = Array2::<f32>::zeros((32, 32));
        let desc = compute_descriptor(&grad.view(), &ori.view(), 16.0, 16.0, 0.0, 0.2);
        assert!(desc.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_descriptor_rotation_changes_layout() {
        let (grad, ori) = textured_planes(64, 64);
        let a = compute_descriptor(&grad.view(), &ori.view(), 32.0, 32.0, 0.0, 0.2);
        let b = compute_descriptor(&grad.view(), &ori.view(), 32.0, 32.0, 1.5, 0.2);
        let diff: f32 = a.iter().zip(&b).map(|(x, y)| (x - y).abs()).sum();
        assert!(diff > 0.1, "rotation should change the descriptor");
    }
}
