//! CPU reference implementations of the device kernels.
//!
//! These exist to pin down the semantics of the compute shaders: the
//! correctness tests run both sides on the same data and compare within a
//! small tolerance. The loops favor clarity over speed.

use ndarray::Array2;

fn reflect(p: i32, n: i32) -> usize {
    let mut q = p;
    if q < 0 {
        q = -q;
    }
    if q > n - 1 {
        q = 2 * (n - 1) - q;
    }
    q.clamp(0, n - 1) as usize
}

/// Separable convolution with reflected borders, horizontal pass then
/// vertical pass, matching the two device passes.
pub fn convolve_separable(input: &Array2<f32>, taps: &[f32]) -> Array2<f32> {
    let (h, w) = input.dim();
    let half = (taps.len() as i32 - 1) / 2;
    let mut tmp = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, tap) in taps.iter().enumerate() {
                let col = reflect(x as i32 + k as i32 - half, w as i32);
                acc += tap * input[(y, col)];
            }
            tmp[(y, x)] = acc;
        }
    }
    let mut out = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, tap) in taps.iter().enumerate() {
                let row = reflect(y as i32 + k as i32 - half, h as i32);
                acc += tap * tmp[(row, x)];
            }
            out[(y, x)] = acc;
        }
    }
    out
}

/// Gradient magnitude and orientation with centered differences in the
/// interior and one-sided differences on the borders.
pub fn gradient(input: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
    let (h, w) = input.dim();
    let mut mag = Array2::<f32>::zeros((h, w));
    let mut ori = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let gx = if x == 0 {
                input[(y, 1)] - input[(y, 0)]
            } else if x == w - 1 {
                input[(y, x)] - input[(y, x - 1)]
            } else {
                0.5 * (input[(y, x + 1)] - input[(y, x - 1)])
            };
            let gy = if y == 0 {
                input[(1, x)] - input[(0, x)]
            } else if y == h - 1 {
                input[(y, x)] - input[(y - 1, x)]
            } else {
                0.5 * (input[(y + 1, x)] - input[(y - 1, x)])
            };
            mag[(y, x)] = (gx * gx + gy * gy).sqrt();
            ori[(y, x)] = gy.atan2(gx);
        }
    }
    (mag, ori)
}

/// Parameters shared by the reference detector and refiner.
#[derive(Debug, Clone, Copy)]
pub struct DetectConfig {
    pub border_dist: usize,
    pub peak_thresh: f32,
    pub octsize: f32,
    pub edge_thresh0: f32,
    pub edge_thresh: f32,
}

/// Scans one DoG level for strict 3x3x3 extrema passing the edge-ratio
/// test. Records are (value, row, col, scale_index) in scan order.
pub fn local_maxmin(
    dog_prev: &Array2<f32>,
    dog: &Array2<f32>,
    dog_next: &Array2<f32>,
    config: &DetectConfig,
    scale_index: f32,
) -> Vec<[f32; 4]> {
    let (h, w) = dog.dim();
    let b = config.border_dist;
    let mut out = Vec::new();
    for y in b..h - b {
        for x in b..w - b {
            let v = dog[(y, x)];
            if v.abs() <= 0.8 * config.peak_thresh {
                continue;
            }
            let mut is_max = v > 0.0;
            let mut is_min = !is_max;
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    let yy = (y as i32 + dy) as usize;
                    let xx = (x as i32 + dx) as usize;
                    let p = dog_prev[(yy, xx)];
                    let n = dog_next[(yy, xx)];
                    if p >= v || n >= v {
                        is_max = false;
                    }
                    if p <= v || n <= v {
                        is_min = false;
                    }
                    if dx != 0 || dy != 0 {
                        let c = dog[(yy, xx)];
                        if c >= v {
                            is_max = false;
                        }
                        if c <= v {
                            is_min = false;
                        }
                    }
                }
            }
            if !is_max && !is_min {
                continue;
            }
            let h00 = dog[(y - 1, x)] - 2.0 * v + dog[(y + 1, x)];
            let h11 = dog[(y, x - 1)] - 2.0 * v + dog[(y, x + 1)];
            let h01 = ((dog[(y + 1, x + 1)] - dog[(y + 1, x - 1)])
                - (dog[(y - 1, x + 1)] - dog[(y - 1, x - 1)]))
                * 0.25;
            let det = h00 * h11 - h01 * h01;
            let trace = h00 + h11;
            let thr = if config.octsize <= 1.0 {
                config.edge_thresh0
            } else {
                config.edge_thresh
            };
            if det < thr * trace * trace {
                continue;
            }
            out.push([v, y as f32, x as f32, scale_index]);
        }
    }
    out
}

/// Quadratic fit of the 3-D DoG neighborhood at (r, c). Returns the offset
/// (ds, dr, dc) and the interpolated peak value, or None for a singular
/// Hessian.
pub fn fit_quadratic(
    dog_prev: &Array2<f32>,
    dog: &Array2<f32>,
    dog_next: &Array2<f32>,
    r: usize,
    c: usize,
) -> Option<([f32; 3], f32)> {
    let center = dog[(r, c)];
    let gs = 0.5 * (dog_next[(r, c)] - dog_prev[(r, c)]);
    let gr = 0.5 * (dog[(r + 1, c)] - dog[(r - 1, c)]);
    let gc = 0.5 * (dog[(r, c + 1)] - dog[(r, c - 1)]);

    let hss = dog_prev[(r, c)] - 2.0 * center + dog_next[(r, c)];
    let hrr = dog[(r - 1, c)] - 2.0 * center + dog[(r + 1, c)];
    let hcc = dog[(r, c - 1)] - 2.0 * center + dog[(r, c + 1)];
    let hsr = 0.25
        * ((dog_next[(r + 1, c)] - dog_next[(r - 1, c)])
            - (dog_prev[(r + 1, c)] - dog_prev[(r - 1, c)]));
    let hsc = 0.25
        * ((dog_next[(r, c + 1)] - dog_next[(r, c - 1)])
            - (dog_prev[(r, c + 1)] - dog_prev[(r, c - 1)]));
    let hrc = 0.25
        * ((dog[(r + 1, c + 1)] - dog[(r + 1, c - 1)])
            - (dog[(r - 1, c + 1)] - dog[(r - 1, c - 1)]));

    let det = hss * (hrr * hcc - hrc * hrc) - hsr * (hsr * hcc - hrc * hsc)
        + hsc * (hsr * hrc - hrr * hsc);
    if det.abs() < 1e-10 {
        return None;
    }
    let a00 = (hrr * hcc - hrc * hrc) / det;
    let a01 = (hsc * hrc - hsr * hcc) / det;
    let a02 = (hsr * hrc - hsc * hrr) / det;
    let a11 = (hss * hcc - hsc * hsc) / det;
    let a12 = (hsc * hsr - hss * hrc) / det;
    let a22 = (hss * hrr - hsr * hsr) / det;
    let ds = -(a00 * gs + a01 * gr + a02 * gc);
    let dr = -(a01 * gs + a11 * gr + a12 * gc);
    let dc = -(a02 * gs + a12 * gr + a22 * gc);
    let peakval = center + 0.5 * (ds * gs + dr * gr + dc * gc);
    Some(([ds, dr, dc], peakval))
}

/// Reference sub-pixel refinement with the bounded re-centering loop.
/// Returns the refined record or None when the candidate is rejected.
#[allow(clippy::too_many_arguments)]
pub fn interp_keypoint(
    dog_prev: &Array2<f32>,
    dog: &Array2<f32>,
    dog_next: &Array2<f32>,
    scale_index: f32,
    row: usize,
    col: usize,
    moves: u32,
    peak_thresh: f32,
    init_sigma: f32,
    scales: f32,
) -> Option<[f32; 4]> {
    let (h, w) = dog.dim();
    let mut r = row as i32;
    let mut c = col as i32;
    let mut moves_remain = moves;
    loop {
        let ([ds, dr, dc], peakval) =
            fit_quadratic(dog_prev, dog, dog_next, r as usize, c as usize)?;
        let mut newr = r;
        let mut newc = c;
        if dr > 0.6 && r < h as i32 - 3 {
            newr = r + 1;
        } else if dr < -0.6 && r > 3 {
            newr = r - 1;
        }
        if dc > 0.6 && c < w as i32 - 3 {
            newc = c + 1;
        } else if dc < -0.6 && c > 3 {
            newc = c - 1;
        }
        if moves_remain > 0 && (newr != r || newc != c) {
            r = newr;
            c = newc;
            moves_remain -= 1;
            continue;
        }
        if ds.abs() < 1.5 && dr.abs() < 1.5 && dc.abs() < 1.5 && peakval.abs() > peak_thresh {
            let sigma = init_sigma * ((scale_index + ds) / scales).exp2();
            return Some([peakval, r as f32 + dr, c as f32 + dc, sigma]);
        }
        return None;
    }
}

/// Minimum and maximum of a float slice, the host analogue of the device
/// reduction.
pub fn min_max(values: &[f32]) -> (f32, f32) {
    values.iter().fold((f32::MAX, f32::MIN), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::gaussian_taps;
    use ndarray::arr2;

    #[test]
    fn test_convolution_preserves_constant_image() {
        let input = Array2::from_elem((9, 7), 5.0_f32);
        let out = convolve_separable(&input, &gaussian_taps(1.2));
        for &v in out.iter() {
            assert!((v - 5.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_convolution_matches_naive_interior() {
        // A 3-tap box filter applied to a ramp keeps the ramp in the
        // interior.
        let input = Array2::from_shape_fn((6, 8), |(_, x)| x as f32);
        let taps = [1.0 / 3.0; 3];
        let out = convolve_separable(&input, &taps);
        for y in 1..5 {
            for x in 1..7 {
                assert!((out[(y, x)] - x as f32).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_gradient_of_ramp() {
        let input = Array2::from_shape_fn((5, 5), |(_, x)| 2.0 * x as f32);
        let (mag, ori) = gradient(&input);
        // Interior: gx = 2, gy = 0.
        assert!((mag[(2, 2)] - 2.0).abs() < 1e-6);
        assert!(ori[(2, 2)].abs() < 1e-6);
    }

    #[test]
    fn test_local_maxmin_finds_isolated_peak() {
        let mut cur = Array2::<f32>::zeros((13, 13));
        cur[(6, 6)] = 10.0;
        let prev = Array2::<f32>::zeros((13, 13));
        let next = Array2::<f32>::zeros((13, 13));
        let config = DetectConfig {
            border_dist: 2,
            peak_thresh: 1.0,
            octsize: 1.0,
            edge_thresh0: 0.08,
            edge_thresh: 0.06,
        };
        let records = local_maxmin(&prev, &cur, &next, &config, 1.0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0][1], 6.0);
        assert_eq!(records[0][2], 6.0);
    }

    #[test]
    fn test_ridge_is_edge_rejected() {
        // A ridge has one near-zero principal curvature, so the Hessian
        // determinant falls below the ratio threshold.
        let mut cur = Array2::<f32>::zeros((13, 13));
        cur[(6, 5)] = 9.99;
        cur[(6, 7)] = 9.99;
        cur[(6, 6)] = 10.0;
        let prev = Array2::<f32>::zeros((13, 13));
        let next = Array2::<f32>::zeros((13, 13));
        let config = DetectConfig {
            border_dist: 2,
            peak_thresh: 1.0,
            octsize: 1.0,
            edge_thresh0: 0.08,
            edge_thresh: 0.06,
        };
        let records = local_maxmin(&prev, &cur, &next, &config, 1.0);
        assert!(records.is_empty());
    }

    #[test]
    fn test_fit_quadratic_centered_parabola() {
        // Symmetric bump: the fit should stay at the center.
        let shape = (7, 7);
        let bump = |r: usize, c: usize| -> f32 {
            let dy = r as f32 - 3.0;
            let dx = c as f32 - 3.0;
            10.0 - dy * dy - dx * dx
        };
        let cur = Array2::from_shape_fn(shape, |(r, c)| bump(r, c));
        let prev = cur.mapv(|v| v - 1.0);
        let next = cur.mapv(|v| v - 1.0);
        let ([ds, dr, dc], peak) = fit_quadratic(&prev, &cur, &next, 3, 3).unwrap();
        assert!(dr.abs() < 1e-4);
        assert!(dc.abs() < 1e-4);
        assert!(ds.abs() < 1e-4);
        assert!((peak - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_min_max() {
        let (lo, hi) = min_max(&[3.0, -1.0, 7.5, 0.0]);
        assert_eq!(lo, -1.0);
        assert_eq!(hi, 7.5);
    }

    #[test]
    fn test_reflect_indexing() {
        let input = arr2(&[[1.0_f32, 2.0, 3.0]]);
        // Reflect without duplicating the edge: index -1 maps to 1.
        let taps = [0.5_f32, 0.0, 0.5];
        let out = convolve_separable(&input, &taps);
        // At x = 0: 0.5 * input[1] + 0.5 * input[1] = 2.0.
        assert!((out[(0, 0)] - 2.0).abs() < 1e-6);
    }
}
