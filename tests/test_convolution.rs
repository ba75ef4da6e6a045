//! GPU separable convolution and gradient kernels against the CPU
//! reference implementations.

mod common;

use common::*;
use ndarray::Array2;
use sift_gpu::gaussian::gaussian_taps;
use sift_gpu::gpu::{calc_size, encode_dispatch, read_buffer_f32, KernelBundle};
use sift_gpu::reference;

fn random_image(height: usize, width: usize, seed: u64) -> Array2<f32> {
    let mut rng = XorShift::new(seed);
    Array2::from_shape_fn((height, width), |_| rng.next_f32())
}

#[test]
fn test_separable_convolution_matches_reference() {
    let Some(ctx) = try_context() else { return };
    let kernels = KernelBundle::new(&ctx.device).unwrap();

    let (height, width) = (14usize, 15usize);
    let image = random_image(height, width, 7);
    let taps = gaussian_taps(1.8);

    let input = storage_from_f32(&ctx, "input", image.as_slice().unwrap());
    let tmp = storage_empty_f32(&ctx, "tmp", height * width);
    let output = storage_empty_f32(&ctx, "output", height * width);
    let taps_buf = storage_from_f32(&ctx, "taps", &taps);

    let params = ConvParams {
        width: width as u32,
        height: height as u32,
        ksize: taps.len() as u32,
        _pad0: 0,
    };
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    encode_dispatch(
        &ctx.device,
        &mut encoder,
        kernels.get("horizontal_convolution").unwrap(),
        "horizontal_convolution",
        &[&input, &tmp, &taps_buf],
        bytemuck::bytes_of(&params),
        calc_size(width as u32, height as u32),
    );
    encode_dispatch(
        &ctx.device,
        &mut encoder,
        kernels.get("vertical_convolution").unwrap(),
        "vertical_convolution",
        &[&tmp, &output, &taps_buf],
        bytemuck::bytes_of(&params),
        calc_size(width as u32, height as u32),
    );
    ctx.queue.submit(Some(encoder.finish()));

    let gpu = read_buffer_f32(&ctx, &output, height * width).unwrap();
    let expected = reference::convolve_separable(&image, &taps);

    let mut max_err = 0.0f32;
    for (got, want) in gpu.iter().zip(expected.iter()) {
        max_err = max_err.max((got - want).abs());
    }
    assert!(max_err < 1e-4, "max abs error {max_err}");
}

#[test]
fn test_even_length_taps_match_reference() {
    let Some(ctx) = try_context() else { return };
    let kernels = KernelBundle::new(&ctx.device).unwrap();

    // Sigma picked so floor(8 * sigma + 1) is even.
    let (height, width) = (20usize, 17usize);
    let image = random_image(height, width, 11);
    let taps = gaussian_taps(1.239);
    assert_eq!(taps.len() % 2, 0);

    let input = storage_from_f32(&ctx, "input", image.as_slice().unwrap());
    let tmp = storage_empty_f32(&ctx, "tmp", height * width);
    let output = storage_empty_f32(&ctx, "output", height * width);
    let taps_buf = storage_from_f32(&ctx, "taps", &taps);

    let params = ConvParams {
        width: width as u32,
        height: height as u32,
        ksize: taps.len() as u32,
        _pad0: 0,
    };
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    encode_dispatch(
        &ctx.device,
        &mut encoder,
        kernels.get("horizontal_convolution").unwrap(),
        "horizontal_convolution",
        &[&input, &tmp, &taps_buf],
        bytemuck::bytes_of(&params),
        calc_size(width as u32, height as u32),
    );
    encode_dispatch(
        &ctx.device,
        &mut encoder,
        kernels.get("vertical_convolution").unwrap(),
        "vertical_convolution",
        &[&tmp, &output, &taps_buf],
        bytemuck::bytes_of(&params),
        calc_size(width as u32, height as u32),
    );
    ctx.queue.submit(Some(encoder.finish()));

    let gpu = read_buffer_f32(&ctx, &output, height * width).unwrap();
    let expected = reference::convolve_separable(&image, &taps);
    for (got, want) in gpu.iter().zip(expected.iter()) {
        assert!((got - want).abs() < 1e-4);
    }
}

#[test]
fn test_gradient_orientation_matches_reference() {
    let Some(ctx) = try_context() else { return };
    let kernels = KernelBundle::new(&ctx.device).unwrap();

    let (height, width) = (14usize, 15usize);
    let image = random_image(height, width, 21);

    let input = storage_from_f32(&ctx, "input", image.as_slice().unwrap());
    let grad = storage_empty_f32(&ctx, "grad", height * width);
    let ori = storage_empty_f32(&ctx, "ori", height * width);

    let params = GradientParams {
        width: width as u32,
        height: height as u32,
        _pad0: 0,
        _pad1: 0,
    };
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    encode_dispatch(
        &ctx.device,
        &mut encoder,
        kernels.get("compute_gradient_orientation").unwrap(),
        "compute_gradient_orientation",
        &[&input, &grad, &ori],
        bytemuck::bytes_of(&params),
        calc_size(width as u32, height as u32),
    );
    ctx.queue.submit(Some(encoder.finish()));

    let gpu_grad = read_buffer_f32(&ctx, &grad, height * width).unwrap();
    let gpu_ori = read_buffer_f32(&ctx, &ori, height * width).unwrap();
    let (ref_grad, ref_ori) = reference::gradient(&image);

    let mut delta_norm = 0.0f32;
    let mut delta_ori = 0.0f32;
    for i in 0..height * width {
        delta_norm = delta_norm.max((gpu_grad[i] - ref_grad.as_slice().unwrap()[i]).abs());
        delta_ori = delta_ori.max((gpu_ori[i] - ref_ori.as_slice().unwrap()[i]).abs());
    }
    assert!(delta_norm < 1e-4, "delta_norm={delta_norm}");
    assert!(delta_ori < 1e-4, "delta_ori={delta_ori}");
}
