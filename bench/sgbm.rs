use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use cv_depthcam::frame::interleave_raw;
use cv_depthcam::prelude::*;
use cv_depthcam::sgbm::{Params, SemiGlobalMatcher};
use image::{GrayImage, Luma};

fn texture(width: u32, height: u32, seed: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let mut v = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663) ^ seed;
        v ^= v >> 13;
        v = v.wrapping_mul(0x5bd1_e995);
        Luma([(v >> 8) as u8])
    })
}

/// A 320x240 pair shifted by 8 pixels everywhere.
fn shifted_pair() -> (GrayImage, GrayImage) {
    let wide = texture(336, 240, 7);

    let left = GrayImage::from_fn(320, 240, |x, y| *wide.get_pixel(x + 8, y));
    let right = GrayImage::from_fn(320, 240, |x, y| *wide.get_pixel(x + 16, y));

    (left, right)
}

fn sgbm_bench(c: &mut Criterion) {
    let (left, right) = shifted_pair();

    // Build disparity alg
    let mut sgbm = SemiGlobalMatcher::new(Params::with_num_disparities(64));

    c.bench_function("sgbm 320x240 64 disparities", |b| {
        b.iter(|| sgbm.compute(black_box(&left), black_box(&right)))
    });
}

fn pipeline_bench(c: &mut Criterion) {
    let (left, right) = shifted_pair();

    let raw = RawFrame::new(
        interleave_raw(&left, &right),
        240,
        320,
        PixelFormat::Raw16,
        Duration::from_millis(0),
        0
    ).unwrap();
    let bgr = vec![128u8; 320 * 240 * 3];

    let mut pipeline = DepthPipeline::new(DisparityConfig::default(), FilterConfig::default()).unwrap();

    c.bench_function("depth pipeline 320x240", |b| {
        b.iter(|| pipeline.process(0, black_box(&raw), black_box(&bgr)))
    });
}

criterion_group!(benches, sgbm_bench, pipeline_bench);
criterion_main!(benches);
