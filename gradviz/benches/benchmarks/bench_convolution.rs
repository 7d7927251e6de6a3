use criterion::{criterion_group, Criterion};
use lazy_static::lazy_static;
use ndarray::{Array4, ArrayD};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::time::Duration;

use gradviz::{
    operators::ConvAttributes,
    providers::{NaiveProvider, ParNaiveProvider, Provider},
};

lazy_static! {
    static ref THREAD_POOL_1: ThreadPool = ThreadPoolBuilder::new()
        .num_threads(1)
        .build()
        .expect("Unable to create ThreadPool");
    static ref THREAD_POOL_8: ThreadPool = ThreadPoolBuilder::new()
        .num_threads(8)
        .build()
        .expect("Unable to create ThreadPool");
}

fn input() -> ArrayD<f32> {
    Array4::from_shape_fn((1, 64, 56, 56), |(_, c, h, w)| {
        ((c * 13 + h * 7 + w * 3) % 17) as f32 / 17.0 - 0.5
    })
    .into_dyn()
}

fn weights() -> Array4<f32> {
    Array4::from_shape_fn((64, 64, 3, 3), |(f, c, i, j)| {
        ((f * 11 + c * 5 + i * 3 + j) % 13) as f32 / 13.0 - 0.5
    })
}

fn attrs() -> ConvAttributes {
    ConvAttributes::new([1, 1], 1, [3, 3], [1, 1, 1, 1], [1, 1])
}

fn conv_forward_naive() {
    let y = NaiveProvider::conv(&THREAD_POOL_1, &input(), &weights(), None, &attrs()).unwrap();
    assert_eq!(y.shape(), &[1, 64, 56, 56]);
}

fn conv_forward_parallel() {
    let y = ParNaiveProvider::conv(&THREAD_POOL_8, &input(), &weights(), None, &attrs()).unwrap();
    assert_eq!(y.shape(), &[1, 64, 56, 56]);
}

fn conv_input_grad_naive() {
    let grad = input();
    let dx = NaiveProvider::conv_input_grad(
        &THREAD_POOL_1,
        &grad,
        &weights(),
        &attrs(),
        &[1, 64, 56, 56],
    )
    .unwrap();
    assert_eq!(dx.shape(), &[1, 64, 56, 56]);
}

fn conv_input_grad_parallel() {
    let grad = input();
    let dx = ParNaiveProvider::conv_input_grad(
        &THREAD_POOL_8,
        &grad,
        &weights(),
        &attrs(),
        &[1, 64, 56, 56],
    )
    .unwrap();
    assert_eq!(dx.shape(), &[1, 64, 56, 56]);
}

fn bench_convolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("Convolutions");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(60));
    group.bench_function("ConvForwardNaive", move |b| b.iter(conv_forward_naive));
    group.bench_function("ConvForwardParallel", move |b| b.iter(conv_forward_parallel));
    group.bench_function("ConvInputGradNaive", move |b| b.iter(conv_input_grad_naive));
    group.bench_function("ConvInputGradParallel", move |b| {
        b.iter(conv_input_grad_parallel)
    });
    group.finish();
}

criterion_group!(convolutions, bench_convolution,);
