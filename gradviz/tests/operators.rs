use ndarray::{arr1, arr2, Array4, ArrayD, IxDyn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use gradviz::operators::{
    BatchNormAttributes, BatchNormInits, ConvAttributes, GemmAttributes, MaxPoolAttributes,
};
use gradviz::providers::{NaiveProvider, ParNaiveProvider, Provider};

fn pool(threads: usize) -> ThreadPool {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .expect("Unable to create ThreadPool")
}

fn tensor4(shape: [usize; 4], f: impl Fn(usize, usize, usize, usize) -> f32) -> ArrayD<f32> {
    Array4::from_shape_fn(
        (shape[0], shape[1], shape[2], shape[3]),
        |(b, c, h, w)| f(b, c, h, w),
    )
    .into_dyn()
}

fn mean_abs_diff(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f32 {
    (a - b).mapv(f32::abs).mean().unwrap()
}

/// Central finite difference of `sum(f(x) * cograd)` with respect to `x`.
fn numeric_input_grad(
    x: &ArrayD<f32>,
    cograd: &ArrayD<f32>,
    step: f32,
    f: impl Fn(&ArrayD<f32>) -> ArrayD<f32>,
) -> ArrayD<f32> {
    let mut grad = ArrayD::<f32>::zeros(x.raw_dim());
    let indices: Vec<IxDyn> = x.indexed_iter().map(|(idx, _)| idx).collect();
    for idx in indices {
        let mut plus = x.clone();
        plus[idx.clone()] += step;
        let mut minus = x.clone();
        minus[idx.clone()] -= step;

        let delta = ((f(&plus) - f(&minus)) * cograd).sum() / (2.0 * step);
        grad[idx] = delta;
    }
    grad
}

#[test]
fn conv_basic_reference() {
    let tp = pool(1);
    let x = tensor4([1, 1, 3, 3], |_, _, h, w| (h * 3 + w + 1) as f32);
    let weights = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
    let attrs = ConvAttributes::new([1, 1], 1, [2, 2], [0, 0, 0, 0], [1, 1]);

    let y = NaiveProvider::conv(&tp, &x, &weights, None, &attrs).unwrap();
    let expected = tensor4([1, 1, 2, 2], |_, _, h, w| match (h, w) {
        (0, 0) => 6.0,
        (0, 1) => 8.0,
        (1, 0) => 12.0,
        _ => 14.0,
    });
    assert!(mean_abs_diff(&y, &expected) < 1e-6);
}

#[test]
fn conv_bias_offsets_every_output() {
    let tp = pool(1);
    let x = tensor4([1, 1, 3, 3], |_, _, h, w| (h + w) as f32);
    let weights = Array4::from_shape_vec((2, 1, 1, 1), vec![1.0, -1.0]).unwrap();
    let bias = arr1(&[0.5_f32, 1.5]);
    let attrs = ConvAttributes::new([1, 1], 1, [1, 1], [0, 0, 0, 0], [1, 1]);

    let y = NaiveProvider::conv(&tp, &x, &weights, Some(&bias), &attrs).unwrap();
    assert_eq!(y.shape(), &[1, 2, 3, 3]);
    assert!((y[[0, 0, 1, 1]] - 2.5).abs() < 1e-6);
    assert!((y[[0, 1, 1, 1]] - (-0.5)).abs() < 1e-6);
}

#[test]
fn conv_input_grad_matches_finite_differences() {
    let tp = pool(1);
    let x = tensor4([1, 2, 5, 5], |_, c, h, w| {
        0.1 * (c as f32 + 1.0) * (h as f32 - 2.0) + 0.05 * w as f32
    });
    let weights = Array4::from_shape_fn((3, 2, 3, 3), |(f, c, i, j)| {
        0.2 * ((f + c) as f32) - 0.1 * (i as f32) + 0.05 * (j as f32)
    });
    let attrs = ConvAttributes::new([1, 1], 1, [3, 3], [1, 1, 1, 1], [2, 2]);

    let forward = |input: &ArrayD<f32>| {
        NaiveProvider::conv(&tp, input, &weights, None, &attrs).unwrap()
    };
    let out = forward(&x);
    let cograd = ArrayD::from_shape_fn(out.raw_dim(), |idx| 0.5 + 0.1 * idx[1] as f32);

    let analytic = NaiveProvider::conv_input_grad(&tp, &cograd, &weights, &attrs, x.shape()).unwrap();
    // the convolution is linear in its input, a large step keeps rounding low
    let numeric = numeric_input_grad(&x, &cograd, 0.25, forward);
    assert!(mean_abs_diff(&analytic, &numeric) < 1e-3);
}

#[test]
fn grouped_conv_matches_between_providers() {
    let tp1 = pool(1);
    let tp4 = pool(4);
    let x = tensor4([2, 4, 6, 6], |b, c, h, w| {
        ((b + 1) * (c + 1)) as f32 * 0.1 + (h as f32) * 0.03 - (w as f32) * 0.02
    });
    // 2 groups, dilation 2, asymmetric padding exercise every attribute
    let weights = Array4::from_shape_fn((6, 2, 2, 2), |(f, c, i, j)| {
        0.05 * (f as f32 + 1.0) - 0.02 * (c as f32) + 0.01 * ((i + j) as f32)
    });
    let attrs = ConvAttributes::new([2, 2], 2, [2, 2], [1, 0, 0, 1], [2, 2]);

    let naive = NaiveProvider::conv(&tp1, &x, &weights, None, &attrs).unwrap();
    let parallel = ParNaiveProvider::conv(&tp4, &x, &weights, None, &attrs).unwrap();
    assert_eq!(naive.shape(), parallel.shape());
    assert!(mean_abs_diff(&naive, &parallel) < 1e-6);
}

#[test]
fn grouped_conv_input_grad_matches_between_providers() {
    let tp1 = pool(1);
    let tp4 = pool(4);
    let input_shape = [1, 4, 6, 6];
    let weights = Array4::from_shape_fn((6, 2, 2, 2), |(f, c, i, j)| {
        0.05 * (f as f32 + 1.0) - 0.02 * (c as f32) + 0.01 * ((i + j) as f32)
    });
    let attrs = ConvAttributes::new([1, 1], 2, [2, 2], [1, 1, 0, 0], [1, 1]);

    let x = tensor4(input_shape, |_, c, h, w| (c + h + w) as f32 * 0.1);
    let out = NaiveProvider::conv(&tp1, &x, &weights, None, &attrs).unwrap();
    let cograd = ArrayD::from_shape_fn(out.raw_dim(), |idx| 1.0 + 0.2 * idx[3] as f32);

    let naive =
        NaiveProvider::conv_input_grad(&tp1, &cograd, &weights, &attrs, &input_shape).unwrap();
    let parallel =
        ParNaiveProvider::conv_input_grad(&tp4, &cograd, &weights, &attrs, &input_shape).unwrap();
    assert!(mean_abs_diff(&naive, &parallel) < 1e-6);

    // and against finite differences of the forward kernel
    let forward =
        |input: &ArrayD<f32>| NaiveProvider::conv(&tp1, input, &weights, None, &attrs).unwrap();
    let numeric = numeric_input_grad(&x, &cograd, 0.25, forward);
    assert!(mean_abs_diff(&naive, &numeric) < 1e-3);
}

#[test]
fn relu_grad_masks_negative_inputs() {
    let tp = pool(1);
    let x = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![-1.0, 2.0, 0.0, 3.0]).unwrap();
    let grad = ArrayD::from_elem(IxDyn(&[1, 1, 2, 2]), 1.5);

    let dx = NaiveProvider::relu_input_grad(&tp, &grad, &x);
    assert_eq!(
        dx.into_raw_vec(),
        vec![0.0, 1.5, 0.0, 1.5]
    );
}

#[test]
fn max_pool_grad_routes_to_the_window_maximum() {
    let tp = pool(1);
    // one 2x2 window per quadrant, distinct maxima
    let x = ArrayD::from_shape_vec(
        IxDyn(&[1, 1, 4, 4]),
        vec![
            1.0, 2.0, 0.0, 0.5, //
            3.0, 0.0, 0.0, 4.0, //
            5.0, 0.0, 9.0, 0.0, //
            0.0, 6.0, 0.0, 7.0,
        ],
    )
    .unwrap();
    let attrs = MaxPoolAttributes::new([2, 2], [0, 0, 0, 0], [2, 2]);

    let y = NaiveProvider::max_pool(&tp, &x, &attrs).unwrap();
    assert_eq!(y.clone().into_raw_vec(), vec![3.0, 4.0, 6.0, 9.0]);

    let grad = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let dx = NaiveProvider::max_pool_input_grad(&tp, &grad, &x, &attrs).unwrap();

    assert_eq!(dx[[0, 0, 1, 0]], 1.0); // max 3.0
    assert_eq!(dx[[0, 0, 1, 3]], 2.0); // max 4.0
    assert_eq!(dx[[0, 0, 3, 1]], 3.0); // max 6.0
    assert_eq!(dx[[0, 0, 2, 2]], 4.0); // max 9.0
    assert_eq!(dx.sum(), 10.0);
}

#[test]
fn concat_roundtrips_through_its_gradient() {
    let tp = pool(1);
    let a = tensor4([1, 2, 2, 2], |_, c, h, w| (c * 4 + h * 2 + w) as f32);
    let b = tensor4([1, 3, 2, 2], |_, c, h, w| -((c * 4 + h * 2 + w) as f32));

    let y = NaiveProvider::concat(&tp, &[&a, &b], 1).unwrap();
    assert_eq!(y.shape(), &[1, 5, 2, 2]);

    let grads =
        NaiveProvider::concat_input_grads(&tp, &y, &[a.shape(), b.shape()], 1).unwrap();
    assert_eq!(grads.len(), 2);
    assert!(mean_abs_diff(&grads[0], &a) < 1e-6);
    assert!(mean_abs_diff(&grads[1], &b) < 1e-6);
}

#[test]
fn batch_norm_grad_is_the_channel_scale() {
    let tp = pool(1);
    let x = tensor4([1, 2, 2, 2], |_, c, h, w| (c + h + w) as f32);
    let inits = BatchNormInits::new(
        arr1(&[2.0_f32, 0.5]),
        arr1(&[1.0_f32, -1.0]),
        arr1(&[0.0_f32, 1.0]),
        arr1(&[1.0_f32, 4.0]),
    );
    let attrs = BatchNormAttributes::new(0.0, 0.9, 1);

    let y = NaiveProvider::batch_norm(&tp, &x, &inits, &attrs).unwrap();
    // channel 0: 2 * (x - 0) / 1 + 1
    assert!((y[[0, 0, 0, 1]] - 3.0).abs() < 1e-5);
    // channel 1: 0.5 * (x - 1) / 2 - 1
    assert!((y[[0, 1, 0, 0]] - (-1.0)).abs() < 1e-5);

    let grad = ArrayD::from_elem(IxDyn(&[1, 2, 2, 2]), 1.0);
    let dx = NaiveProvider::batch_norm_input_grad(&tp, &grad, &inits, &attrs).unwrap();
    assert!((dx[[0, 0, 0, 0]] - 2.0).abs() < 1e-5);
    assert!((dx[[0, 1, 0, 0]] - 0.25).abs() < 1e-5);
}

#[test]
fn gemm_matches_reference_and_gradient() {
    let tp = pool(1);
    let a = arr2(&[[1.0_f32, 2.0], [3.0, 4.0]]).into_dyn();
    // transB = 1: Y = alpha * A . B^T + beta * C
    let b = arr2(&[[1.0_f32, 0.0], [0.0, 1.0], [1.0, 1.0]]);
    let c = arr1(&[0.0_f32, 0.0, 1.0]);
    let attrs = GemmAttributes::new(2.0, 1.0, 0, 1);

    let y = NaiveProvider::gemm(&tp, &a, &b, &c, &attrs).unwrap();
    let expected = arr2(&[[2.0_f32, 4.0, 7.0], [6.0, 8.0, 15.0]]).into_dyn();
    assert!(mean_abs_diff(&y, &expected) < 1e-6);

    let cograd = arr2(&[[1.0_f32, 0.0, 1.0], [0.0, 1.0, 0.0]]).into_dyn();
    let dx = NaiveProvider::gemm_input_grad(&tp, &cograd, &b, &attrs).unwrap();
    // dA = alpha * dY . B
    let expected_dx = arr2(&[[4.0_f32, 2.0], [0.0, 2.0]]).into_dyn();
    assert!(mean_abs_diff(&dx, &expected_dx) < 1e-6);
}

#[test]
fn global_average_pool_and_its_gradient() {
    let tp = pool(1);
    let x = tensor4([1, 2, 2, 2], |_, c, h, w| (c * 4 + h * 2 + w) as f32);

    let y = NaiveProvider::global_average_pool(&tp, &x).unwrap();
    assert_eq!(y.shape(), &[1, 2, 1, 1]);
    assert!((y[[0, 0, 0, 0]] - 1.5).abs() < 1e-6);
    assert!((y[[0, 1, 0, 0]] - 5.5).abs() < 1e-6);

    let grad = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1, 1]), vec![4.0, 8.0]).unwrap();
    let dx = NaiveProvider::global_average_pool_input_grad(&tp, &grad, x.shape()).unwrap();
    assert!((dx[[0, 0, 1, 1]] - 1.0).abs() < 1e-6);
    assert!((dx[[0, 1, 0, 0]] - 2.0).abs() < 1e-6);
}

#[test]
fn reshape_supports_copy_and_inferred_dims() {
    let tp = pool(1);
    let x = tensor4([2, 3, 2, 2], |b, c, h, w| (b + c + h + w) as f32);

    let y = NaiveProvider::reshape(&tp, &x, &arr1(&[0, -1])).unwrap();
    assert_eq!(y.shape(), &[2, 12]);

    let err = NaiveProvider::reshape(&tp, &x, &arr1(&[5, -1]));
    assert!(err.is_err());
}

#[test]
fn add_rejects_mismatched_shapes() {
    let tp = pool(1);
    let a = tensor4([1, 2, 2, 2], |_, _, _, _| 1.0);
    let b = tensor4([1, 2, 2, 3], |_, _, _, _| 1.0);
    assert!(NaiveProvider::add(&tp, &a, &b).is_err());

    let sum = NaiveProvider::add(&tp, &a, &a).unwrap();
    assert!((sum.sum() - 16.0).abs() < 1e-6);
}
