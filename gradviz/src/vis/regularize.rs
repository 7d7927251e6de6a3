//! Implicit regularizers shared by the synthesis loops: circular jitter,
//! clipping to the displayable range, and Gaussian blurring.

use lazy_static::lazy_static;
use ndarray::{Array4, Axis};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::operators::{ConvAttributes, OperationError};
use crate::providers::{NaiveProvider, Provider};
use crate::service::prepare::{valid_pixel_range, IMAGENET_MEAN};

lazy_static! {
    // the blur kernels are tiny, parallelism would only add overhead
    static ref BLUR_POOL: ThreadPool = ThreadPoolBuilder::new()
        .num_threads(1)
        .build()
        .expect("Unable to create ThreadPool");
}

/// Circularly shifts an image batch by `(shift_y, shift_x)` pixels.
///
/// `jitter(x, a, b)` is undone by `jitter(x, -a, -b)`.
pub fn jitter(x: &Array4<f32>, shift_y: i64, shift_x: i64) -> Array4<f32> {
    let (height, width) = (x.shape()[2] as i64, x.shape()[3] as i64);
    Array4::from_shape_fn(x.raw_dim(), |(b, c, y, x_pos)| {
        let src_y = (y as i64 - shift_y).rem_euclid(height) as usize;
        let src_x = (x_pos as i64 - shift_x).rem_euclid(width) as usize;
        x[[b, c, src_y, src_x]]
    })
}

/// Clamps every channel to the normalized interval that maps back onto
/// displayable pixel values. Channels beyond RGB reuse the last bound.
pub fn clip_to_valid_range(x: &mut Array4<f32>) {
    for (channel, mut lane) in x.axis_iter_mut(Axis(1)).enumerate() {
        let (lo, hi) = valid_pixel_range(channel.min(IMAGENET_MEAN.len() - 1));
        lane.mapv_inplace(|v| v.clamp(lo, hi));
    }
}

/// Gaussian blur, expressed as a depthwise convolution through the same conv
/// kernel that runs the model.
pub fn gaussian_blur(x: &Array4<f32>, sigma: f32) -> Result<Array4<f32>, OperationError> {
    let channels = x.shape()[1];
    let radius = (2.0 * sigma).ceil().max(1.0) as usize;
    let size = 2 * radius + 1;

    // separable kernel sampled at integer offsets, normalized to sum 1
    let one_d: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - radius as f32;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = one_d.iter().sum();
    let one_d: Vec<f32> = one_d.into_iter().map(|v| v / sum).collect();

    let mut weights = Array4::<f32>::zeros((channels, 1, size, size));
    for c in 0..channels {
        for i in 0..size {
            for j in 0..size {
                weights[[c, 0, i, j]] = one_d[i] * one_d[j];
            }
        }
    }

    let attrs = ConvAttributes::new(
        [1, 1],
        channels,
        [size, size],
        [radius, radius, radius, radius],
        [1, 1],
    );
    let blurred = NaiveProvider::conv(&BLUR_POOL, &x.clone().into_dyn(), &weights, None, &attrs)?;
    Ok(blurred
        .into_dimensionality::<ndarray::Ix4>()
        .expect("depthwise blur preserves the input shape"))
}
