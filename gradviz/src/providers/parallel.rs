use ndarray::{Array1, Array2, ArrayD, Array4, Axis, IxDyn};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::operators::{
    BatchNormAttributes, BatchNormInits, ConvAttributes, GemmAttributes, MaxPoolAttributes,
    OperationError,
};

use super::{NaiveProvider, Provider};

/// Parallel variant of [`NaiveProvider`].
///
/// Convolution dominates both the forward pass and the input-gradient pass,
/// so only those kernels are parallelized: the forward direction over feature
/// maps, the gradient direction over input channels (each worker owns its
/// output plane, so no synchronization is needed). Every other kernel
/// delegates to the sequential implementation.
pub struct ParNaiveProvider;

impl Provider for ParNaiveProvider {
    fn name(&self) -> &str {
        "ParNaive"
    }

    fn version(&self) -> u64 {
        7
    }

    fn conv(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        weights: &Array4<f32>,
        bias: Option<&Array1<f32>>,
        attrs: &ConvAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        if thread_pool.current_num_threads() == 1 {
            return NaiveProvider::conv(thread_pool, x, weights, bias, attrs);
        }
        // checks
        let [batch_size, in_chans, height, width] = *x.shape() else {
            return Err(OperationError::WrongDim(4, x.shape().len()));
        };
        if weights.shape()[2..] != attrs.kernel_shape {
            return Err(OperationError::WrongShape(
                format!(
                    "[*, *, {}, {}]",
                    attrs.kernel_shape[0], attrs.kernel_shape[1]
                ),
                format!("[*, *, {}, {}]", weights.shape()[2], weights.shape()[3]),
            ));
        }
        let n_featmaps = weights.shape()[0];
        if let Some(bias) = bias {
            if bias.shape()[0] != n_featmaps {
                return Err(OperationError::WrongShape(
                    format!("[{}]", n_featmaps),
                    format!("[{}]", bias.shape()[0]),
                ));
            }
        }

        let ConvAttributes {
            dilations: [dilat_h, dilat_w],
            group: n_groups,
            kernel_shape: [kern_h, kern_w],
            pads: [pad_hs, pad_ws, pad_he, pad_we],
            strides: [stride_h, stride_w],
        } = *attrs;
        let output_group_size = n_featmaps / n_groups;
        let input_group_size = in_chans / n_groups;
        let out_height = 1 + ((height + pad_hs + pad_he) - (dilat_h * (kern_h - 1) + 1)) / stride_h;
        let out_width = 1 + ((width + pad_ws + pad_we) - (dilat_w * (kern_w - 1) + 1)) / stride_w;

        let act_kern_h = (dilat_h * (kern_h - 1) + 1) as i64;
        let act_kern_w = (dilat_w * (kern_w - 1) + 1) as i64;

        let tens_hs: i64 = 0_i64 - (pad_hs as i64);
        let tens_ws: i64 = 0_i64 - (pad_ws as i64);
        let tens_he: i64 = (height + pad_he) as i64 - act_kern_h + 1;
        let tens_we: i64 = (width + pad_we) as i64 - act_kern_w + 1;

        let mut output =
            ArrayD::<f32>::zeros(IxDyn(&[batch_size, n_featmaps, out_height, out_width]));
        for batch in 0..batch_size {
            let planes = thread_pool.install(|| {
                (0..n_featmaps)
                    .into_par_iter()
                    .map(|featmap| {
                        let group: usize = featmap / output_group_size;
                        let group_s = group * input_group_size;
                        let group_e = group_s + input_group_size;

                        let mut plane = Array2::<f32>::zeros((out_height, out_width));
                        for ext_row in (tens_hs..tens_he).step_by(stride_h) {
                            for ext_col in (tens_ws..tens_we).step_by(stride_w) {
                                let win_he = ext_row + act_kern_h;
                                let win_we = ext_col + act_kern_w;

                                let mut accumulator: f32 = bias.map_or(0.0, |b| b[[featmap]]);
                                for channel in group_s..group_e {
                                    let group_channel = channel % input_group_size;
                                    for (kern_row, input_row) in
                                        (ext_row..win_he).step_by(dilat_h).enumerate()
                                    {
                                        if input_row < 0 || input_row >= height as i64 {
                                            continue;
                                        }
                                        for (kern_col, input_col) in
                                            (ext_col..win_we).step_by(dilat_w).enumerate()
                                        {
                                            if input_col < 0 || input_col >= width as i64 {
                                                continue;
                                            }
                                            accumulator += x[[
                                                batch,
                                                channel,
                                                input_row as usize,
                                                input_col as usize,
                                            ]] * weights
                                                [[featmap, group_channel, kern_row, kern_col]];
                                        }
                                    }
                                }
                                let out_row = (ext_row + pad_hs as i64) as usize / stride_h;
                                let out_col = (ext_col + pad_ws as i64) as usize / stride_w;
                                plane[[out_row, out_col]] = accumulator;
                            }
                        }
                        plane
                    })
                    .collect::<Vec<_>>()
            });
            for (featmap, plane) in planes.into_iter().enumerate() {
                output
                    .view_mut()
                    .index_axis_move(Axis(0), batch)
                    .index_axis_move(Axis(0), featmap)
                    .assign(&plane);
            }
        }
        Ok(output)
    }

    fn conv_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        weights: &Array4<f32>,
        attrs: &ConvAttributes,
        input_shape: &[usize],
    ) -> Result<ArrayD<f32>, OperationError> {
        if thread_pool.current_num_threads() == 1 {
            return NaiveProvider::conv_input_grad(thread_pool, grad, weights, attrs, input_shape);
        }
        let [batch_size, n_featmaps, out_height, out_width] = *grad.shape() else {
            return Err(OperationError::WrongDim(4, grad.shape().len()));
        };
        let [in_batch, in_chans, height, width] = *input_shape else {
            return Err(OperationError::WrongDim(4, input_shape.len()));
        };
        if in_batch != batch_size {
            return Err(OperationError::WrongShape(
                format!("[{}, *, *, *]", batch_size),
                format!("[{}, *, *, *]", in_batch),
            ));
        }
        if weights.shape()[0] != n_featmaps {
            return Err(OperationError::WrongShape(
                format!("[{}, *, *, *]", n_featmaps),
                format!("[{}, *, *, *]", weights.shape()[0]),
            ));
        }

        let ConvAttributes {
            dilations: [dilat_h, dilat_w],
            group: n_groups,
            kernel_shape: [kern_h, kern_w],
            pads: [pad_hs, pad_ws, _, _],
            strides: [stride_h, stride_w],
        } = *attrs;
        let output_group_size = n_featmaps / n_groups;
        let input_group_size = in_chans / n_groups;

        // a channel only receives gradient from the feature maps of its own
        // group, so splitting the work per input channel keeps every output
        // plane thread-local
        let mut dx = ArrayD::<f32>::zeros(IxDyn(input_shape));
        for batch in 0..batch_size {
            let planes = thread_pool.install(|| {
                (0..in_chans)
                    .into_par_iter()
                    .map(|channel| {
                        let group = channel / input_group_size;
                        let group_channel = channel % input_group_size;
                        let featmap_s = group * output_group_size;
                        let featmap_e = featmap_s + output_group_size;

                        let mut plane = Array2::<f32>::zeros((height, width));
                        for featmap in featmap_s..featmap_e {
                            for out_row in 0..out_height {
                                for out_col in 0..out_width {
                                    let g = grad[[batch, featmap, out_row, out_col]];
                                    if g == 0.0 {
                                        continue;
                                    }
                                    let win_hs = (out_row * stride_h) as i64 - pad_hs as i64;
                                    let win_ws = (out_col * stride_w) as i64 - pad_ws as i64;
                                    for kern_row in 0..kern_h {
                                        let input_row = win_hs + (kern_row * dilat_h) as i64;
                                        if input_row < 0 || input_row >= height as i64 {
                                            continue;
                                        }
                                        for kern_col in 0..kern_w {
                                            let input_col = win_ws + (kern_col * dilat_w) as i64;
                                            if input_col < 0 || input_col >= width as i64 {
                                                continue;
                                            }
                                            plane[[input_row as usize, input_col as usize]] += g
                                                * weights
                                                    [[featmap, group_channel, kern_row, kern_col]];
                                        }
                                    }
                                }
                            }
                        }
                        plane
                    })
                    .collect::<Vec<_>>()
            });
            for (channel, plane) in planes.into_iter().enumerate() {
                dx.view_mut()
                    .index_axis_move(Axis(0), batch)
                    .index_axis_move(Axis(0), channel)
                    .assign(&plane);
            }
        }
        Ok(dx)
    }

    fn relu(thread_pool: &ThreadPool, x: &ArrayD<f32>) -> ArrayD<f32> {
        NaiveProvider::relu(thread_pool, x)
    }

    fn relu_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        x: &ArrayD<f32>,
    ) -> ArrayD<f32> {
        NaiveProvider::relu_input_grad(thread_pool, grad, x)
    }

    fn max_pool(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        attrs: &MaxPoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::max_pool(thread_pool, x, attrs)
    }

    fn max_pool_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        x: &ArrayD<f32>,
        attrs: &MaxPoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::max_pool_input_grad(thread_pool, grad, x, attrs)
    }

    fn concat(
        thread_pool: &ThreadPool,
        xs: &[&ArrayD<f32>],
        axis: usize,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::concat(thread_pool, xs, axis)
    }

    fn concat_input_grads(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        input_shapes: &[&[usize]],
        axis: usize,
    ) -> Result<Vec<ArrayD<f32>>, OperationError> {
        NaiveProvider::concat_input_grads(thread_pool, grad, input_shapes, axis)
    }

    fn add(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::add(thread_pool, x, y)
    }

    fn batch_norm(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        inits: &BatchNormInits,
        attrs: &BatchNormAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::batch_norm(thread_pool, x, inits, attrs)
    }

    fn batch_norm_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        inits: &BatchNormInits,
        attrs: &BatchNormAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::batch_norm_input_grad(thread_pool, grad, inits, attrs)
    }

    fn gemm(
        thread_pool: &ThreadPool,
        a: &ArrayD<f32>,
        b: &Array2<f32>,
        c: &Array1<f32>,
        attrs: &GemmAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::gemm(thread_pool, a, b, c, attrs)
    }

    fn gemm_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        b: &Array2<f32>,
        attrs: &GemmAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::gemm_input_grad(thread_pool, grad, b, attrs)
    }

    fn global_average_pool(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::global_average_pool(thread_pool, x)
    }

    fn global_average_pool_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        input_shape: &[usize],
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::global_average_pool_input_grad(thread_pool, grad, input_shape)
    }

    fn reshape(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        shape: &Array1<i64>,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::reshape(thread_pool, x, shape)
    }
}
