use ndarray::{Array1, Array2, Array4, ArrayD, Axis, Ix2, IxDyn, Slice, Zip};
use rayon::ThreadPool;

use crate::operators::{
    BatchNormAttributes, BatchNormInits, ConvAttributes, GemmAttributes, MaxPoolAttributes,
    OperationError,
};

use super::Provider;

pub struct NaiveProvider;

impl Provider for NaiveProvider {
    fn name(&self) -> &str {
        "Naive"
    }

    fn version(&self) -> u64 {
        7
    }

    fn conv(
        _thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        weights: &Array4<f32>,
        bias: Option<&Array1<f32>>,
        attrs: &ConvAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
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
            // w = width, h = height; s = start, e = end
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
        let out_shape = [batch_size, n_featmaps, out_height, out_width];

        // compute actual kernel size, i.e. kernel size considering the dilation
        let act_kern_h = (dilat_h * (kern_h - 1) + 1) as i64;
        let act_kern_w = (dilat_w * (kern_w - 1) + 1) as i64;

        // declaration of tensor bounds considering padding
        let tens_hs: i64 = 0_i64 - (pad_hs as i64);
        let tens_ws: i64 = 0_i64 - (pad_ws as i64);
        let tens_he: i64 = (height + pad_he) as i64 - act_kern_h + 1; // subtracting kernel size to consider valid windows only
        let tens_we: i64 = (width + pad_we) as i64 - act_kern_w + 1;

        // result tensor
        let mut output: ArrayD<f32> = ArrayD::<f32>::zeros(IxDyn(&out_shape));

        for batch in 0..batch_size {
            for featmap in 0..n_featmaps {
                // get the group index of the feature map and compute input channel group bounds
                let group: usize = featmap / output_group_size;
                let group_s = group * input_group_size;
                let group_e = group_s + input_group_size;

                // iterate over the input tensor with the specified stride
                for ext_row in (tens_hs..tens_he).step_by(stride_h) {
                    for ext_col in (tens_ws..tens_we).step_by(stride_w) {
                        // declaration of kernel window bounds
                        let win_hs = ext_row;
                        let win_ws = ext_col;
                        let win_he = ext_row + act_kern_h; // actual kernel size takes into account the dilation
                        let win_we = ext_col + act_kern_w;

                        let mut accumulator: f32 = bias.map_or(0.0, |b| b[[featmap]]);
                        // iterate over all input channels
                        for channel in group_s..group_e {
                            let group_channel = channel % input_group_size;
                            // iterate over the window defined by the kernel with the specified dilation
                            for (kern_row, input_row) in
                                (win_hs..win_he).step_by(dilat_h).enumerate()
                            {
                                if input_row < 0 || input_row >= height as i64 {
                                    continue;
                                }
                                for (kern_col, input_col) in
                                    (win_ws..win_we).step_by(dilat_w).enumerate()
                                {
                                    if input_col < 0 || input_col >= width as i64 {
                                        continue;
                                    }
                                    accumulator += x
                                        [[batch, channel, input_row as usize, input_col as usize]]
                                        * weights[[featmap, group_channel, kern_row, kern_col]];
                                }
                            }
                        }
                        // compute output tensor indexes and update the corresponding value
                        let out_row = (ext_row + pad_hs as i64) as usize / stride_h;
                        let out_col = (ext_col + pad_ws as i64) as usize / stride_w;
                        output[[batch, featmap, out_row, out_col]] = accumulator;
                    }
                }
            }
        }
        Ok(output)
    }

    fn conv_input_grad(
        _thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        weights: &Array4<f32>,
        attrs: &ConvAttributes,
        input_shape: &[usize],
    ) -> Result<ArrayD<f32>, OperationError> {
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

        // each output position redistributes its incoming gradient over the
        // input window it was computed from, i.e. the loop transpose of conv
        let mut dx: ArrayD<f32> = ArrayD::<f32>::zeros(IxDyn(input_shape));
        for batch in 0..batch_size {
            for featmap in 0..n_featmaps {
                let group: usize = featmap / output_group_size;
                let group_s = group * input_group_size;
                let group_e = group_s + input_group_size;

                for out_row in 0..out_height {
                    for out_col in 0..out_width {
                        let g = grad[[batch, featmap, out_row, out_col]];
                        if g == 0.0 {
                            continue;
                        }
                        // top-left corner of the window in padded coordinates
                        let win_hs = (out_row * stride_h) as i64 - pad_hs as i64;
                        let win_ws = (out_col * stride_w) as i64 - pad_ws as i64;

                        for channel in group_s..group_e {
                            let group_channel = channel % input_group_size;
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
                                    dx[[batch, channel, input_row as usize, input_col as usize]] +=
                                        g * weights[[featmap, group_channel, kern_row, kern_col]];
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(dx)
    }

    fn relu(_thread_pool: &ThreadPool, x: &ArrayD<f32>) -> ArrayD<f32> {
        x.mapv(|v| v.max(0.0))
    }

    fn relu_input_grad(
        _thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        x: &ArrayD<f32>,
    ) -> ArrayD<f32> {
        Zip::from(grad)
            .and(x)
            .map_collect(|&g, &v| if v > 0.0 { g } else { 0.0 })
    }

    fn max_pool(
        _thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        attrs: &MaxPoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        // checks
        let [batch_size, in_chans, height, width] = *x.shape() else {
            return Err(OperationError::WrongDim(4, x.shape().len()));
        };
        let MaxPoolAttributes {
            kernel_shape: [kern_h, kern_w],
            pads: [pad_hs, pad_ws, pad_he, pad_we],
            strides: [stride_h, stride_w],
        } = *attrs;
        let out_height = 1 + ((height + pad_hs + pad_he) - kern_h) / stride_h;
        let out_width = 1 + ((width + pad_ws + pad_we) - kern_w) / stride_w;
        let out_shape = [batch_size, in_chans, out_height, out_width];

        // declaration of tensor bounds considering padding
        let tens_hs: i64 = 0i64 - (pad_hs as i64);
        let tens_ws: i64 = 0i64 - (pad_ws as i64);
        let tens_he: i64 = ((height + pad_he) - kern_h + 1) as i64; // subtracting kernel size to consider valid windows only
        let tens_we: i64 = ((width + pad_we) - kern_w + 1) as i64;

        // result tensor
        let mut output: ArrayD<f32> = ArrayD::<f32>::zeros(IxDyn(&out_shape));
        for batch in 0..batch_size {
            for channel in 0..in_chans {
                // iterate over the input tensor with the specified stride
                for ext_row in (tens_hs..tens_he).step_by(stride_h) {
                    for ext_col in (tens_ws..tens_we).step_by(stride_w) {
                        // declaration of kernel window bounds
                        let win_sh = ext_row;
                        let win_sw = ext_col;
                        let win_eh = ext_row + kern_h as i64;
                        let win_ew = ext_col + kern_w as i64;

                        let mut result: f32 = f32::MIN;
                        // iterate over the window defined by the kernel
                        for input_row in win_sh.max(0)..win_eh.min(height as i64) {
                            for input_col in win_sw.max(0)..win_ew.min(width as i64) {
                                result = result.max(
                                    x[[batch, channel, input_row as usize, input_col as usize]],
                                )
                            }
                        }
                        // compute output tensor indexes and update the corresponding value
                        let out_row = (ext_row + pad_hs as i64) as usize / stride_h;
                        let out_col = (ext_col + pad_ws as i64) as usize / stride_w;
                        output[[batch, channel, out_row, out_col]] = result;
                    }
                }
            }
        }
        Ok(output)
    }

    fn max_pool_input_grad(
        _thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        x: &ArrayD<f32>,
        attrs: &MaxPoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        let [batch_size, in_chans, height, width] = *x.shape() else {
            return Err(OperationError::WrongDim(4, x.shape().len()));
        };
        let MaxPoolAttributes {
            kernel_shape: [kern_h, kern_w],
            pads: [pad_hs, pad_ws, pad_he, pad_we],
            strides: [stride_h, stride_w],
        } = *attrs;
        let out_height = 1 + ((height + pad_hs + pad_he) - kern_h) / stride_h;
        let out_width = 1 + ((width + pad_ws + pad_we) - kern_w) / stride_w;
        if grad.shape() != [batch_size, in_chans, out_height, out_width] {
            return Err(OperationError::UnexpectedInputShape(
                vec![batch_size, in_chans, out_height, out_width],
                grad.shape().to_vec(),
            ));
        }

        let tens_hs: i64 = 0i64 - (pad_hs as i64);
        let tens_ws: i64 = 0i64 - (pad_ws as i64);
        let tens_he: i64 = ((height + pad_he) - kern_h + 1) as i64;
        let tens_we: i64 = ((width + pad_we) - kern_w + 1) as i64;

        let mut dx: ArrayD<f32> = ArrayD::<f32>::zeros(x.raw_dim());
        for batch in 0..batch_size {
            for channel in 0..in_chans {
                for ext_row in (tens_hs..tens_he).step_by(stride_h) {
                    for ext_col in (tens_ws..tens_we).step_by(stride_w) {
                        let win_eh = ext_row + kern_h as i64;
                        let win_ew = ext_col + kern_w as i64;

                        // find the window position that produced the max
                        let mut best = f32::MIN;
                        let mut best_pos = None;
                        for input_row in ext_row.max(0)..win_eh.min(height as i64) {
                            for input_col in ext_col.max(0)..win_ew.min(width as i64) {
                                let v =
                                    x[[batch, channel, input_row as usize, input_col as usize]];
                                if v > best {
                                    best = v;
                                    best_pos = Some((input_row as usize, input_col as usize));
                                }
                            }
                        }

                        let out_row = (ext_row + pad_hs as i64) as usize / stride_h;
                        let out_col = (ext_col + pad_ws as i64) as usize / stride_w;
                        if let Some((row, col)) = best_pos {
                            dx[[batch, channel, row, col]] +=
                                grad[[batch, channel, out_row, out_col]];
                        }
                    }
                }
            }
        }
        Ok(dx)
    }

    fn concat(
        _thread_pool: &ThreadPool,
        xs: &[&ArrayD<f32>],
        axis: usize,
    ) -> Result<ArrayD<f32>, OperationError> {
        if xs.is_empty() {
            return Err(OperationError::InvalidOperator);
        }
        if xs.iter().any(|x| axis >= x.ndim()) {
            return Err(OperationError::WrongDim(axis + 1, xs[0].ndim()));
        }
        let views = xs.iter().map(|x| x.view()).collect::<Vec<_>>();
        ndarray::concatenate(Axis(axis), views.as_slice())
            .map_err(|_| OperationError::InvalidOperator)
    }

    fn concat_input_grads(
        _thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        input_shapes: &[&[usize]],
        axis: usize,
    ) -> Result<Vec<ArrayD<f32>>, OperationError> {
        let total: usize = input_shapes.iter().map(|s| s[axis]).sum();
        if axis >= grad.ndim() || grad.shape()[axis] != total {
            return Err(OperationError::WrongShape(
                format!("[.., {}, ..]", total),
                format!("{:?}", grad.shape()),
            ));
        }
        let mut grads = Vec::with_capacity(input_shapes.len());
        let mut start = 0;
        for shape in input_shapes {
            let len = shape[axis];
            let piece = grad
                .slice_axis(Axis(axis), Slice::from(start..start + len))
                .to_owned();
            grads.push(piece);
            start += len;
        }
        Ok(grads)
    }

    fn add(
        _thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        if x.shape() == y.shape() {
            Ok(x + y)
        } else {
            Err(OperationError::WrongShape(
                format!("{:?}", x.shape()),
                format!("{:?}", y.shape()),
            ))
        }
    }

    fn batch_norm(
        _thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        inits: &BatchNormInits,
        attrs: &BatchNormAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        let channels = check_batch_norm_shapes(x, inits)?;

        let BatchNormAttributes { epsilon, .. } = *attrs;
        let shape = IxDyn(&[1, channels, 1, 1]);
        let mean = inits.mean.view().into_shape(shape.clone()).unwrap();
        let bias = inits.bias.view().into_shape(shape.clone()).unwrap();
        let scale = inits.scale.view().into_shape(shape.clone()).unwrap();
        let var = inits.var.view().into_shape(shape).unwrap();

        let x_normalized = (x - &mean) / (&var + epsilon).mapv(|v| v.sqrt());
        Ok(&scale * &x_normalized + &bias)
    }

    fn batch_norm_input_grad(
        _thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        inits: &BatchNormInits,
        attrs: &BatchNormAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        let channels = check_batch_norm_shapes(grad, inits)?;

        // inference-mode batch norm is an affine map per channel, so the
        // gradient is just the scale over the standard deviation
        let BatchNormAttributes { epsilon, .. } = *attrs;
        let shape = IxDyn(&[1, channels, 1, 1]);
        let scale = inits.scale.view().into_shape(shape.clone()).unwrap();
        let var = inits.var.view().into_shape(shape).unwrap();

        Ok(grad * &(&scale / (&var + epsilon).mapv(|v| v.sqrt())))
    }

    fn gemm(
        _thread_pool: &ThreadPool,
        a: &ArrayD<f32>,
        b: &Array2<f32>,
        c: &Array1<f32>,
        attrs: &GemmAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        let GemmAttributes {
            alpha,
            beta,
            trans_a,
            trans_b,
        } = *attrs;
        if a.ndim() != 2 {
            return Err(OperationError::WrongDim(2, a.ndim()));
        }
        let a = a.view().into_dimensionality::<Ix2>().unwrap();

        let act_a = if trans_a == 0 { a } else { a.reversed_axes() };
        let act_b = if trans_b == 0 { b.view() } else { b.t() };

        if act_a.shape()[1] != act_b.shape()[0] {
            return Err(OperationError::WrongShape(
                format!("[{}, *]", act_a.shape()[1]),
                format!("[{}, *]", act_b.shape()[0]),
            ));
        }
        if act_b.shape()[1] != c.shape()[0] {
            return Err(OperationError::WrongShape(
                format!("[*, {}]", act_b.shape()[1]),
                format!("[*, {}]", c.shape()[0]),
            ));
        }
        let bias = c.view().insert_axis(Axis(0));
        Ok((alpha * act_a.dot(&act_b) + beta * &bias).into_dyn())
    }

    fn gemm_input_grad(
        _thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        b: &Array2<f32>,
        attrs: &GemmAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        let GemmAttributes {
            alpha,
            trans_a,
            trans_b,
            ..
        } = *attrs;
        if grad.ndim() != 2 {
            return Err(OperationError::WrongDim(2, grad.ndim()));
        }
        let grad = grad.view().into_dimensionality::<Ix2>().unwrap();
        let act_b = if trans_b == 0 { b.view() } else { b.t() };
        if grad.shape()[1] != act_b.shape()[1] {
            return Err(OperationError::WrongShape(
                format!("[*, {}]", act_b.shape()[1]),
                format!("[*, {}]", grad.shape()[1]),
            ));
        }

        // d(op_a(A)) = alpha * dY . op_b(B)^T, transposed back if A was transposed
        let da_used: Array2<f32> = alpha * grad.dot(&act_b.t());
        let da = if trans_a == 0 {
            da_used
        } else {
            da_used.reversed_axes()
        };
        Ok(da.into_dyn())
    }

    fn global_average_pool(
        _thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        let [batch_size, channels, height, width] = *x.shape() else {
            return Err(OperationError::WrongDim(4, x.ndim()));
        };
        Ok(ArrayD::from_shape_fn(
            IxDyn(&[batch_size, channels, 1, 1]),
            |idx| {
                let mut accumulator = 0.0;
                for i in 0..height {
                    for j in 0..width {
                        accumulator += x[[idx[0], idx[1], i, j]];
                    }
                }
                accumulator / (height * width) as f32
            },
        ))
    }

    fn global_average_pool_input_grad(
        _thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        input_shape: &[usize],
    ) -> Result<ArrayD<f32>, OperationError> {
        let [batch_size, channels, height, width] = *input_shape else {
            return Err(OperationError::WrongDim(4, input_shape.len()));
        };
        if grad.shape() != [batch_size, channels, 1, 1] {
            return Err(OperationError::UnexpectedInputShape(
                vec![batch_size, channels, 1, 1],
                grad.shape().to_vec(),
            ));
        }
        let area = (height * width) as f32;
        Ok(ArrayD::from_shape_fn(IxDyn(input_shape), |idx| {
            grad[[idx[0], idx[1], 0, 0]] / area
        }))
    }

    fn reshape(
        _thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        shape: &Array1<i64>,
    ) -> Result<ArrayD<f32>, OperationError> {
        let mut target: Vec<usize> = Vec::with_capacity(shape.len());
        let mut infer_at = None;
        for (i, &dim) in shape.iter().enumerate() {
            match dim {
                0 => target.push(*x.shape().get(i).ok_or(OperationError::InvalidOperator)?),
                -1 => {
                    if infer_at.replace(i).is_some() {
                        return Err(OperationError::InvalidOperator);
                    }
                    target.push(1);
                }
                d if d > 0 => target.push(d as usize),
                _ => return Err(OperationError::InvalidOperator),
            }
        }
        if let Some(i) = infer_at {
            let known: usize = target.iter().product();
            if known == 0 || x.len() % known != 0 {
                return Err(OperationError::InvalidOperator);
            }
            target[i] = x.len() / known;
        }
        if x.len() != target.iter().product::<usize>() {
            return Err(OperationError::WrongShape(
                format!("{:?}", x.shape()),
                format!("{:?}", target),
            ));
        }
        Ok(x.clone().into_shape(IxDyn(&target)).unwrap())
    }
}

fn check_batch_norm_shapes(
    x: &ArrayD<f32>,
    inits: &BatchNormInits,
) -> Result<usize, OperationError> {
    if x.ndim() != 4 {
        return Err(OperationError::WrongDim(4, x.ndim()));
    }
    let channels = x.shape()[1];
    for dim in [
        inits.scale.shape()[0],
        inits.bias.shape()[0],
        inits.mean.shape()[0],
        inits.var.shape()[0],
    ] {
        if dim != channels {
            return Err(OperationError::WrongShape(
                format!("[{}]", channels),
                format!("[{}]", dim),
            ));
        }
    }
    Ok(channels)
}
