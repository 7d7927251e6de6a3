//! Attribute structures for the supported operators.
//!
//! All tensors are assumed to be 4D `[batch, channels, height, width]` unless
//! stated otherwise; pads follow the ONNX convention
//! `[top, left, bottom, right]`.

#[derive(Debug, Clone, PartialEq)]
pub struct ConvAttributes {
    pub dilations: [usize; 2],
    pub group: usize,
    pub kernel_shape: [usize; 2],
    pub pads: [usize; 4],
    pub strides: [usize; 2],
}

impl ConvAttributes {
    pub fn new(
        dilations: [usize; 2],
        group: usize,
        kernel_shape: [usize; 2],
        pads: [usize; 4],
        strides: [usize; 2],
    ) -> Self {
        Self {
            dilations,
            group,
            kernel_shape,
            pads,
            strides,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaxPoolAttributes {
    pub kernel_shape: [usize; 2],
    pub pads: [usize; 4],
    pub strides: [usize; 2],
}

impl MaxPoolAttributes {
    pub fn new(kernel_shape: [usize; 2], pads: [usize; 4], strides: [usize; 2]) -> Self {
        Self {
            kernel_shape,
            pads,
            strides,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatAttributes {
    pub axis: usize,
}

impl ConcatAttributes {
    pub fn new(axis: usize) -> Self {
        Self { axis }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormAttributes {
    pub epsilon: f32,
    pub momentum: f32,
    pub spatial: i64,
}

impl BatchNormAttributes {
    pub fn new(epsilon: f32, momentum: f32, spatial: i64) -> Self {
        Self {
            epsilon,
            momentum,
            spatial,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GemmAttributes {
    pub alpha: f32,
    pub beta: f32,
    pub trans_a: i64,
    pub trans_b: i64,
}

impl GemmAttributes {
    pub fn new(alpha: f32, beta: f32, trans_a: i64, trans_b: i64) -> Self {
        Self {
            alpha,
            beta,
            trans_a,
            trans_b,
        }
    }
}
