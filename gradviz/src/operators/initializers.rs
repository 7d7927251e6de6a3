//! Constant operator inputs baked into the model (weights, biases, running
//! statistics, target shapes).
//!
//! The translator converts the dynamic [`TensorData`](crate::tensor::TensorData)
//! payloads into these concretely typed arrays once, so kernels work on plain
//! `ndarray` views.

use ndarray::{Array1, Array2, Array4};

use crate::tensor::TensorData;

#[derive(Debug, Clone)]
pub struct ConvInits {
    pub weights: Array4<f32>,
    pub bias: Option<Array1<f32>>,
}

impl ConvInits {
    pub fn new(weights: Array4<f32>, bias: Option<Array1<f32>>) -> Self {
        Self { weights, bias }
    }
}

#[derive(Debug, Clone)]
pub struct BatchNormInits {
    pub scale: Array1<f32>,
    pub bias: Array1<f32>,
    pub mean: Array1<f32>,
    pub var: Array1<f32>,
}

impl BatchNormInits {
    pub fn new(scale: Array1<f32>, bias: Array1<f32>, mean: Array1<f32>, var: Array1<f32>) -> Self {
        Self {
            scale,
            bias,
            mean,
            var,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GemmInits {
    pub b: Array2<f32>,
    pub c: Array1<f32>,
}

impl GemmInits {
    pub fn new(b: Array2<f32>, c: Array1<f32>) -> Self {
        Self { b, c }
    }
}

#[derive(Debug, Clone)]
pub struct ReshapeInits {
    pub shape: Array1<i64>,
}

impl ReshapeInits {
    pub fn new(shape: Array1<i64>) -> Self {
        Self { shape }
    }
}

/// Downcast helpers used by the translator when consuming initializers.
pub(crate) fn float_of_rank(
    data: TensorData,
    rank: usize,
) -> Option<ndarray::ArrayD<f32>> {
    match data {
        TensorData::Float(x) if x.ndim() == rank => Some(x),
        _ => None,
    }
}

pub(crate) fn flatten_to_1d(data: TensorData) -> Option<Array1<f32>> {
    match data {
        TensorData::Float(x) => {
            let len = x.len();
            x.into_shape(len).ok()
        }
        _ => None,
    }
}
