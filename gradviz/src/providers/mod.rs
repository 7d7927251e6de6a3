mod naive;
mod parallel;

pub use naive::*;
pub use parallel::*;

use ndarray::{Array1, Array2, Array4, ArrayD};
use rayon::ThreadPool;

use crate::operators::{
    BatchNormAttributes, BatchNormInits, ConvAttributes, GemmAttributes, MaxPoolAttributes,
    OperationError,
};

pub type DefaultProvider = ParNaiveProvider;

/// A trait that has to be implemented by all the execution providers.
///
/// It contains the kernels used to execute the supported operators, both in
/// the forward direction and in the gradient direction. Gradient kernels
/// compute the derivative of a scalar loss with respect to the operator's
/// *data input*, given the derivative with respect to its output; model
/// weights are frozen, so no weight gradients exist.
///
/// This interface can be limiting for providers that may not want to use
/// ndarray. In the future, it could be extended to support other data
/// structures.
pub trait Provider {
    /// Returns the name of the execution provider.
    fn name(&self) -> &str;

    /// Returns the targeted ONNX ir_version of the execution provider.
    /// This is used to check if the execution provider is compatible with the model.
    fn version(&self) -> u64;

    fn conv(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        weights: &Array4<f32>,
        bias: Option<&Array1<f32>>,
        attrs: &ConvAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    /// Gradient of a scalar with respect to the convolution input, i.e. the
    /// transposed convolution of `grad` with the (frozen) kernel weights.
    fn conv_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        weights: &Array4<f32>,
        attrs: &ConvAttributes,
        input_shape: &[usize],
    ) -> Result<ArrayD<f32>, OperationError>;

    fn relu(thread_pool: &ThreadPool, x: &ArrayD<f32>) -> ArrayD<f32>;

    fn relu_input_grad(thread_pool: &ThreadPool, grad: &ArrayD<f32>, x: &ArrayD<f32>)
        -> ArrayD<f32>;

    fn max_pool(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        attrs: &MaxPoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    /// Routes each output gradient entry to the position that won the
    /// corresponding max window (ties resolve to the first position, a valid
    /// subgradient).
    fn max_pool_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        x: &ArrayD<f32>,
        attrs: &MaxPoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn concat(
        thread_pool: &ThreadPool,
        xs: &[&ArrayD<f32>],
        axis: usize,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn concat_input_grads(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        input_shapes: &[&[usize]],
        axis: usize,
    ) -> Result<Vec<ArrayD<f32>>, OperationError>;

    fn add(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn batch_norm(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        inits: &BatchNormInits,
        attrs: &BatchNormAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn batch_norm_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        inits: &BatchNormInits,
        attrs: &BatchNormAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn gemm(
        thread_pool: &ThreadPool,
        a: &ArrayD<f32>,
        b: &Array2<f32>,
        c: &Array1<f32>,
        attrs: &GemmAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn gemm_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        b: &Array2<f32>,
        attrs: &GemmAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn global_average_pool(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn global_average_pool_input_grad(
        thread_pool: &ThreadPool,
        grad: &ArrayD<f32>,
        input_shape: &[usize],
    ) -> Result<ArrayD<f32>, OperationError>;

    fn reshape(
        thread_pool: &ThreadPool,
        x: &ArrayD<f32>,
        shape: &Array1<i64>,
    ) -> Result<ArrayD<f32>, OperationError>;
}
