///
/// # Operators
///
/// This module defines the operator structures of the executable graph.
///
/// It only covers the subset of ONNX operators used by the supported
/// classification networks. Initializers (weights, biases, running statistics)
/// are converted to concretely typed arrays when the graph is translated, so
/// the execution and gradient kernels never re-check element types.
///
mod attributes;
mod initializers;

pub use attributes::*;
pub use initializers::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OperationError {
    #[error("Wrong dimensionality: expected {0}, found {1}")]
    WrongDim(usize, usize),
    #[error("Wrong shape: expected {0}, found {1}")]
    WrongShape(String, String),
    #[error("Unexpected input shape: expected {0:?}, found {1:?}")]
    UnexpectedInputShape(Vec<usize>, Vec<usize>),
    #[error("Operator {0} expects {1} data inputs, found {2}")]
    WrongInputCount(String, usize, usize),
    #[error("The operation is invalid")]
    InvalidOperator,
}

/// Shape declared by the model for its input or output tensor.
/// `None` marks a dynamic dimension (e.g. the batch axis, exported as a
/// named parameter such as `N`).
pub type DeclaredShape = Vec<Option<usize>>;

#[derive(Debug)]
pub enum Operator {
    InputFeed(DeclaredShape),
    OutputCollector(DeclaredShape),
    Convolution(ConvInits, ConvAttributes),
    ReLU,
    MaxPool(MaxPoolAttributes),
    Concat(ConcatAttributes),
    Add,
    BatchNorm(BatchNormInits, BatchNormAttributes),
    Gemm(GemmInits, GemmAttributes),
    GlobalAveragePool,
    Reshape(ReshapeInits),
    Dropout,
}

impl Operator {
    pub fn name(&self) -> String {
        match self {
            Operator::InputFeed(_) => String::from("InputFeed"),
            Operator::OutputCollector(_) => String::from("OutputCollector"),
            Operator::Convolution(_, _) => String::from("Conv"),
            Operator::ReLU => String::from("Relu"),
            Operator::MaxPool(_) => String::from("MaxPool"),
            Operator::Concat(_) => String::from("Concat"),
            Operator::Add => String::from("Add"),
            Operator::BatchNorm(_, _) => String::from("BatchNormalization"),
            Operator::Gemm(_, _) => String::from("Gemm"),
            Operator::GlobalAveragePool => String::from("GlobalAveragePool"),
            Operator::Reshape(_) => String::from("Reshape"),
            Operator::Dropout => String::from("Dropout"),
        }
    }
}
