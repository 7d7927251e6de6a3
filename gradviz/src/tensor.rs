//! # Tensor utilities
//!
//! This module contains utilities to deal with dynamic ONNX tensors.
//!
//! The main struct is [`Tensor`], which contains the name of the tensor and its data.
//! The data is stored in the [`TensorData`] enum, which contains the actual array
//! with the concrete element type.

use ndarray::{ArrayD, IxDyn};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use thiserror::Error;

use crate::onnx_format::TensorProto;

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("The tensor element type {0} is not supported")]
    UnsupportedDataType(i32),
    #[error("The tensor payload does not match the declared shape {0:?}")]
    MalformedPayload(Vec<usize>),
}

#[derive(Debug, Clone)]
pub struct Tensor {
    pub name: String,
    pub data: TensorData,
}

/// Enum representing the different types of data that can be stored in a tensor
/// in ONNX.
/// This is a subset of the types defined in the ONNX protobuf specification.
/// The tags are the same as the ones defined in the protobuf specification.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq)]
pub enum TensorDataType {
    /// 32-bit floating point, equivalent to Rust's `f32`
    Float = 1,
    /// Signed 64-bit int, equivalent to Rust's `i64`
    Int64 = 7,
    /// 64-bit floating point, equivalent to Rust's `f64`
    Double = 11,
}

#[derive(Debug, Clone)]
pub enum TensorData {
    Float(ArrayD<f32>),
    Int64(ArrayD<i64>),
}

impl TensorData {
    pub fn dtype(&self) -> TensorDataType {
        match self {
            TensorData::Float(_) => TensorDataType::Float,
            TensorData::Int64(_) => TensorDataType::Int64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorData::Float(x) => x.shape(),
            TensorData::Int64(x) => x.shape(),
        }
    }
}

impl TryFrom<TensorProto> for Tensor {
    type Error = TensorError;

    fn try_from(proto: TensorProto) -> Result<Self, Self::Error> {
        let name = proto.name.clone().unwrap_or_default();
        let dimensions = proto
            .dims
            .iter()
            .map(|x| *x as usize)
            .collect::<Vec<usize>>();

        let data = convert_proto_to_tensor_data(proto, dimensions)?;

        Ok(Tensor { name, data })
    }
}

fn convert_proto_to_tensor_data(
    proto: TensorProto,
    dimensions: Vec<usize>,
) -> Result<TensorData, TensorError> {
    let raw_type = proto.data_type.unwrap_or_default();
    let element_data_type: TensorDataType =
        FromPrimitive::from_i32(raw_type).ok_or(TensorError::UnsupportedDataType(raw_type))?;

    match element_data_type {
        TensorDataType::Float => {
            let data: Vec<f32> = {
                match proto.raw_data {
                    Some(raw_data) => raw_data
                        .chunks_exact(4)
                        .map(|x| f32::from_le_bytes([x[0], x[1], x[2], x[3]]))
                        .collect(),
                    None => proto.float_data,
                }
            };
            ArrayD::from_shape_vec(IxDyn(&dimensions), data)
                .map(TensorData::Float)
                .map_err(|_| TensorError::MalformedPayload(dimensions))
        }
        TensorDataType::Int64 => {
            let data: Vec<i64> = {
                match proto.raw_data {
                    Some(raw_data) => raw_data
                        .chunks_exact(8)
                        .map(|x| {
                            i64::from_le_bytes([x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7]])
                        })
                        .collect(),
                    None => proto.int64_data,
                }
            };
            ArrayD::from_shape_vec(IxDyn(&dimensions), data)
                .map(TensorData::Int64)
                .map_err(|_| TensorError::MalformedPayload(dimensions))
        }
        TensorDataType::Double => {
            // Double weights are downcast: every supported model stores f32,
            // but some exporters tag scalar constants as double.
            let data: Vec<f32> = {
                match proto.raw_data {
                    Some(raw_data) => raw_data
                        .chunks_exact(8)
                        .map(|x| {
                            f64::from_le_bytes([x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7]])
                                as f32
                        })
                        .collect(),
                    None => proto.double_data.iter().map(|x| *x as f32).collect(),
                }
            };
            ArrayD::from_shape_vec(IxDyn(&dimensions), data)
                .map(TensorData::Float)
                .map_err(|_| TensorError::MalformedPayload(dimensions))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_tensor_from_raw_data() {
        let proto = TensorProto {
            dims: vec![2, 2],
            data_type: Some(1),
            name: Some(String::from("weights")),
            raw_data: Some(
                [1.0_f32, 2.0, 3.0, 4.0]
                    .iter()
                    .flat_map(|x| x.to_le_bytes())
                    .collect(),
            ),
            ..Default::default()
        };

        let tensor = Tensor::try_from(proto).unwrap();
        assert_eq!(tensor.name, "weights");
        let TensorData::Float(data) = tensor.data else {
            panic!("Expected float data")
        };
        assert_eq!(data.shape(), &[2, 2]);
        assert_eq!(data[[1, 0]], 3.0);
    }

    #[test]
    fn int64_tensor_from_typed_data() {
        let proto = TensorProto {
            dims: vec![2],
            data_type: Some(7),
            int64_data: vec![1, -1],
            ..Default::default()
        };

        let tensor = Tensor::try_from(proto).unwrap();
        let TensorData::Int64(data) = tensor.data else {
            panic!("Expected int64 data")
        };
        assert_eq!(data.as_slice().unwrap(), &[1, -1]);
    }

    #[test]
    fn unsupported_dtype_is_rejected() {
        let proto = TensorProto {
            dims: vec![1],
            data_type: Some(8), // string
            ..Default::default()
        };
        assert!(Tensor::try_from(proto).is_err());
    }
}
