///
/// # ONNX Format
///
/// This module contains the ONNX format related code.
///
/// The ONNX format is defined in the [ONNX specification](https://github.com/onnx/onnx/blob/main/docs/IR.md).
///
/// Only the subset of the protobuf messages needed to decode the supported
/// classification models is defined here; unknown fields are skipped by prost.
///
mod onnx_model;

pub use onnx_model::*;
