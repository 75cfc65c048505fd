//! ONNX protobuf bindings and an executor for the graphs written by
//! [export](crate::export).

mod graph;

pub use graph::{Dimension, OnnxError, OnnxGraph};

mod inner {
    include!(concat!(env!("OUT_DIR"), "/onnx-protos/mod.rs"));
}

pub use inner::onnx::*;

/// Graph input name.
pub const INPUT_NAME: &str = "input";
/// Graph output name.
pub const OUTPUT_NAME: &str = "output";
/// Symbolic name of the dynamic batch dimension.
pub const BATCH_DIM: &str = "batch";
/// `TensorProto.DataType.FLOAT`.
pub const ELEM_TYPE_FLOAT: i32 = 1;
