//! Sign language letter classifier trained on the Sign Language MNIST CSV files,
//! with export of the trained network to ONNX.

pub mod data;
pub mod export;
pub mod inference;
pub mod logger;
pub mod model;
pub mod onnx;
pub mod training;
pub mod weights;
