//! ONNX Runtime engine behind the transformer backends

pub mod onnx_engine;
pub use onnx_engine::{OnnxConfig, OnnxEmbeddingEngine};
