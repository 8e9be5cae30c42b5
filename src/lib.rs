//! Embedding Service Library
//!
//! A TCP broker that spreads embedding requests from many clients over a fixed
//! pool of worker threads, plus the client that talks to it.

pub mod client;
pub mod models;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod protocol;
pub mod server;
pub mod text;

// Re-exports
pub use client::{ClientConfig, EmbeddingClient};
pub use models::{
    BackendKind, Embedding, EmbeddingError, EmbeddingResult, EncoderDispatcher, TextEncoder,
    TextInput,
};
pub use protocol::{BackendInfo, Reply, Request};
pub use server::{BackendDirectory, Broker, BrokerHandle, ServerConfig};
pub use text::TextProcessor;
