//! Embedding models: error types, the encoder contract and its implementations.

pub mod dispatcher;
pub mod model;
pub mod sentence;
pub mod static_vectors;

// Re-exports
pub use dispatcher::{EncoderDispatcher, DEFAULT_BATCH_SIZE};
pub use model::{BackendKind, Encoder, ModelInfo, TextEncoder};
pub use sentence::{SentenceEncoder, SentenceOptions, TokenPooling};
pub use static_vectors::{StaticVectorEncoder, VocabularyTable};

use serde::{Deserialize, Serialize};

use crate::protocol::{ErrorCode, ErrorResponse};

/// Embedding vector type
pub type Embedding = Vec<f32>;

/// Result type for embedding operations
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// The only pooling mode the static-vector backend understands.
pub const MEAN_POOLING: &str = "mean";

/// One entry of an encode request: raw text, or a list of pre-split tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextInput {
    Text(String),
    Tokens(Vec<String>),
}

impl TextInput {
    /// Flatten to a single string, joining tokens with spaces.
    pub fn joined(&self) -> String {
        match self {
            TextInput::Text(text) => text.clone(),
            TextInput::Tokens(tokens) => tokens.join(" "),
        }
    }
}

impl From<&str> for TextInput {
    fn from(text: &str) -> Self {
        TextInput::Text(text.to_string())
    }
}

impl From<String> for TextInput {
    fn from(text: String) -> Self {
        TextInput::Text(text)
    }
}

impl From<Vec<String>> for TextInput {
    fn from(tokens: Vec<String>) -> Self {
        TextInput::Tokens(tokens)
    }
}

/// Errors that can occur anywhere in the embedding service
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Unsupported pooling: {message}")]
    UnsupportedPooling { message: String },

    #[error("Model not loaded: {message}")]
    ModelNotLoaded { message: String },

    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },

    #[error("Connection unreachable: {address} - {reason}")]
    ConnectionUnreachable { address: String, reason: String },

    #[error("Request to {address} timed out after {timeout_ms} ms")]
    RequestTimeout { address: String, timeout_ms: u64 },

    #[error("Model loading failed: {model_name} - {error}")]
    ModelLoadError { model_name: String, error: String },

    #[error("Inference failed: {model_name} - {error}")]
    InferenceError { model_name: String, error: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("IO error: {error}")]
    IoError { error: std::io::Error },

    #[error("TOML parsing error: {error}")]
    TomlError { error: toml::de::Error },
}

impl EmbeddingError {
    /// Wire code reported to clients for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            EmbeddingError::InvalidInput { .. } => ErrorCode::InvalidInput,
            EmbeddingError::UnsupportedPooling { .. } => ErrorCode::UnsupportedPooling,
            EmbeddingError::ModelNotLoaded { .. } => ErrorCode::ModelNotLoaded,
            EmbeddingError::MalformedRequest { .. } => ErrorCode::MalformedRequest,
            _ => ErrorCode::InternalError,
        }
    }

    /// Build the error reply sent back to a client.
    pub fn to_response(&self) -> ErrorResponse {
        let error = match self {
            EmbeddingError::InvalidInput { message }
            | EmbeddingError::UnsupportedPooling { message }
            | EmbeddingError::ModelNotLoaded { message }
            | EmbeddingError::MalformedRequest { message }
            | EmbeddingError::Internal { message } => message.clone(),
            other => other.to_string(),
        };
        ErrorResponse {
            error,
            code: self.code(),
        }
    }

    /// Rebuild a local error from a remote error reply.
    pub fn from_response(response: ErrorResponse) -> Self {
        let message = response.error;
        match response.code {
            ErrorCode::InvalidInput => EmbeddingError::InvalidInput { message },
            ErrorCode::UnsupportedPooling => EmbeddingError::UnsupportedPooling { message },
            ErrorCode::ModelNotLoaded => EmbeddingError::ModelNotLoaded { message },
            ErrorCode::MalformedRequest => EmbeddingError::MalformedRequest { message },
            ErrorCode::InternalError => EmbeddingError::Internal { message },
        }
    }
}

impl From<std::io::Error> for EmbeddingError {
    fn from(error: std::io::Error) -> Self {
        EmbeddingError::IoError { error }
    }
}

impl From<toml::de::Error> for EmbeddingError {
    fn from(error: toml::de::Error) -> Self {
        EmbeddingError::TomlError { error }
    }
}

impl From<rmp_serde::encode::Error> for EmbeddingError {
    fn from(error: rmp_serde::encode::Error) -> Self {
        EmbeddingError::Protocol {
            message: format!("failed to encode payload: {}", error),
        }
    }
}

impl From<rmp_serde::decode::Error> for EmbeddingError {
    fn from(error: rmp_serde::decode::Error) -> Self {
        EmbeddingError::Protocol {
            message: format!("failed to decode payload: {}", error),
        }
    }
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for EmbeddingError {
    fn from(error: ort::Error) -> Self {
        EmbeddingError::ModelLoadError {
            model_name: "onnx".to_string(),
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_survive_the_wire() {
        let errors = vec![
            EmbeddingError::InvalidInput { message: "texts must be a list".to_string() },
            EmbeddingError::UnsupportedPooling { message: "max".to_string() },
            EmbeddingError::ModelNotLoaded { message: "vectors.vec".to_string() },
            EmbeddingError::MalformedRequest { message: "unknown type".to_string() },
        ];

        for error in errors {
            let code = error.code();
            let rebuilt = EmbeddingError::from_response(error.to_response());
            assert_eq!(rebuilt.code(), code);
            assert_eq!(rebuilt.to_string(), error.to_string());
        }
    }

    #[test]
    fn test_unclassified_errors_are_internal() {
        let error = EmbeddingError::ConfigError { message: "bad".to_string() };
        let response = error.to_response();
        assert_eq!(response.code, ErrorCode::InternalError);
        assert!(response.error.contains("bad"));
    }

    #[test]
    fn test_text_input_joined() {
        let tokens = TextInput::from(vec!["machine".to_string(), "learning".to_string()]);
        assert_eq!(tokens.joined(), "machine learning");
        assert_eq!(TextInput::from("plain").joined(), "plain");
    }
}
