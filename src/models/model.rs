//! Model definitions and traits
//!
//! This module defines the encoder contract shared by every backend and the
//! closed set of built-in encoder variants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::sentence::SentenceEncoder;
use crate::models::static_vectors::StaticVectorEncoder;
use crate::models::{Embedding, EmbeddingError, EmbeddingResult, TextInput};

/// The family of encoder behind a logical backend name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Word-vector lookup with mean pooling (fastText style)
    StaticVector,
    /// Sentence-transformer model with its own pooling
    SentenceEmbedding,
    /// Contrastively trained sentence model (SimCSE style)
    ContrastiveEmbedding,
}

impl FromStr for BackendKind {
    type Err = EmbeddingError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "fasttext" | "static_vector" => Ok(BackendKind::StaticVector),
            "sbert" | "sentence_embedding" => Ok(BackendKind::SentenceEmbedding),
            "simcse" | "supsimcse" | "contrastive_embedding" => {
                Ok(BackendKind::ContrastiveEmbedding)
            }
            other => Err(EmbeddingError::ConfigError {
                message: format!("unknown embedding backend '{}'", other),
            }),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::StaticVector => "static_vector",
            BackendKind::SentenceEmbedding => "sentence_embedding",
            BackendKind::ContrastiveEmbedding => "contrastive_embedding",
        };
        f.write_str(name)
    }
}

/// Information about a loaded model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Logical backend name (as found in the backend directory)
    pub name: String,
    /// Model name or path it was loaded from
    pub model_path: String,
    /// Embedding dimension
    pub dimension: usize,
}

/// Core encoder contract: one output row per input text, in input order.
///
/// Implementations are shared by every worker thread, so `encode` takes
/// `&self` and must be safe to call concurrently.
pub trait TextEncoder: Send + Sync {
    /// Get model information
    fn info(&self) -> &ModelInfo;

    /// Encode a batch of texts into one vector per text.
    fn encode(&self, texts: &[TextInput], pooling: &str) -> EmbeddingResult<Vec<Embedding>>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize {
        self.info().dimension
    }
}

/// The built-in encoder variants.
pub enum Encoder {
    StaticVector(StaticVectorEncoder),
    SentenceEmbedding(SentenceEncoder),
    ContrastiveEmbedding(SentenceEncoder),
}

impl Encoder {
    pub fn kind(&self) -> BackendKind {
        match self {
            Encoder::StaticVector(_) => BackendKind::StaticVector,
            Encoder::SentenceEmbedding(_) => BackendKind::SentenceEmbedding,
            Encoder::ContrastiveEmbedding(_) => BackendKind::ContrastiveEmbedding,
        }
    }
}

impl TextEncoder for Encoder {
    fn info(&self) -> &ModelInfo {
        match self {
            Encoder::StaticVector(encoder) => encoder.info(),
            Encoder::SentenceEmbedding(encoder) | Encoder::ContrastiveEmbedding(encoder) => {
                encoder.info()
            }
        }
    }

    fn encode(&self, texts: &[TextInput], pooling: &str) -> EmbeddingResult<Vec<Embedding>> {
        match self {
            Encoder::StaticVector(encoder) => encoder.encode(texts, pooling),
            // Sentence models pool internally; the requested mode is ignored.
            Encoder::SentenceEmbedding(encoder) | Encoder::ContrastiveEmbedding(encoder) => {
                encoder.encode(texts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::static_vectors::VocabularyTable;
    use std::sync::Arc;

    #[test]
    fn test_backend_kind_from_directory_names() {
        assert_eq!("fasttext".parse::<BackendKind>().unwrap(), BackendKind::StaticVector);
        assert_eq!("SBERT".parse::<BackendKind>().unwrap(), BackendKind::SentenceEmbedding);
        assert_eq!("simCSE".parse::<BackendKind>().unwrap(), BackendKind::ContrastiveEmbedding);
        assert_eq!("supsimcse".parse::<BackendKind>().unwrap(), BackendKind::ContrastiveEmbedding);
        assert!("word2vec".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_encoder_delegates_to_variant() {
        let table = VocabularyTable::from_entries(vec![
            ("rust".to_string(), vec![1.0, 2.0]),
        ])
        .unwrap();
        let encoder = Encoder::StaticVector(StaticVectorEncoder::new(
            "fasttext",
            "memory",
            Arc::new(table),
        ));

        assert_eq!(encoder.kind(), BackendKind::StaticVector);
        assert_eq!(encoder.dimension(), 2);
        let rows = encoder.encode(&[TextInput::from("rust")], "mean").unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0]]);
    }
}
