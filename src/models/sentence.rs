//! Sentence-level transformer backends (sentence-transformers and SimCSE)
//!
//! Both wrap a model that pools internally, so the requested pooling mode is
//! not consulted. Token states are averaged over the attention mask for both
//! kinds unless `embedding.token_pooling = "cls"` selects the `[CLS]` state.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::models::model::{BackendKind, ModelInfo};
use crate::models::{Embedding, EmbeddingError, EmbeddingResult, TextInput};

/// Token-level reduction used by a transformer backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPooling {
    Mean,
    Cls,
}

impl Default for TokenPooling {
    fn default() -> Self {
        TokenPooling::Mean
    }
}

/// Settings a transformer backend is loaded with
#[derive(Debug, Clone)]
pub struct SentenceOptions {
    pub tokenizer_path: Option<String>,
    pub max_sequence_length: usize,
    pub normalize: bool,
    pub num_threads: usize,
    pub token_pooling: TokenPooling,
}

impl Default for SentenceOptions {
    fn default() -> Self {
        Self {
            tokenizer_path: None,
            max_sequence_length: 256,
            normalize: false,
            num_threads: 4,
            token_pooling: TokenPooling::Mean,
        }
    }
}

/// Resolve `(model.onnx, tokenizer.json)` from a model reference that is
/// either a model directory or a path to the `.onnx` file.
pub fn resolve_model_files(model_ref: &str, tokenizer_path: Option<&str>) -> (String, String) {
    let path = Path::new(model_ref);
    let (model, dir) = if path.is_dir() {
        (path.join("model.onnx"), path.to_path_buf())
    } else {
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        (path.to_path_buf(), dir)
    };
    let tokenizer = match tokenizer_path {
        Some(tokenizer) => tokenizer.to_string(),
        None => dir.join("tokenizer.json").to_string_lossy().to_string(),
    };
    (model.to_string_lossy().to_string(), tokenizer)
}

/// Transformer encoder shared by the sentence-embedding and contrastive
/// variants.
pub struct SentenceEncoder {
    info: ModelInfo,
    #[cfg(feature = "onnx")]
    engine: crate::onnx::OnnxEmbeddingEngine,
}

impl SentenceEncoder {
    #[cfg(feature = "onnx")]
    pub fn load(
        name: &str,
        kind: BackendKind,
        model_ref: &str,
        options: &SentenceOptions,
    ) -> EmbeddingResult<Self> {
        let (model_path, tokenizer_path) =
            resolve_model_files(model_ref, options.tokenizer_path.as_deref());
        info!(
            "🧠 Loading {} model {} ({:?} pooling)",
            kind, model_path, options.token_pooling
        );

        let onnx_config = crate::onnx::OnnxConfig {
            thread_pool_size: options.num_threads,
            max_seq_length: options.max_sequence_length,
            normalize: options.normalize,
            pooling: options.token_pooling,
            ..Default::default()
        };
        let engine =
            crate::onnx::OnnxEmbeddingEngine::new(&model_path, &tokenizer_path, &onnx_config)
                .map_err(|e| match e {
                    EmbeddingError::ModelLoadError { error, .. } => EmbeddingError::ModelLoadError {
                        model_name: model_ref.to_string(),
                        error,
                    },
                    other => EmbeddingError::ModelLoadError {
                        model_name: model_ref.to_string(),
                        error: other.to_string(),
                    },
                })?;

        Ok(Self {
            info: ModelInfo {
                name: name.to_string(),
                model_path: model_ref.to_string(),
                dimension: engine.dimension(),
            },
            engine,
        })
    }

    #[cfg(not(feature = "onnx"))]
    pub fn load(
        name: &str,
        kind: BackendKind,
        model_ref: &str,
        _options: &SentenceOptions,
    ) -> EmbeddingResult<Self> {
        info!("🧠 Cannot load {} model for {}: ONNX support not compiled in", kind, name);
        Err(EmbeddingError::ModelLoadError {
            model_name: model_ref.to_string(),
            error: "the transformer backends require the `onnx` feature".to_string(),
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn encode(&self, texts: &[TextInput]) -> EmbeddingResult<Vec<Embedding>> {
        let texts: Vec<String> = texts.iter().map(TextInput::joined).collect();
        self.run(&texts)
    }

    #[cfg(feature = "onnx")]
    fn run(&self, texts: &[String]) -> EmbeddingResult<Vec<Embedding>> {
        self.engine.embed_texts(texts).map_err(|e| EmbeddingError::InferenceError {
            model_name: self.info.name.clone(),
            error: e.to_string(),
        })
    }

    #[cfg(not(feature = "onnx"))]
    fn run(&self, _texts: &[String]) -> EmbeddingResult<Vec<Embedding>> {
        Err(EmbeddingError::ModelNotLoaded {
            message: format!("{} requires the `onnx` feature", self.info.name),
        })
    }
}
