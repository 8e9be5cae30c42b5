//! Encoder Dispatcher
//!
//! Owns the one encoder a broker process serves, selected from the backend
//! name at startup, and splits incoming requests into sub-batches for it.

use tracing::{debug, error, info};

use crate::models::model::{BackendKind, Encoder, TextEncoder};
use crate::models::sentence::{SentenceEncoder, SentenceOptions};
use crate::models::static_vectors::StaticVectorEncoder;
use crate::models::{Embedding, EmbeddingError, EmbeddingResult, TextInput};

/// Default number of texts handed to the encoder at once
pub const DEFAULT_BATCH_SIZE: usize = 256;

pub struct EncoderDispatcher {
    backend: String,
    model_reference: String,
    /// `Err` holds the reason a deferred load failed.
    encoder: Result<Box<dyn TextEncoder>, String>,
    default_batch_size: usize,
}

impl EncoderDispatcher {
    /// Load the encoder for `backend`, failing if the model cannot be loaded.
    pub fn load(backend: &str, model: &str, options: &SentenceOptions) -> EmbeddingResult<Self> {
        let kind: BackendKind = backend.parse()?;
        let encoder = Self::load_encoder(backend, kind, model, options)?;
        info!("✅ {} encoder ready ({} dimensions)", backend, encoder.dimension());
        Ok(Self::with_encoder(backend, model, Box::new(encoder)))
    }

    /// Load the encoder for `backend`, but keep the dispatcher usable if the
    /// model fails to load: the failure is logged and every `encode` call
    /// reports `ModelNotLoaded`. Unknown backend names still fail here.
    pub fn load_or_defer(
        backend: &str,
        model: &str,
        options: &SentenceOptions,
    ) -> EmbeddingResult<Self> {
        let kind: BackendKind = backend.parse()?;
        match Self::load_encoder(backend, kind, model, options) {
            Ok(encoder) => Ok(Self::with_encoder(backend, model, Box::new(encoder))),
            Err(e) => {
                error!("❌ Error loading model {}: {}", model, e);
                Ok(Self {
                    backend: backend.to_string(),
                    model_reference: model.to_string(),
                    encoder: Err(e.to_string()),
                    default_batch_size: DEFAULT_BATCH_SIZE,
                })
            }
        }
    }

    /// Wrap an already constructed encoder.
    pub fn from_encoder<E: TextEncoder + 'static>(encoder: E) -> Self {
        let info = encoder.info().clone();
        Self::with_encoder(&info.name, &info.model_path, Box::new(encoder))
    }

    fn with_encoder(backend: &str, model: &str, encoder: Box<dyn TextEncoder>) -> Self {
        Self {
            backend: backend.to_string(),
            model_reference: model.to_string(),
            encoder: Ok(encoder),
            default_batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    fn load_encoder(
        backend: &str,
        kind: BackendKind,
        model: &str,
        options: &SentenceOptions,
    ) -> EmbeddingResult<Encoder> {
        info!("📦 Loading {} backend ({}) from {}", backend, kind, model);
        let encoder = match kind {
            BackendKind::StaticVector => {
                Encoder::StaticVector(StaticVectorEncoder::load(backend, model)?)
            }
            BackendKind::SentenceEmbedding => {
                Encoder::SentenceEmbedding(SentenceEncoder::load(backend, kind, model, options)?)
            }
            BackendKind::ContrastiveEmbedding => {
                Encoder::ContrastiveEmbedding(SentenceEncoder::load(backend, kind, model, options)?)
            }
        };
        Ok(encoder)
    }

    pub fn with_default_batch_size(mut self, batch_size: usize) -> Self {
        self.default_batch_size = batch_size.max(1);
        self
    }

    pub fn default_batch_size(&self) -> usize {
        self.default_batch_size
    }

    /// Logical backend name
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn model_reference(&self) -> &str {
        &self.model_reference
    }

    pub fn is_loaded(&self) -> bool {
        self.encoder.is_ok()
    }

    /// Embedding width, if the model loaded
    pub fn dimension(&self) -> Option<usize> {
        self.encoder.as_ref().ok().map(|encoder| encoder.dimension())
    }

    /// Encode `texts` in consecutive chunks of `batch_size` and concatenate
    /// the results in input order.
    pub fn encode(
        &self,
        texts: &[TextInput],
        pooling: &str,
        batch_size: usize,
    ) -> EmbeddingResult<Vec<Embedding>> {
        let encoder = self.encoder.as_ref().map_err(|reason| EmbeddingError::ModelNotLoaded {
            message: format!(
                "{} model {} is not loaded: {}",
                self.backend, self.model_reference, reason
            ),
        })?;

        if batch_size == 0 {
            return Err(EmbeddingError::InvalidInput {
                message: "batch_size must be at least 1".to_string(),
            });
        }

        let mut embeddings = Vec::with_capacity(texts.len());
        for (i, chunk) in texts.chunks(batch_size).enumerate() {
            debug!("Encoding batch {} ({} texts)", i, chunk.len());
            let vectors = encoder.encode(chunk, pooling)?;
            if vectors.len() != chunk.len() {
                return Err(EmbeddingError::InferenceError {
                    model_name: self.backend.clone(),
                    error: format!(
                        "encoder returned {} rows for {} texts",
                        vectors.len(),
                        chunk.len()
                    ),
                });
            }
            embeddings.extend(vectors);
        }
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::model::ModelInfo;
    use crate::models::static_vectors::VocabularyTable;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// One-wide vectors holding the character count of each text.
    struct LengthEncoder {
        info: ModelInfo,
        calls: AtomicUsize,
    }

    impl LengthEncoder {
        fn new() -> Self {
            Self {
                info: ModelInfo {
                    name: "length".to_string(),
                    model_path: "memory".to_string(),
                    dimension: 1,
                },
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TextEncoder for LengthEncoder {
        fn info(&self) -> &ModelInfo {
            &self.info
        }

        fn encode(&self, texts: &[TextInput], _pooling: &str) -> EmbeddingResult<Vec<Embedding>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.joined().chars().count() as f32]).collect())
        }
    }

    struct ShortEncoder(ModelInfo);

    impl TextEncoder for ShortEncoder {
        fn info(&self) -> &ModelInfo {
            &self.0
        }

        fn encode(&self, _texts: &[TextInput], _pooling: &str) -> EmbeddingResult<Vec<Embedding>> {
            Ok(vec![vec![0.0]])
        }
    }

    fn texts(items: &[&str]) -> Vec<TextInput> {
        items.iter().map(|t| TextInput::from(*t)).collect()
    }

    #[test]
    fn test_batching_is_a_pure_partition() {
        let dispatcher = EncoderDispatcher::from_encoder(LengthEncoder::new());
        let input = texts(&["a", "bb", "ccc", "dddd", "eeeee", "ffffff", "g"]);
        let whole = dispatcher.encode(&input, "mean", input.len()).unwrap();
        for batch_size in 1..=input.len() + 2 {
            assert_eq!(dispatcher.encode(&input, "mean", batch_size).unwrap(), whole);
        }
        assert_eq!(whole.len(), input.len());
    }

    #[test]
    fn test_chunk_count() {
        let encoder = Arc::new(LengthEncoder::new());
        struct Shared(Arc<LengthEncoder>);
        impl TextEncoder for Shared {
            fn info(&self) -> &ModelInfo {
                self.0.info()
            }
            fn encode(
                &self,
                texts: &[TextInput],
                pooling: &str,
            ) -> EmbeddingResult<Vec<Embedding>> {
                self.0.encode(texts, pooling)
            }
        }
        let dispatcher = EncoderDispatcher::from_encoder(Shared(Arc::clone(&encoder)));
        dispatcher.encode(&texts(&["a", "b", "c", "d", "e"]), "mean", 2).unwrap();
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_empty_input_returns_empty_matrix() {
        let dispatcher = EncoderDispatcher::from_encoder(LengthEncoder::new());
        assert!(dispatcher.encode(&[], "mean", 4).unwrap().is_empty());
    }

    #[test]
    fn test_zero_batch_size_is_invalid() {
        let dispatcher = EncoderDispatcher::from_encoder(LengthEncoder::new());
        let result = dispatcher.encode(&texts(&["a"]), "mean", 0);
        assert!(matches!(result, Err(EmbeddingError::InvalidInput { .. })));
    }

    #[test]
    fn test_row_count_mismatch_is_an_error() {
        let info = ModelInfo {
            name: "short".to_string(),
            model_path: "memory".to_string(),
            dimension: 1,
        };
        let dispatcher = EncoderDispatcher::from_encoder(ShortEncoder(info));
        let result = dispatcher.encode(&texts(&["a", "b"]), "mean", 8);
        assert!(matches!(result, Err(EmbeddingError::InferenceError { .. })));
    }

    #[test]
    fn test_load_static_backend() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "2 3").unwrap();
        writeln!(file, "tokio 1 2 3").unwrap();
        writeln!(file, "async 3 2 1").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let dispatcher =
            EncoderDispatcher::load("fasttext", &path, &SentenceOptions::default()).unwrap();
        assert!(dispatcher.is_loaded());
        assert_eq!(dispatcher.dimension(), Some(3));
        let rows = dispatcher.encode(&texts(&["Tokio async"]), "mean", 256).unwrap();
        assert_eq!(rows, vec![vec![2.0, 2.0, 2.0]]);
    }

    #[test]
    fn test_load_fails_fast() {
        let options = SentenceOptions::default();
        let result = EncoderDispatcher::load("fasttext", "/missing/vectors.vec", &options);
        assert!(matches!(result, Err(EmbeddingError::ModelLoadError { .. })));
    }

    #[test]
    fn test_deferred_load_failure_reports_model_not_loaded() {
        let options = SentenceOptions::default();
        let dispatcher =
            EncoderDispatcher::load_or_defer("fasttext", "/missing/vectors.vec", &options).unwrap();
        assert!(!dispatcher.is_loaded());
        assert_eq!(dispatcher.dimension(), None);
        let result = dispatcher.encode(&texts(&["anything"]), "mean", 256);
        assert!(matches!(result, Err(EmbeddingError::ModelNotLoaded { .. })));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let options = SentenceOptions::default();
        let result = EncoderDispatcher::load_or_defer("glove", "glove.txt", &options);
        assert!(matches!(result, Err(EmbeddingError::ConfigError { .. })));
    }

    #[test]
    fn test_static_backend_through_dispatcher_rejects_other_pooling() {
        let table = VocabularyTable::from_entries(vec![("tokio".to_string(), vec![1.0])]).unwrap();
        let dispatcher = EncoderDispatcher::from_encoder(StaticVectorEncoder::new(
            "fasttext",
            "memory",
            Arc::new(table),
        ));
        let result = dispatcher.encode(&texts(&["tokio"]), "max", 1);
        assert!(matches!(result, Err(EmbeddingError::UnsupportedPooling { .. })));
    }
}
