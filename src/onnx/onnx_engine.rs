//! # ONNX Embedding Engine
//!
//! Runs a transformer exported to ONNX (sentence-transformers, SimCSE, ...)
//! through ONNX Runtime and pools its `last_hidden_state` into one vector per
//! text.
//!
//! Every text is tokenized and run on its own, so no padding is shared
//! between texts and the output for a text never depends on the rest of the
//! batch.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let engine = OnnxEmbeddingEngine::new("models/all-MiniLM-L6-v2/model.onnx",
//!     "models/all-MiniLM-L6-v2/tokenizer.json", &OnnxConfig::default())?;
//! let embeddings = engine.embed_texts(&["Hello world".to_string()])?;
//! ```

use ndarray::ArrayViewD;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info, instrument};

use crate::models::sentence::TokenPooling;
use crate::models::{Embedding, EmbeddingError, EmbeddingResult};

/// Configuration for ONNX Runtime
#[derive(Debug, Clone)]
pub struct OnnxConfig {
    /// Path to the ONNX Runtime library (DLL/so/dylib); empty keeps `ORT_DYLIB_PATH`
    pub library_path: String,
    /// Thread pool size for inference
    pub thread_pool_size: usize,
    /// Maximum sequence length; longer inputs are truncated
    pub max_seq_length: usize,
    /// Name of the token-level output tensor
    pub output_name: String,
    /// L2-normalize pooled embeddings
    pub normalize: bool,
    /// How token states are reduced to one vector
    pub pooling: TokenPooling,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            library_path: std::env::var("ORT_DYLIB_PATH").unwrap_or_default(),
            thread_pool_size: 4,
            max_seq_length: 256,
            output_name: "last_hidden_state".to_string(),
            normalize: false,
            pooling: TokenPooling::Mean,
        }
    }
}

/// ONNX-based embedding engine for generating text embeddings
#[derive(Debug)]
pub struct OnnxEmbeddingEngine {
    /// Inference needs exclusive access to the session, so concurrent
    /// workers serialize here. Tokenization runs outside the lock.
    session: Mutex<Session>,
    /// HuggingFace tokenizer for text preprocessing
    tokenizer: Tokenizer,
    config: OnnxConfig,
    uses_token_type_ids: bool,
    dimension: usize,
}

impl OnnxEmbeddingEngine {
    /// Create a new ONNX embedding engine and measure its output dimension.
    pub fn new(
        model_path: &str,
        tokenizer_path: &str,
        onnx_config: &OnnxConfig,
    ) -> EmbeddingResult<Self> {
        info!("Initializing ONNX embedding engine with model: {}", model_path);

        if !onnx_config.library_path.is_empty() {
            // Read by ort when the runtime is first initialized.
            std::env::set_var("ORT_DYLIB_PATH", &onnx_config.library_path);
            debug!("Set ORT_DYLIB_PATH to: {}", onnx_config.library_path);
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(onnx_config.thread_pool_size)?
            .commit_from_file(model_path)
            .map_err(|e| EmbeddingError::ModelLoadError {
                model_name: model_path.to_string(),
                error: format!("Failed to load ONNX model: {}", e),
            })?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| EmbeddingError::ModelLoadError {
                model_name: model_path.to_string(),
                error: format!("Failed to load tokenizer: {}", e),
            })?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: onnx_config.max_seq_length,
                ..Default::default()
            }))
            .map_err(|e| EmbeddingError::ModelLoadError {
                model_name: model_path.to_string(),
                error: format!("Failed to configure truncation: {}", e),
            })?;

        let uses_token_type_ids = session.inputs.iter().any(|input| input.name == "token_type_ids");

        let mut engine = Self {
            session: Mutex::new(session),
            tokenizer,
            config: onnx_config.clone(),
            uses_token_type_ids,
            dimension: 0,
        };

        // Output width is a property of the graph; read it off a sample run.
        let sample = engine.embed_text("dimension check")?;
        engine.dimension = sample.len();

        info!(
            "ONNX embedding engine ready: {} dimensions, {} threads",
            engine.dimension, onnx_config.thread_pool_size
        );
        Ok(engine)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Generate embeddings for a batch of texts, one row per text.
    #[instrument(skip(self, texts), fields(text_count = texts.len()))]
    pub fn embed_texts(&self, texts: &[String]) -> EmbeddingResult<Vec<Embedding>> {
        debug!("Generating embeddings for {} texts", texts.len());
        texts.iter().map(|text| self.embed_text(text)).collect()
    }

    fn embed_text(&self, text: &str) -> EmbeddingResult<Embedding> {
        let encoding = self.tokenizer.encode(text, true)
            .map_err(|e| Self::inference_error(format!("Tokenization failed: {}", e)))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&x| x as i64).collect();
        let attention_mask = encoding.get_attention_mask();
        let mask_vec: Vec<i64> = attention_mask.iter().map(|&x| x as i64).collect();
        let seq_len = input_ids.len() as i64;

        let mut inputs = vec![
            ("input_ids", Self::tensor(seq_len, input_ids)?),
            ("attention_mask", Self::tensor(seq_len, mask_vec)?),
        ];
        if self.uses_token_type_ids {
            // All zeros for a single sequence
            inputs.push(("token_type_ids", Self::tensor(seq_len, vec![0i64; seq_len as usize])?));
        }

        // Copy the hidden states out so the session lock is released before pooling.
        let (dims, hidden_states) = {
            let mut session = lock_recovering(&self.session);
            let outputs = session
                .run(inputs)
                .map_err(|e| Self::inference_error(format!("ONNX inference failed: {}", e)))?;
            let (shape, data) = outputs[self.config.output_name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    Self::inference_error(format!("Failed to extract output tensor: {}", e))
                })?;
            let dims: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
            (dims, data.to_vec())
        };

        let output_array = ndarray::ArrayView::from_shape(dims.as_slice(), hidden_states.as_slice())
            .map_err(|e| {
                Self::inference_error(format!("Failed to create output array view: {:?}", e))
            })?;

        let pooled = match self.config.pooling {
            TokenPooling::Mean => Self::mean_pooling(&output_array, attention_mask)?,
            TokenPooling::Cls => Self::cls_pooling(&output_array)?,
        };

        if self.config.normalize {
            Ok(Self::normalize_embedding(&pooled))
        } else {
            Ok(pooled)
        }
    }

    fn tensor(seq_len: i64, values: Vec<i64>) -> EmbeddingResult<Tensor<i64>> {
        Tensor::from_array(([1i64, seq_len], values))
            .map_err(|e| Self::inference_error(format!("Failed to create input tensor: {}", e)))
    }

    fn inference_error(error: String) -> EmbeddingError {
        EmbeddingError::InferenceError {
            model_name: "onnx".to_string(),
            error,
        }
    }

    fn check_shape(output_tensor: &ArrayViewD<f32>) -> EmbeddingResult<(usize, usize)> {
        let shape = output_tensor.shape();
        if shape.len() != 3 || shape[1] == 0 {
            return Err(Self::inference_error(format!(
                "Expected [1, seq_len, hidden] output tensor, got {:?}",
                shape
            )));
        }
        Ok((shape[1], shape[2]))
    }

    /// Average the token states whose attention mask is set.
    fn mean_pooling(
        output_tensor: &ArrayViewD<f32>,
        attention_mask: &[u32],
    ) -> EmbeddingResult<Embedding> {
        let (seq_len, hidden_size) = Self::check_shape(output_tensor)?;
        if attention_mask.len() != seq_len {
            return Err(Self::inference_error(format!(
                "Attention mask length {} doesn't match sequence length {}",
                attention_mask.len(),
                seq_len
            )));
        }

        let mut pooled = vec![0.0f32; hidden_size];
        let mut valid_tokens = 0;
        for seq_idx in 0..seq_len {
            if attention_mask[seq_idx] == 1 {
                for hidden_idx in 0..hidden_size {
                    pooled[hidden_idx] += output_tensor[[0, seq_idx, hidden_idx]];
                }
                valid_tokens += 1;
            }
        }

        if valid_tokens == 0 {
            return Err(Self::inference_error(
                "No valid tokens found in attention mask".to_string(),
            ));
        }
        for val in &mut pooled {
            *val /= valid_tokens as f32;
        }
        Ok(pooled)
    }

    /// Take the state of the first (`[CLS]`) token.
    fn cls_pooling(output_tensor: &ArrayViewD<f32>) -> EmbeddingResult<Embedding> {
        let (_, hidden_size) = Self::check_shape(output_tensor)?;
        Ok((0..hidden_size).map(|h| output_tensor[[0, 0, h]]).collect())
    }

    /// L2 normalization; the zero vector is returned unchanged.
    fn normalize_embedding(embedding: &[f32]) -> Embedding {
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return embedding.to_vec();
        }
        embedding.iter().map(|x| x / norm).collect()
    }
}

/// Lock `mutex`, taking the guard back if an earlier holder panicked.
fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
