//! Static word-vector backend
//!
//! Loads a fastText-style `.vec` file (header line, then `<word> <d1> ... <dN>`
//! per line) into an immutable table and encodes documents by mean pooling the
//! vectors of their normalized tokens.

use ndarray::{Array1, Array2, ArrayView1};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::model::{ModelInfo, TextEncoder};
use crate::models::{Embedding, EmbeddingError, EmbeddingResult, TextInput, MEAN_POOLING};
use crate::text::TextProcessor;

const LOAD_PROGRESS_INTERVAL: usize = 100_000;

/// Immutable word -> vector mapping, shared read-only between workers.
#[derive(Debug)]
pub struct VocabularyTable {
    index: HashMap<String, usize>,
    vectors: Array2<f32>,
}

impl VocabularyTable {
    /// Load a table from a `.vec` file on disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> EmbeddingResult<Self> {
        let path = path.as_ref();
        info!("📖 Loading word vectors from {}", path.display());
        let file = File::open(path).map_err(|e| EmbeddingError::ModelLoadError {
            model_name: path.display().to_string(),
            error: e.to_string(),
        })?;
        let table = Self::from_reader(BufReader::new(file))?;
        info!("✅ Loaded {} word vectors ({} dimensions)", table.len(), table.dimension());
        Ok(table)
    }

    /// Parse a table from any line source. The first line is a header and is
    /// skipped; blank lines are ignored.
    pub fn from_reader<R: BufRead>(reader: R) -> EmbeddingResult<Self> {
        let mut index = HashMap::new();
        let mut data: Vec<f32> = Vec::new();
        let mut dimension = None;
        let mut rows = 0usize;

        for (line_no, line) in reader.lines().enumerate().skip(1) {
            let line = line?;
            let mut fields = line.split_whitespace();
            let word = match fields.next() {
                Some(word) => word,
                None => continue,
            };

            let values = fields
                .map(|v| v.parse::<f32>())
                .collect::<Result<Vec<f32>, _>>()
                .map_err(|e| Self::parse_error(line_no, format!("invalid component: {}", e)))?;

            let expected = *dimension.get_or_insert(values.len());
            if values.len() != expected || expected == 0 {
                return Err(Self::parse_error(
                    line_no,
                    format!("expected {} components, found {}", expected, values.len()),
                ));
            }

            // Later duplicates win, as with a plain dictionary insert.
            index.insert(word.to_string(), rows);
            data.extend_from_slice(&values);
            rows += 1;

            if rows % LOAD_PROGRESS_INTERVAL == 0 {
                debug!("Loaded {} word vectors", rows);
            }
        }

        let dimension = dimension.ok_or_else(|| EmbeddingError::ModelLoadError {
            model_name: "vocabulary".to_string(),
            error: "no word vectors found".to_string(),
        })?;
        Self::build(index, data, rows, dimension)
    }

    /// Build a table from in-memory entries; every vector must share one width.
    pub fn from_entries(entries: Vec<(String, Vec<f32>)>) -> EmbeddingResult<Self> {
        let dimension = entries.first().map(|(_, v)| v.len()).unwrap_or(0);
        if dimension == 0 {
            return Err(EmbeddingError::ModelLoadError {
                model_name: "vocabulary".to_string(),
                error: "no word vectors found".to_string(),
            });
        }

        let mut index = HashMap::with_capacity(entries.len());
        let mut data = Vec::with_capacity(entries.len() * dimension);
        let rows = entries.len();
        for (row, (word, vector)) in entries.into_iter().enumerate() {
            if vector.len() != dimension {
                return Err(EmbeddingError::ModelLoadError {
                    model_name: "vocabulary".to_string(),
                    error: format!(
                        "'{}' has {} components, expected {}",
                        word,
                        vector.len(),
                        dimension
                    ),
                });
            }
            index.insert(word, row);
            data.extend(vector);
        }
        Self::build(index, data, rows, dimension)
    }

    fn build(
        index: HashMap<String, usize>,
        data: Vec<f32>,
        rows: usize,
        dimension: usize,
    ) -> EmbeddingResult<Self> {
        let vectors = Array2::from_shape_vec((rows, dimension), data).map_err(|e| {
            EmbeddingError::ModelLoadError {
                model_name: "vocabulary".to_string(),
                error: e.to_string(),
            }
        })?;
        Ok(Self { index, vectors })
    }

    fn parse_error(line_no: usize, error: String) -> EmbeddingError {
        EmbeddingError::ModelLoadError {
            model_name: "vocabulary".to_string(),
            error: format!("line {}: {}", line_no + 1, error),
        }
    }

    pub fn get(&self, word: &str) -> Option<ArrayView1<'_, f32>> {
        self.index.get(word).map(|&row| self.vectors.row(row))
    }

    /// Number of distinct words
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.vectors.ncols()
    }
}

/// Mean-pooled word-vector encoder.
pub struct StaticVectorEncoder {
    info: ModelInfo,
    table: Arc<VocabularyTable>,
    processor: TextProcessor,
    unknown: Array1<f32>,
}

impl StaticVectorEncoder {
    pub fn new(name: &str, model_path: &str, table: Arc<VocabularyTable>) -> Self {
        let dimension = table.dimension();
        Self {
            info: ModelInfo {
                name: name.to_string(),
                model_path: model_path.to_string(),
                dimension,
            },
            table,
            processor: TextProcessor::english(),
            unknown: Array1::zeros(dimension),
        }
    }

    /// Load the vocabulary from `model_path` and build the encoder.
    pub fn load(name: &str, model_path: &str) -> EmbeddingResult<Self> {
        let table = VocabularyTable::from_file(model_path).map_err(|e| match e {
            EmbeddingError::ModelLoadError { error, .. } => EmbeddingError::ModelLoadError {
                model_name: model_path.to_string(),
                error,
            },
            other => other,
        })?;
        Ok(Self::new(name, model_path, Arc::new(table)))
    }

    pub fn table(&self) -> &Arc<VocabularyTable> {
        &self.table
    }

    fn tokens(&self, text: &TextInput) -> Vec<String> {
        match text {
            TextInput::Text(text) => self.processor.get_valid_tokens("", text, false),
            TextInput::Tokens(tokens) => self.processor.normalize_tokens(tokens, false),
        }
    }

    /// Average every token vector. Out-of-vocabulary tokens contribute the
    /// zero vector and still count towards the denominator.
    fn encode_one(&self, text: &TextInput) -> Embedding {
        let tokens = self.tokens(text);
        if tokens.is_empty() {
            return self.unknown.to_vec();
        }

        let mut sum = Array1::<f32>::zeros(self.table.dimension());
        for token in &tokens {
            match self.table.get(token) {
                Some(vector) => sum += &vector,
                None => sum += &self.unknown,
            }
        }
        (sum / tokens.len() as f32).to_vec()
    }
}

impl TextEncoder for StaticVectorEncoder {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn encode(&self, texts: &[TextInput], pooling: &str) -> EmbeddingResult<Vec<Embedding>> {
        if pooling != MEAN_POOLING {
            return Err(EmbeddingError::UnsupportedPooling {
                message: format!(
                    "cannot identify pooling method '{}'; the {} backend only supports '{}'",
                    pooling, self.info.name, MEAN_POOLING
                ),
            });
        }
        Ok(texts.iter().map(|text| self.encode_one(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn fixture_table() -> Arc<VocabularyTable> {
        Arc::new(
            VocabularyTable::from_entries(vec![
                ("rust".to_string(), vec![1.0, 0.0, 2.0]),
                ("memory".to_string(), vec![0.0, 4.0, 2.0]),
                ("safety".to_string(), vec![2.0, 2.0, 2.0]),
                ("compiler".to_string(), vec![-1.0, 0.5, 0.0]),
            ])
            .unwrap(),
        )
    }

    fn fixture_encoder() -> StaticVectorEncoder {
        StaticVectorEncoder::new("fasttext", "fixture", fixture_table())
    }

    #[test]
    fn test_single_known_word_returns_stored_vector() {
        let encoder = fixture_encoder();
        let rows = encoder.encode(&[TextInput::from("Rust")], "mean").unwrap();
        assert_eq!(rows, vec![vec![1.0, 0.0, 2.0]]);
    }

    #[test]
    fn test_empty_document_returns_zero_vector() {
        let encoder = fixture_encoder();
        let rows = encoder
            .encode(&[TextInput::from(""), TextInput::from("the of and !!")], "mean")
            .unwrap();
        assert_eq!(rows, vec![vec![0.0; 3], vec![0.0; 3]]);
    }

    #[test]
    fn test_mean_counts_unknown_tokens() {
        let encoder = fixture_encoder();
        // "rust" + "memory" + one unknown word: the unknown zero vector dilutes the mean
        let rows = encoder
            .encode(&[TextInput::from("rust memory zyzzyva")], "mean")
            .unwrap();
        assert_eq!(rows[0], vec![1.0 / 3.0, 4.0 / 3.0, 4.0 / 3.0]);
    }

    #[test]
    fn test_pre_split_tokens_skip_the_tokenizer() {
        let encoder = fixture_encoder();
        let tokens = TextInput::from(vec!["Memory".to_string(), "safety!".to_string()]);
        let rows = encoder.encode(&[tokens], "mean").unwrap();
        assert_eq!(rows[0], vec![1.0, 3.0, 2.0]);
    }

    #[test]
    fn test_unsupported_pooling_always_fails() {
        let encoder = fixture_encoder();
        for pooling in ["max", "cls", "sum", ""] {
            let result = encoder.encode(&[TextInput::from("rust")], pooling);
            assert!(matches!(result, Err(EmbeddingError::UnsupportedPooling { .. })));
        }
        let result = encoder.encode(&[TextInput::from("")], "max");
        assert!(matches!(result, Err(EmbeddingError::UnsupportedPooling { .. })));
    }

    #[test]
    fn test_row_count_and_order() {
        let encoder = fixture_encoder();
        let texts: Vec<TextInput> = ["safety", "compiler", "unknown words", "rust"]
            .iter()
            .map(|t| TextInput::from(*t))
            .collect();
        let rows = encoder.encode(&texts, "mean").unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], vec![2.0, 2.0, 2.0]);
        assert_eq!(rows[1], vec![-1.0, 0.5, 0.0]);
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
        assert_eq!(rows[3], vec![1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_from_reader_skips_header() {
        let source = "3 2\nalpha 0.5 1.5\n\nbeta -1 2\ngamma 3 4\n";
        let table = VocabularyTable::from_reader(Cursor::new(source)).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.dimension(), 2);
        assert_eq!(table.get("beta").unwrap().to_vec(), vec![-1.0, 2.0]);
        assert!(table.get("3").is_none());
    }

    #[test]
    fn test_from_reader_rejects_ragged_rows() {
        let source = "2 3\nalpha 1 2 3\nbeta 1 2\n";
        let error = VocabularyTable::from_reader(Cursor::new(source)).unwrap_err();
        assert!(error.to_string().contains("line 3"));
    }

    #[test]
    fn test_from_reader_rejects_header_only() {
        let result = VocabularyTable::from_reader(Cursor::new("0 300\n"));
        assert!(matches!(result, Err(EmbeddingError::ModelLoadError { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "2 4").unwrap();
        writeln!(file, "vector 0.1 0.2 0.3 0.4").unwrap();
        writeln!(file, "search 1 1 1 1").unwrap();

        let path = file.path().to_string_lossy().to_string();
        let encoder = StaticVectorEncoder::load("fasttext", &path).unwrap();
        assert_eq!(encoder.dimension(), 4);
        assert_eq!(encoder.table().len(), 2);
        let rows = encoder.encode(&[TextInput::from("Search!")], "mean").unwrap();
        assert_eq!(rows[0], vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_load_missing_file() {
        let result = StaticVectorEncoder::load("fasttext", "/nonexistent/vectors.vec");
        match result {
            Err(EmbeddingError::ModelLoadError { model_name, .. }) => {
                assert_eq!(model_name, "/nonexistent/vectors.vec");
            }
            _ => panic!("expected a load error"),
        }
    }
}
