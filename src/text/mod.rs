//! Text normalization for the static-vector backend
//!
//! Tokenizes, lowercases, strips everything outside `[a-zA-Z0-9-]`, drops
//! stop-words and one-character leftovers, and optionally stems.

pub mod stopwords;

use once_cell::sync::Lazy;
use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashSet;

pub use stopwords::ENGLISH_STOP_WORDS;

/// Word tokens (hyphenated compounds kept whole), clitics such as `'s`, and
/// single punctuation marks.
static TOKEN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\w+(?:-\w+)*|'\w+|[^\w\s]").expect("valid token pattern"));

static DISALLOWED_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9\-]").expect("valid character filter"));

pub struct TextProcessor {
    stemmer: Stemmer,
    stop_words: HashSet<String>,
}

impl TextProcessor {
    /// English stop-words and the English snowball stemmer.
    pub fn english() -> Self {
        Self::with_stop_words(ENGLISH_STOP_WORDS.iter().copied())
    }

    pub fn with_stop_words<'a, I>(stop_words: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            stemmer: Stemmer::create(Algorithm::English),
            stop_words: stop_words.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn is_stop_word(&self, token: &str) -> bool {
        self.stop_words.contains(token)
    }

    pub fn is_valid(&self, token: &str) -> bool {
        token.len() > 1 && !self.is_stop_word(token)
    }

    /// Normalize one token. Returns an empty string when the token should be
    /// discarded.
    pub fn normalize(&self, token: &str, use_stemmer: bool) -> String {
        let lowered = token.to_lowercase();
        let normalized = DISALLOWED_CHARS.replace_all(&lowered, "");
        if !self.is_valid(&normalized) {
            return String::new();
        }
        if use_stemmer {
            self.stemmer.stem(&normalized).into_owned()
        } else {
            normalized.into_owned()
        }
    }

    /// Split free text into word and punctuation tokens.
    pub fn tokenize(content: &str) -> Vec<&str> {
        TOKEN_PATTERN.find_iter(content).map(|m| m.as_str()).collect()
    }

    /// Tokenize `content`, append the whitespace-split `title`, and keep every
    /// token that survives normalization. Order and duplicates are preserved.
    pub fn get_valid_tokens(&self, title: &str, content: &str, use_stemmer: bool) -> Vec<String> {
        let content = content.to_lowercase();
        let title = title.to_lowercase();
        Self::tokenize(&content)
            .into_iter()
            .chain(title.split_whitespace())
            .map(|token| self.normalize(token, use_stemmer))
            .filter(|token| !token.is_empty())
            .collect()
    }

    /// Normalize tokens that were already split by the caller.
    pub fn normalize_tokens(&self, tokens: &[String], use_stemmer: bool) -> Vec<String> {
        tokens
            .iter()
            .map(|token| self.normalize(token, use_stemmer))
            .filter(|token| !token.is_empty())
            .collect()
    }
}

impl Default for TextProcessor {
    fn default() -> Self {
        Self::english()
    }
}
