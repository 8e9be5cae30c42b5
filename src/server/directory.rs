//! Backend Directory
//!
//! Maps logical backend names to the port their broker listens on. Built once
//! at startup and handed to brokers and clients; every process in a
//! deployment must agree on it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{EmbeddingError, EmbeddingResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, u16>", into = "BTreeMap<String, u16>")]
pub struct BackendDirectory {
    ports: BTreeMap<String, u16>,
}

impl BackendDirectory {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u16)>,
        S: AsRef<str>,
    {
        Self {
            ports: entries
                .into_iter()
                .map(|(name, port)| (name.as_ref().to_ascii_lowercase(), port))
                .collect(),
        }
    }

    /// Port registered for `backend` (case-insensitive)
    pub fn port(&self, backend: &str) -> Option<u16> {
        self.ports.get(&backend.to_ascii_lowercase()).copied()
    }

    /// `host:port` address of the broker serving `backend`
    pub fn address(&self, host: &str, backend: &str) -> EmbeddingResult<String> {
        let port = self.port(backend).ok_or_else(|| EmbeddingError::ConfigError {
            message: format!("backend '{}' is not in the backend directory", backend),
        })?;
        Ok(format!("{}:{}", host, port))
    }

    pub fn backends(&self) -> impl Iterator<Item = (&str, u16)> {
        self.ports.iter().map(|(name, port)| (name.as_str(), *port))
    }
}

impl Default for BackendDirectory {
    fn default() -> Self {
        Self::new([("sbert", 8080), ("fasttext", 8081), ("simcse", 8082), ("supsimcse", 8083)])
    }
}

impl From<BTreeMap<String, u16>> for BackendDirectory {
    fn from(ports: BTreeMap<String, u16>) -> Self {
        Self::new(ports)
    }
}

impl From<BackendDirectory> for BTreeMap<String, u16> {
    fn from(directory: BackendDirectory) -> Self {
        directory.ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directory() {
        let directory = BackendDirectory::default();
        assert_eq!(directory.port("sbert"), Some(8080));
        assert_eq!(directory.port("fasttext"), Some(8081));
        assert_eq!(directory.port("simCSE"), Some(8082));
        assert_eq!(directory.port("supsimcse"), Some(8083));
        assert_eq!(directory.backends().count(), 4);
    }

    #[test]
    fn test_address_resolution() {
        let directory = BackendDirectory::new([("FastText", 9000u16)]);
        assert_eq!(directory.address("localhost", "fasttext").unwrap(), "localhost:9000");
        assert!(matches!(
            directory.address("localhost", "sbert"),
            Err(EmbeddingError::ConfigError { .. })
        ));
    }
}
