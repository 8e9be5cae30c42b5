//! Embedding Client
//!
//! Connects to the broker serving one backend, verifies it with an `info`
//! handshake, and encodes texts in consecutive batches, one outstanding
//! request at a time.

use ndarray::Array2;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::models::{Embedding, EmbeddingError, EmbeddingResult, TextInput};
use crate::protocol::{
    deserialize_reply, serialize_request, BackendInfo, ProtocolMessage, Reply, Request,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use crate::server::{BackendDirectory, ServerConfig};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on TCP connect plus the handshake
    pub connect_timeout: Duration,
    /// Bound on each batch round trip
    pub request_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(300),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            max_message_size: config.network.max_message_size,
        }
    }
}

pub struct EmbeddingClient {
    stream: TcpStream,
    address: String,
    info: BackendInfo,
    config: ClientConfig,
}

impl EmbeddingClient {
    /// Connect to the broker the directory lists for `backend` on `host`.
    pub async fn connect(
        host: &str,
        backend: &str,
        directory: &BackendDirectory,
        config: ClientConfig,
    ) -> EmbeddingResult<Self> {
        let address = directory.address(host, backend)?;
        Self::connect_addr(&address, backend, config).await
    }

    /// Connect to `address` and check that it serves `backend`.
    ///
    /// A refused connection, a peer that does not answer the handshake in
    /// time, or a broker serving another backend all yield
    /// `ConnectionUnreachable`.
    pub async fn connect_addr(
        address: &str,
        backend: &str,
        config: ClientConfig,
    ) -> EmbeddingResult<Self> {
        let unreachable = |reason: String| EmbeddingError::ConnectionUnreachable {
            address: address.to_string(),
            reason,
        };

        let mut stream = match timeout(config.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => {
                return Err(unreachable(format!(
                    "no connection within {} ms",
                    config.connect_timeout.as_millis()
                )))
            }
        };
        stream.set_nodelay(true)?;

        let handshake = serialize_request(&Request::info())?;
        let payload = match timeout(
            config.connect_timeout,
            round_trip(&mut stream, handshake, config.max_message_size),
        )
        .await
        {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => return Err(unreachable(format!("handshake failed: {}", e))),
            Err(_) => {
                return Err(unreachable(format!(
                    "no handshake reply within {} ms",
                    config.connect_timeout.as_millis()
                )))
            }
        };

        let info = match deserialize_reply(&payload) {
            Ok(Reply::Info(info)) if info.backend.eq_ignore_ascii_case(backend) => info,
            Ok(Reply::Info(info)) => {
                return Err(unreachable(format!(
                    "address serves backend '{}', expected '{}'",
                    info.backend, backend
                )))
            }
            Ok(Reply::Error(response)) => return Err(unreachable(response.error)),
            Ok(Reply::Embeddings(_)) => {
                return Err(unreachable("unexpected handshake reply".to_string()))
            }
            Err(e) => return Err(unreachable(e.to_string())),
        };

        info!(
            "🔗 Connected to {} backend at {} ({} dimensions, {} workers)",
            info.backend, address, info.dimension, info.workers
        );
        Ok(Self {
            stream,
            address: address.to_string(),
            info,
            config,
        })
    }

    pub fn backend_info(&self) -> &BackendInfo {
        &self.info
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Encode `texts` in consecutive chunks of `batch_size` and stack the
    /// replies into one `(texts.len(), dimension)` matrix. Any reply of the
    /// wrong shape fails the whole call.
    pub async fn encode(
        &mut self,
        texts: &[TextInput],
        pooling: Option<&str>,
        batch_size: usize,
    ) -> EmbeddingResult<Array2<f32>> {
        if batch_size == 0 {
            return Err(EmbeddingError::InvalidInput {
                message: "batch_size must be at least 1".to_string(),
            });
        }

        let dimension = self.info.dimension;
        let mut values = Vec::with_capacity(texts.len() * dimension);
        for chunk in texts.chunks(batch_size) {
            let rows = self.encode_batch(chunk, pooling, batch_size).await?;
            if rows.len() != chunk.len() {
                return Err(EmbeddingError::Protocol {
                    message: format!(
                        "expected {} rows, broker returned {}",
                        chunk.len(),
                        rows.len()
                    ),
                });
            }
            for row in rows {
                if row.len() != dimension {
                    return Err(EmbeddingError::Protocol {
                        message: format!("expected rows of width {}, got {}", dimension, row.len()),
                    });
                }
                values.extend(row);
            }
        }

        Array2::from_shape_vec((texts.len(), dimension), values).map_err(|e| {
            EmbeddingError::Protocol {
                message: e.to_string(),
            }
        })
    }

    async fn encode_batch(
        &mut self,
        chunk: &[TextInput],
        pooling: Option<&str>,
        batch_size: usize,
    ) -> EmbeddingResult<Vec<Embedding>> {
        let payload = serialize_request(&Request::encode(chunk, pooling, Some(batch_size))?)?;
        debug!("📨 Sending {} texts to {}", chunk.len(), self.address);

        let reply = match timeout(
            self.config.request_timeout,
            round_trip(&mut self.stream, payload, self.config.max_message_size),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                return Err(EmbeddingError::ConnectionUnreachable {
                    address: self.address.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(EmbeddingError::RequestTimeout {
                    address: self.address.clone(),
                    timeout_ms: self.config.request_timeout.as_millis() as u64,
                })
            }
        };

        match deserialize_reply(&reply)? {
            Reply::Embeddings(rows) => Ok(rows),
            Reply::Error(response) => Err(EmbeddingError::from_response(response)),
            Reply::Info(_) => Err(EmbeddingError::Protocol {
                message: "broker answered an encode request with backend info".to_string(),
            }),
        }
    }

    /// Close the connection
    pub async fn terminate(mut self) -> EmbeddingResult<()> {
        self.stream.shutdown().await?;
        debug!("🔌 Disconnected from {}", self.address);
        Ok(())
    }
}

/// Send one request and wait for the frame that answers it. Frames answering
/// earlier requests (late replies after a timeout) are skipped.
async fn round_trip(
    stream: &mut TcpStream,
    payload: Vec<u8>,
    max_message_size: usize,
) -> io::Result<Vec<u8>> {
    let request = ProtocolMessage::new(payload);
    request.write_to(stream).await?;

    loop {
        let reply = ProtocolMessage::read_from(stream, max_message_size).await?;
        if reply.reply_to == Some(request.message_id) {
            return Ok(reply.payload);
        }
        debug!("Discarding stale reply to {:?}", reply.reply_to);
    }
}
