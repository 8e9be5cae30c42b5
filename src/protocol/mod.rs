//! Wire protocol shared by the broker and its clients
//!
//! Frame format:
//! - Magic bytes (4): [0x45, 0x4D, 0x42, 0x44] = "EMBD"
//! - Version (1): 0x01
//! - Message type (1): 4 = Data
//! - Length (4): u32 little-endian, payload size
//! - Message ID (16): UUID
//! - Reply-to option (17): 1 byte tag + 16 bytes UUID of the request answered
//! - Payload: MessagePack serialized request or reply

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::models::{Embedding, EmbeddingError, EmbeddingResult, TextInput};

/// Protocol magic bytes
pub const MAGIC_BYTES: [u8; 4] = [0x45, 0x4D, 0x42, 0x44]; // "EMBD"

/// Protocol version
pub const VERSION: u8 = 0x01;

/// Message type for data
pub const MSG_TYPE_DATA: u8 = 4;

/// Default upper bound on a frame payload (64 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Request kind asking for embeddings
pub const KIND_ENCODE: &str = "encode";

/// Request kind asking for the backend description (connection handshake)
pub const KIND_INFO: &str = "info";

/// A request as it travels on the wire.
///
/// `texts` is kept as a loose value so a request whose `texts` is not a list
/// can still be decoded and answered with `INVALID_INPUT`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texts: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pooling: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

impl Request {
    pub fn encode(
        texts: &[TextInput],
        pooling: Option<&str>,
        batch_size: Option<usize>,
    ) -> EmbeddingResult<Self> {
        let texts = serde_json::to_value(texts).map_err(|e| EmbeddingError::InvalidInput {
            message: format!("texts cannot be serialized: {}", e),
        })?;
        Ok(Self {
            kind: Some(KIND_ENCODE.to_string()),
            texts: Some(texts),
            pooling: pooling.map(str::to_string),
            batch_size,
        })
    }

    pub fn info() -> Self {
        Self {
            kind: Some(KIND_INFO.to_string()),
            ..Default::default()
        }
    }

    /// Extract `texts` as a list of strings or token lists.
    pub fn texts(&self) -> EmbeddingResult<Vec<TextInput>> {
        let invalid = || EmbeddingError::InvalidInput {
            message: "Argument `texts` should be either a list of strings or a list of token lists"
                .to_string(),
        };
        match &self.texts {
            Some(value @ serde_json::Value::Array(_)) => {
                serde_json::from_value(value.clone()).map_err(|_| invalid())
            }
            _ => Err(invalid()),
        }
    }
}

/// Wire error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    UnsupportedPooling,
    ModelNotLoaded,
    MalformedRequest,
    InternalError,
}

/// Error reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: ErrorCode,
}

/// Handshake reply describing the backend behind a broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub backend: String,
    pub model: String,
    pub dimension: usize,
    pub workers: usize,
}

/// Any reply a worker produces. The three shapes are distinct: an array of
/// rows, an info map, or an error map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Embeddings(Vec<Embedding>),
    Info(BackendInfo),
    Error(ErrorResponse),
}

impl From<EmbeddingError> for Reply {
    fn from(error: EmbeddingError) -> Self {
        Reply::Error(error.to_response())
    }
}

/// Protocol message envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub message_id: Uuid,
    pub reply_to: Option<Uuid>,
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    /// Create a new request message
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            reply_to: None,
            payload,
        }
    }

    /// Create a reply to the message with id `reply_to`
    pub fn reply(reply_to: Uuid, payload: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            reply_to: Some(reply_to),
            payload,
        }
    }

    /// Write message to a stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> io::Result<()> {
        let length = u32::try_from(self.payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "payload larger than 4 GiB")
        })?;

        let mut header = Vec::with_capacity(43);
        header.extend_from_slice(&MAGIC_BYTES);
        header.push(VERSION);
        header.push(MSG_TYPE_DATA);
        header.extend_from_slice(&length.to_le_bytes());
        header.extend_from_slice(self.message_id.as_bytes());
        match self.reply_to {
            Some(target) => {
                header.push(1);
                header.extend_from_slice(target.as_bytes());
            }
            None => header.push(0),
        }

        stream.write_all(&header).await?;
        stream.write_all(&self.payload).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read message from a stream, rejecting payloads above `max_message_size`
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut R,
        max_message_size: usize,
    ) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        stream.read_exact(&mut magic).await?;
        if magic != MAGIC_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid magic bytes: {:?}", magic),
            ));
        }

        let version = stream.read_u8().await?;
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported version: {}", version),
            ));
        }

        let msg_type = stream.read_u8().await?;
        if msg_type != MSG_TYPE_DATA {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported message type: {}", msg_type),
            ));
        }

        let length = stream.read_u32_le().await? as usize;
        if length > max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message of {} bytes exceeds limit of {}", length, max_message_size),
            ));
        }

        let mut id_bytes = [0u8; 16];
        stream.read_exact(&mut id_bytes).await?;
        let message_id = Uuid::from_bytes(id_bytes);

        let reply_to = match stream.read_u8().await? {
            0 => None,
            1 => {
                let mut target_bytes = [0u8; 16];
                stream.read_exact(&mut target_bytes).await?;
                Some(Uuid::from_bytes(target_bytes))
            }
            tag => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid reply-to tag: {}", tag),
                ))
            }
        };

        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await?;

        Ok(Self {
            message_id,
            reply_to,
            payload,
        })
    }
}

#[derive(Deserialize)]
struct RequestKind {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// Read only the `type` field of a serialized request, skipping the rest.
pub fn peek_request_kind(data: &[u8]) -> Option<String> {
    rmp_serde::from_slice::<RequestKind>(data).ok().and_then(|request| request.kind)
}

/// Serialize request to MessagePack
pub fn serialize_request(request: &Request) -> EmbeddingResult<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(request)?)
}

/// Deserialize request from MessagePack
pub fn deserialize_request(data: &[u8]) -> EmbeddingResult<Request> {
    rmp_serde::from_slice(data).map_err(|e| EmbeddingError::MalformedRequest {
        message: format!("Invalid request format: {}", e),
    })
}

/// Serialize reply to MessagePack
pub fn serialize_reply(reply: &Reply) -> EmbeddingResult<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(reply)?)
}

/// Deserialize reply from MessagePack
pub fn deserialize_reply(data: &[u8]) -> EmbeddingResult<Reply> {
    Ok(rmp_serde::from_slice(data)?)
}
