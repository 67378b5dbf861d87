//! Compact text encoding for handshake payloads.
//!
//! Pipeline: serde (short field names) → JSON → zstd frame with content
//! checksum → unpadded base64url. Decoding runs the stages backwards and
//! fails on the first one that does not check out, so a truncated or
//! mistyped token is rejected instead of decoding to something else.

use std::io::{Read, Write};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Practical ceiling for a token that still scans reliably as a QR code.
pub const MAX_TOKEN_LEN: usize = 2048;

/// Upper bound on the inflated JSON, far above any real payload.
const MAX_INFLATED_LEN: u64 = 64 * 1024;

const COMPRESSION_LEVEL: i32 = 19;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("token is not valid base64url: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("token payload is corrupt or truncated: {0}")]
    Corrupt(std::io::Error),
    #[error("token payload has an unexpected shape: {0}")]
    Shape(serde_json::Error),
    #[error("encoded token is {len} characters, the transfer medium allows {limit}")]
    PayloadTooLarge { len: usize, limit: usize },
    #[error("failed to encode token: {0}")]
    Encode(String),
}

impl CodecError {
    /// True for every failure that means "this token is unusable, get a fresh one".
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            CodecError::Base64(_) | CodecError::Corrupt(_) | CodecError::Shape(_)
        )
    }
}

/// Encoder/decoder for handshake tokens with a configurable size ceiling.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionCodec {
    max_token_len: usize,
}

impl Default for ConnectionCodec {
    fn default() -> Self {
        Self::new(MAX_TOKEN_LEN)
    }
}

impl ConnectionCodec {
    pub fn new(max_token_len: usize) -> Self {
        Self { max_token_len }
    }

    pub fn max_token_len(&self) -> usize {
        self.max_token_len
    }

    /// Encode `payload` into a transferable token.
    ///
    /// Fails with [`CodecError::PayloadTooLarge`] rather than producing a
    /// token the medium cannot carry.
    pub fn encode<T: Serialize>(&self, payload: &T) -> Result<String, CodecError> {
        let json = serde_json::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))?;

        let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), COMPRESSION_LEVEL)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        encoder
            .include_checksum(true)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        encoder
            .write_all(&json)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| CodecError::Encode(e.to_string()))?;

        let token = BASE64.encode(compressed);
        if token.len() > self.max_token_len {
            return Err(CodecError::PayloadTooLarge {
                len: token.len(),
                limit: self.max_token_len,
            });
        }

        tracing::trace!(json_len = json.len(), token_len = token.len(), "token encoded");
        Ok(token)
    }

    /// Decode a token produced by [`ConnectionCodec::encode`].
    ///
    /// Whitespace is ignored so tokens survive line wrapping in chat apps.
    pub fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T, CodecError> {
        let cleaned: String = token.split_whitespace().collect();
        let compressed = BASE64.decode(cleaned.as_bytes())?;

        let decoder =
            zstd::stream::read::Decoder::with_buffer(&compressed[..]).map_err(CodecError::Corrupt)?;
        let mut inflated = Vec::new();
        decoder
            .take(MAX_INFLATED_LEN + 1)
            .read_to_end(&mut inflated)
            .map_err(CodecError::Corrupt)?;
        if inflated.len() as u64 > MAX_INFLATED_LEN {
            return Err(CodecError::Corrupt(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "inflated payload exceeds limit",
            )));
        }

        serde_json::from_slice(&inflated).map_err(CodecError::Shape)
    }
}
