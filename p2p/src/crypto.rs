use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes of entropy behind a peer id (8 base64url characters).
const PEER_ID_BYTES: usize = 6;

/// Room tags avoid 0/O and 1/I so they survive being read aloud.
const TAG_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const TAG_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("system random source failed")]
    RandomSource,
    #[error("key agreement failed")]
    KeyAgreement,
    #[error("invalid key material")]
    InvalidKey,
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

/// Identity of one participant, created once per process.
///
/// The id is random and only needs to be unique within one room; the display
/// name is whatever the player typed. Field names are kept to one letter
/// because identities travel inside handshake tokens.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerIdentity {
    #[serde(rename = "i")]
    pub id: String,
    #[serde(rename = "n")]
    pub display_name: String,
}

impl PeerIdentity {
    /// Generate a fresh random id for `display_name`.
    pub fn generate(display_name: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            id: random_id(PEER_ID_BYTES)?,
            display_name: display_name.to_string(),
        })
    }

    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Generate `len` cryptographically-secure random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf).map_err(|_| CryptoError::RandomSource)?;
    Ok(buf)
}

/// Random opaque identifier: `len` random bytes as unpadded base64url.
pub fn random_id(len: usize) -> Result<String, CryptoError> {
    Ok(BASE64.encode(random_bytes(len)?))
}

/// Short human-friendly room tag such as `QX7P`.
pub fn room_tag() -> Result<String, CryptoError> {
    let bytes = random_bytes(TAG_LEN)?;
    Ok(bytes
        .iter()
        .map(|b| TAG_ALPHABET[*b as usize % TAG_ALPHABET.len()] as char)
        .collect())
}

pub(crate) fn encode_key(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub(crate) fn decode_key(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(BASE64.decode(encoded)?)
}
