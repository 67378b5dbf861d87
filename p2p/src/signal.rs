use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, PeerIdentity};

/// Wire format version carried in every handshake token.
pub const TOKEN_VERSION: u8 = 1;

const X25519_PUBLIC_KEY_LEN: usize = 32;

/// Most candidate addresses a single description may advertise.
pub const MAX_CANDIDATES: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("unsupported token version {found}")]
    UnsupportedVersion { found: u8 },
    #[error("session description advertises no candidate addresses")]
    NoCandidates,
    #[error("session description advertises too many candidates ({0})")]
    TooManyCandidates(usize),
    #[error("session description carries an invalid public key")]
    InvalidKey,
    #[error("session description has an empty session id")]
    EmptySessionId,
}

/// Transport parameters one endpoint advertises to the other: a session id,
/// an ephemeral X25519 public key and every address it can be reached on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionDescription {
    #[serde(rename = "u")]
    pub session_id: String,
    #[serde(rename = "k")]
    pub public_key: String,
    #[serde(rename = "a")]
    pub candidates: Vec<SocketAddr>,
}

impl SessionDescription {
    /// Reject descriptions the transport could never connect with.
    pub fn validate(&self) -> Result<(), SignalError> {
        if self.session_id.is_empty() {
            return Err(SignalError::EmptySessionId);
        }
        if self.candidates.is_empty() {
            return Err(SignalError::NoCandidates);
        }
        if self.candidates.len() > MAX_CANDIDATES {
            return Err(SignalError::TooManyCandidates(self.candidates.len()));
        }
        match crypto::decode_key(&self.public_key) {
            Ok(key) if key.len() == X25519_PUBLIC_KEY_LEN => Ok(()),
            _ => Err(SignalError::InvalidKey),
        }
    }

    pub(crate) fn public_key_bytes(&self) -> Result<Vec<u8>, SignalError> {
        crypto::decode_key(&self.public_key).map_err(|_| SignalError::InvalidKey)
    }
}

/// Which half of the exchange a token belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenRole {
    #[serde(rename = "o")]
    Offer,
    #[serde(rename = "a")]
    Answer,
}

/// Logical content of an invitation (offer) or reply (answer) token.
///
/// An answer echoes the correlation id of the offer it responds to, which is
/// how the host tells a fresh answer from one aimed at a superseded offer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandshakeToken {
    #[serde(rename = "v")]
    pub version: u8,
    #[serde(rename = "r")]
    pub role: TokenRole,
    #[serde(rename = "c")]
    pub correlation_id: String,
    #[serde(rename = "t")]
    pub room_tag: String,
    #[serde(rename = "p")]
    pub sender: PeerIdentity,
    #[serde(rename = "s")]
    pub session: SessionDescription,
}

impl HandshakeToken {
    pub fn offer(
        correlation_id: &str,
        room_tag: &str,
        sender: PeerIdentity,
        session: SessionDescription,
    ) -> Self {
        Self {
            version: TOKEN_VERSION,
            role: TokenRole::Offer,
            correlation_id: correlation_id.to_string(),
            room_tag: room_tag.to_string(),
            sender,
            session,
        }
    }

    pub fn answer(
        correlation_id: &str,
        room_tag: &str,
        sender: PeerIdentity,
        session: SessionDescription,
    ) -> Self {
        Self {
            role: TokenRole::Answer,
            ..Self::offer(correlation_id, room_tag, sender, session)
        }
    }

    pub fn check_version(&self) -> Result<(), SignalError> {
        if self.version == TOKEN_VERSION {
            Ok(())
        } else {
            Err(SignalError::UnsupportedVersion {
                found: self.version,
            })
        }
    }
}
