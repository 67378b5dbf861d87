use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::hkdf;
use ring::rand::SystemRandom;
use thiserror::Error;

/// `[kind u8][counter u64 LE]`, authenticated as associated data.
pub const HEADER_LEN: usize = 9;

const OFFERER_TO_ANSWERER: &[u8] = b"cardlink datagram offerer->answerer";
const ANSWERER_TO_OFFERER: &[u8] = b"cardlink datagram answerer->offerer";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("key agreement failed")]
    KeyAgreement,
    #[error("invalid key material")]
    InvalidKey,
    #[error("encryption failed")]
    SealFailed,
    #[error("decryption failed")]
    OpenFailed,
    #[error("frame shorter than its header")]
    ShortFrame,
    #[error("nonce counter exhausted")]
    CounterExhausted,
}

/// One side of an X25519 exchange whose public half travels in a session description.
pub struct KeyExchange {
    private: EphemeralPrivateKey,
    public: Vec<u8>,
}

impl KeyExchange {
    pub fn generate() -> Result<Self, ChannelError> {
        let rng = SystemRandom::new();
        let private =
            EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| ChannelError::KeyAgreement)?;
        let public = private
            .compute_public_key()
            .map_err(|_| ChannelError::KeyAgreement)?
            .as_ref()
            .to_vec();
        Ok(Self { private, public })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Finish the agreement and derive one key per direction.
    ///
    /// `context` must be identical on both sides (the two session ids, offer
    /// first) so that keys are bound to this particular handshake.
    pub fn complete(
        self,
        remote_public: &[u8],
        is_offerer: bool,
        context: &[u8],
    ) -> Result<DatagramCipher, ChannelError> {
        let remote = UnparsedPublicKey::new(&X25519, remote_public);
        let shared = agreement::agree_ephemeral(self.private, &remote, |s| s.to_vec())
            .map_err(|_| ChannelError::KeyAgreement)?;

        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, context).extract(&shared);
        let derive = |info: &[u8]| -> Result<LessSafeKey, ChannelError> {
            let info = [info];
            let okm = prk
                .expand(&info, &CHACHA20_POLY1305)
                .map_err(|_| ChannelError::InvalidKey)?;
            Ok(LessSafeKey::new(UnboundKey::from(okm)))
        };

        let (seal_info, open_info) = if is_offerer {
            (OFFERER_TO_ANSWERER, ANSWERER_TO_OFFERER)
        } else {
            (ANSWERER_TO_OFFERER, OFFERER_TO_ANSWERER)
        };

        Ok(DatagramCipher {
            sealing: derive(seal_info)?,
            opening: derive(open_info)?,
            next_counter: 1,
        })
    }
}

/// A datagram that passed authentication.
#[derive(Debug, PartialEq, Eq)]
pub struct OpenedFrame {
    pub kind: u8,
    pub counter: u64,
    pub payload: Vec<u8>,
}

/// Seals and opens self-describing datagrams with ChaCha20-Poly1305.
///
/// The nonce is the frame counter, carried in the clear header and covered by
/// the tag, so frames can be opened in any order. Ordering and replay policy
/// belong to the caller.
pub struct DatagramCipher {
    sealing: LessSafeKey,
    opening: LessSafeKey,
    next_counter: u64,
}

impl DatagramCipher {
    pub fn seal(&mut self, kind: u8, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let counter = self.next_counter;
        self.next_counter = counter
            .checked_add(1)
            .ok_or(ChannelError::CounterExhausted)?;

        let mut frame = Vec::with_capacity(HEADER_LEN + plaintext.len() + 16);
        frame.push(kind);
        frame.extend_from_slice(&counter.to_le_bytes());

        let mut body = plaintext.to_vec();
        self.sealing
            .seal_in_place_append_tag(nonce_for(counter), Aad::from(&frame[..]), &mut body)
            .map_err(|_| ChannelError::SealFailed)?;
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn open(&self, frame: &[u8]) -> Result<OpenedFrame, ChannelError> {
        if frame.len() < HEADER_LEN {
            return Err(ChannelError::ShortFrame);
        }
        let (header, body) = frame.split_at(HEADER_LEN);
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&header[1..]);
        let counter = u64::from_le_bytes(counter_bytes);

        let mut in_out = body.to_vec();
        let plaintext = self
            .opening
            .open_in_place(nonce_for(counter), Aad::from(header), &mut in_out)
            .map_err(|_| ChannelError::OpenFailed)?;

        Ok(OpenedFrame {
            kind: header[0],
            counter,
            payload: plaintext.to_vec(),
        })
    }
}

fn nonce_for(counter: u64) -> Nonce {
    let mut bytes = [0u8; NONCE_LEN];
    bytes[NONCE_LEN - 8..].copy_from_slice(&counter.to_le_bytes());
    Nonce::assume_unique_for_key(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pair() -> (DatagramCipher, DatagramCipher) {
        let offerer = KeyExchange::generate().unwrap();
        let answerer = KeyExchange::generate().unwrap();
        let offer_pub = offerer.public_key().to_vec();
        let answer_pub = answerer.public_key().to_vec();

        let a = offerer.complete(&answer_pub, true, b"ctx").unwrap();
        let b = answerer.complete(&offer_pub, false, b"ctx").unwrap();
        (a, b)
    }

    #[test]
    fn seal_and_open_roundtrip() {
        let (mut host, joiner) = make_pair();

        let frame = host.seal(3, b"hello from the host").unwrap();
        let opened = joiner.open(&frame).unwrap();
        assert_eq!(opened.kind, 3);
        assert_eq!(opened.counter, 1);
        assert_eq!(opened.payload, b"hello from the host");
    }

    #[test]
    fn bidirectional_and_out_of_order() {
        let (mut host, mut joiner) = make_pair();

        let first = host.seal(1, b"one").unwrap();
        let second = host.seal(1, b"two").unwrap();
        assert_eq!(joiner.open(&second).unwrap().counter, 2);
        assert_eq!(joiner.open(&first).unwrap().payload, b"one");

        let back = joiner.seal(1, b"pong").unwrap();
        assert_eq!(host.open(&back).unwrap().payload, b"pong");
    }

    #[test]
    fn tampered_header_rejected() {
        let (mut host, joiner) = make_pair();
        let mut frame = host.seal(1, b"secret").unwrap();
        frame[0] = 2;
        assert!(matches!(joiner.open(&frame), Err(ChannelError::OpenFailed)));
    }

    #[test]
    fn tampered_body_rejected() {
        let (mut host, joiner) = make_pair();
        let mut frame = host.seal(1, b"secret").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(joiner.open(&frame).is_err());
    }

    #[test]
    fn own_frames_do_not_open() {
        let (mut host, _joiner) = make_pair();
        let frame = host.seal(1, b"self-talk").unwrap();
        assert!(host.open(&frame).is_err());
    }

    #[test]
    fn mismatched_context_fails() {
        let offerer = KeyExchange::generate().unwrap();
        let answerer = KeyExchange::generate().unwrap();
        let offer_pub = offerer.public_key().to_vec();
        let answer_pub = answerer.public_key().to_vec();

        let mut a = offerer.complete(&answer_pub, true, b"ctx-a").unwrap();
        let b = answerer.complete(&offer_pub, false, b"ctx-b").unwrap();
        let frame = a.seal(1, b"hi").unwrap();
        assert!(b.open(&frame).is_err());
    }

    #[test]
    fn short_frame_rejected() {
        let (_host, joiner) = make_pair();
        assert!(matches!(joiner.open(&[1, 2, 3]), Err(ChannelError::ShortFrame)));
    }
}
