//! Sealed media-session resume tokens.
//!
//! A reconnecting client presents a token that resolves back to its Janus
//! `(sessionId, handleId)` pair. The token is AES-256-GCM sealed with the
//! room key as associated data, so a token lifted from one room fails
//! authentication in any other.
//!
//! Wire format: `base64( nonce(12) ∥ ciphertext )` where the plaintext is
//! exactly `"JT" ∥ sessionId(8 BE) ∥ handleId(8 BE)`.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::prelude::*;
use rand::RngCore;
use thiserror::Error;

const MAGIC: &[u8; 2] = b"JT";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PLAINTEXT_LEN: usize = 2 + 8 + 8;

#[derive(Debug, Error)]
pub enum ResumeTokenError {
    #[error("Sealing key must be exactly {KEY_LEN} bytes")]
    BadKeyLength,

    #[error("Malformed token encoding")]
    MalformedEncoding,

    #[error("Token too short")]
    TooShort,

    #[error("Token authentication failed")]
    AuthFailed,

    #[error("Unexpected token payload length")]
    BadPayloadLength,

    #[error("Unexpected token payload magic")]
    BadMagic,
}

/// Codec sealing `(sessionId, handleId)` pairs under a room-bound AAD.
#[derive(Clone)]
pub struct ResumeTokenCodec {
    cipher: Aes256Gcm,
}

impl ResumeTokenCodec {
    /// `key` must be exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, ResumeTokenError> {
        if key.len() != KEY_LEN {
            return Err(ResumeTokenError::BadKeyLength);
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encode(
        &self,
        room_key: &str,
        session_id: i64,
        handle_id: i64,
    ) -> Result<String, ResumeTokenError> {
        let mut plain = [0u8; PLAINTEXT_LEN];
        plain[..2].copy_from_slice(MAGIC);
        plain[2..10].copy_from_slice(&session_id.to_be_bytes());
        plain[10..18].copy_from_slice(&handle_id.to_be_bytes());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plain,
                    aad: room_key.as_bytes(),
                },
            )
            .map_err(|_| ResumeTokenError::AuthFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(sealed))
    }

    pub fn decode(&self, room_key: &str, token: &str) -> Result<(i64, i64), ResumeTokenError> {
        let sealed = BASE64_STANDARD
            .decode(token)
            .map_err(|_| ResumeTokenError::MalformedEncoding)?;
        if sealed.len() <= NONCE_LEN {
            return Err(ResumeTokenError::TooShort);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plain = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: room_key.as_bytes(),
                },
            )
            .map_err(|_| ResumeTokenError::AuthFailed)?;

        if plain.len() != PLAINTEXT_LEN {
            return Err(ResumeTokenError::BadPayloadLength);
        }
        if &plain[..2] != MAGIC {
            return Err(ResumeTokenError::BadMagic);
        }

        let mut session = [0u8; 8];
        session.copy_from_slice(&plain[2..10]);
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&plain[10..18]);
        Ok((i64::from_be_bytes(session), i64::from_be_bytes(handle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ResumeTokenCodec {
        ResumeTokenCodec::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(matches!(
            ResumeTokenCodec::new(&[0u8; 16]),
            Err(ResumeTokenError::BadKeyLength)
        ));
        assert!(ResumeTokenCodec::new(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_round_trip() {
        let c = codec();
        for (s, h) in [(0, 0), (1, 2), (i64::MAX, i64::MIN), (-1, 42)] {
            let token = c.encode("room:abc", s, h).unwrap();
            assert_eq!(c.decode("room:abc", &token).unwrap(), (s, h));
        }
    }

    #[test]
    fn test_tokens_are_randomized() {
        let c = codec();
        let t1 = c.encode("room:abc", 1, 2).unwrap();
        let t2 = c.encode("room:abc", 1, 2).unwrap();
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_cross_room_token_rejected() {
        let c = codec();
        let token = c.encode("room:abc", 1, 2).unwrap();
        assert!(matches!(
            c.decode("room:xyz", &token),
            Err(ResumeTokenError::AuthFailed)
        ));
    }

    #[test]
    fn test_any_bit_flip_rejected() {
        let c = codec();
        let token = c.encode("room:abc", 7, 9).unwrap();
        let mut sealed = BASE64_STANDARD.decode(&token).unwrap();
        for i in 0..sealed.len() {
            sealed[i] ^= 0x01;
            let flipped = BASE64_STANDARD.encode(&sealed);
            assert!(c.decode("room:abc", &flipped).is_err(), "bit flip at byte {i} accepted");
            sealed[i] ^= 0x01;
        }
    }

    #[test]
    fn test_malformed_inputs() {
        let c = codec();
        assert!(matches!(
            c.decode("room:abc", "!!not-base64!!"),
            Err(ResumeTokenError::MalformedEncoding)
        ));
        let short = BASE64_STANDARD.encode([0u8; NONCE_LEN]);
        assert!(matches!(
            c.decode("room:abc", &short),
            Err(ResumeTokenError::TooShort)
        ));
    }

    #[test]
    fn test_wrong_codec_key_rejected() {
        let a = ResumeTokenCodec::new(&[1u8; 32]).unwrap();
        let b = ResumeTokenCodec::new(&[2u8; 32]).unwrap();
        let token = a.encode("room:abc", 1, 2).unwrap();
        assert!(b.decode("room:abc", &token).is_err());
    }
}
