//! Room-scoped bearer tokens.
//!
//! HS-family JWTs binding a user to a room. Each verifier instance accepts
//! exactly one algorithm: a token whose header names any other algorithm is
//! rejected before signature verification, closing the alg-confusion hole.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{RoomId, UserId};
use crate::{Error, Result};

/// Claims carried by a room scope token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomClaims {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "roomId")]
    pub room_id: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// Signer/verifier for room scope tokens.
#[derive(Clone)]
pub struct RoomTokenService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    algorithm: Algorithm,
    token_ttl: Duration,
}

impl RoomTokenService {
    /// `algorithm` must be one of HS256/HS384/HS512.
    pub fn new(secret: &[u8], algorithm: Algorithm, token_ttl: Duration) -> Result<Self> {
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(Error::Internal(format!(
                "Unsupported token algorithm: {algorithm:?}"
            )));
        }
        if secret.is_empty() {
            return Err(Error::Internal("Token secret must not be empty".to_string()));
        }
        Ok(Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            algorithm,
            token_ttl,
        })
    }

    /// Sign a token binding `user_id` to `room_id`.
    pub fn sign(&self, user_id: &UserId, room_id: &RoomId) -> Result<String> {
        let now = Utc::now();
        let claims = RoomClaims {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.token_ttl).timestamp(),
        };
        let header = Header::new(self.algorithm);
        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }

    /// Verify a token and extract its claims. Both `userId` and `roomId`
    /// must be non-empty.
    pub fn verify(&self, token: &str) -> Result<RoomClaims> {
        let header = decode_header(token)
            .map_err(|e| Error::Unauthorized(format!("Malformed token header: {e}")))?;
        if header.alg != self.algorithm {
            return Err(Error::Unauthorized(format!(
                "Unexpected signing algorithm: {:?}",
                header.alg
            )));
        }

        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.leeway = 60;

        let token_data: TokenData<RoomClaims> = decode(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::Unauthorized("Token expired".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    Error::Unauthorized("Invalid token signature".to_string())
                }
                _ => Error::Unauthorized(format!("Token verification failed: {e}")),
            })?;

        let claims = token_data.claims;
        if claims.user_id.is_empty() || claims.room_id.is_empty() {
            return Err(Error::Unauthorized("Token claims incomplete".to_string()));
        }
        Ok(claims)
    }
}
