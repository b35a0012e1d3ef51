//! HS256 bearer tokens for HTTP and WebSocket clients.

use super::BroadcastError;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// What a client presents to authenticate.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Identity attached to an authenticated connection or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, credentials: &Credentials) -> Result<Principal, BroadcastError> {
        let token = credentials.token.trim();
        if token.is_empty() {
            return Err(BroadcastError::InvalidCredentials("missing token".into()));
        }
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| BroadcastError::InvalidCredentials(format!("invalid token: {}", e)))?;
        Ok(Principal {
            subject: data.claims.sub,
        })
    }

    /// Sign a token for `subject` valid for `ttl`.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: subject.to_string(),
            exp: (Utc::now().timestamp() as u64 + ttl.as_secs()) as usize,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}
