//! This module provides credential verification for the WebSocket handshake.
//!
//! The handshake carries a session token issued by the account service. The
//! bridge only needs to know *who* the token belongs to; expiry, malformed
//! input and bad signatures are all reported as authentication errors, which
//! the connection layer collapses into one client-visible failure.
//!
//! # Example
//!
//! ```rust
//! use domain::jwt::{issue_token, CredentialVerifier, JwtVerifier};
//! use domain::Identity;
//!
//! # async fn example() {
//! let verifier = JwtVerifier::new("secret");
//! let identity = Identity::parse("13").unwrap();
//! let token = issue_token("secret", &identity, 3600).unwrap();
//! assert_eq!(verifier.verify(&token).await.unwrap(), identity);
//! # }
//! ```

use crate::error::{auth_error, AuthErrorKind, Error};
use crate::identity::Identity;
use async_trait::async_trait;
use chrono::Utc;
use claims::SessionClaims;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::*;

pub(crate) mod claims;

/// Verifies a handshake credential and yields the identity it was issued to.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, Error>;
}

/// HS256 session token verifier.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl CredentialVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, Error> {
        if token.is_empty() {
            return Err(auth_error(AuthErrorKind::MissingToken, "empty token"));
        }

        let data = decode::<SessionClaims>(token, &self.key, &self.validation).map_err(|e| {
            debug!("Rejecting session token: {e}");
            Error::from(e)
        })?;

        let user_id = data.claims.user_id_string().ok_or_else(|| {
            warn!("Session token carries a userId claim of unexpected shape");
            auth_error(AuthErrorKind::InvalidClaims, "userId must be a string or number")
        })?;

        Identity::parse(user_id)
    }
}

/// Issues a session token for `identity` that expires `ttl_secs` from now.
///
/// The bridge never issues tokens to clients itself; this exists for local
/// tooling and tests that need a token the verifier will accept.
pub fn issue_token(secret: &str, identity: &Identity, ttl_secs: i64) -> Result<String, Error> {
    let exp = (Utc::now().timestamp() + ttl_secs).max(0) as usize;
    let claims = SessionClaims {
        user_id: serde_json::Value::String(identity.to_string()),
        exp,
        email: None,
    };

    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}
