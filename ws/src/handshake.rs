use crate::message::Handshake;
use domain::error::{auth_error, AuthErrorKind, Error};
use domain::jwt::CredentialVerifier;
use domain::Identity;

/// Lifecycle of one client connection.
///
/// A connection starts `Unauthenticated`, moves to `Authenticated` after
/// exactly one handshake attempt succeeds and ends `Closed`. There is no way
/// back to an earlier state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated(Identity),
    Closed,
}

impl ConnectionState {
    /// Consumes the handshake message and advances the state.
    pub async fn on_handshake(
        self,
        raw: &str,
        verifier: &dyn CredentialVerifier,
    ) -> Result<Self, Error> {
        if self != ConnectionState::Unauthenticated {
            return Err(auth_error(
                AuthErrorKind::InvalidClaims,
                "handshake already attempted",
            ));
        }

        let handshake: Handshake = serde_json::from_str(raw).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: domain::ErrorKind::Auth(AuthErrorKind::MalformedToken),
        })?;

        let token = handshake
            .token
            .ok_or_else(|| auth_error(AuthErrorKind::MissingToken, "handshake carries no token"))?;

        let identity = verifier.verify(&token).await?;
        Ok(ConnectionState::Authenticated(identity))
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            ConnectionState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }
}
