//! This module defines the claims read from handshake credentials.
//!
//! Tokens are issued by the account service, which writes the user's primary
//! key into a JS style `userId` claim. Depending on the issuing store that key
//! is either a number or a string, so both are accepted here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Represents the claims carried by a session token.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SessionClaims {
    #[serde(rename = "userId")]
    pub(crate) user_id: Value,
    pub(crate) exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) email: Option<String>,
}

impl SessionClaims {
    /// The user id rendered as a topic segment, if it has a usable shape.
    pub(crate) fn user_id_string(&self) -> Option<String> {
        match &self.user_id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
