//! Error types for the `domain` layer.
use std::error::Error as StdError;
use std::fmt;

/// Top-level error type shared by the bridge crates.
/// Errors are modeled as a tree with `domain::error::Error` as the root type
/// holding a tree of `error_kind` enums. The `source` field holds the original
/// error, if any. Lower layers (`broker`, `ws`) translate their failures into
/// this tree so that the connection loop can decide, from the kind alone,
/// whether a failure closes the connection or becomes an error reply.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// Handshake rejected. Fatal to the connection.
    Auth(AuthErrorKind),
    /// Too many inbound messages. Rejects one message only.
    RateLimited,
    /// Client payload could not be understood. Rejects one message only.
    Malformed(MalformedErrorKind),
    /// Broker connect or subscribe failure.
    Broker(BrokerErrorKind),
    /// A transport dropped underneath us.
    Transport(TransportErrorKind),
    Config,
}

#[derive(Debug, PartialEq)]
pub enum AuthErrorKind {
    MissingToken,
    MalformedToken,
    Expired,
    InvalidSignature,
    InvalidClaims,
    Timeout,
}

#[derive(Debug, PartialEq)]
pub enum MalformedErrorKind {
    InvalidFormat,
    UnknownAction,
    InvalidSensor,
}

#[derive(Debug, PartialEq)]
pub enum BrokerErrorKind {
    Unreachable,
    SubscribeRejected,
    UnsubscribeFailed,
    Timeout,
    SessionClosed,
}

#[derive(Debug, PartialEq)]
pub enum TransportErrorKind {
    ClientClosed,
    /// The server is draining and accepts no new connections.
    ShuttingDown,
}

impl Error {
    pub fn is_auth(&self) -> bool {
        matches!(self.error_kind, ErrorKind::Auth(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Auth(kind) => write!(f, "Authentication error: {kind:?}")?,
            ErrorKind::RateLimited => write!(f, "Rate limit exceeded")?,
            ErrorKind::Malformed(kind) => write!(f, "Malformed message: {kind:?}")?,
            ErrorKind::Broker(kind) => write!(f, "Broker error: {kind:?}")?,
            ErrorKind::Transport(kind) => write!(f, "Transport error: {kind:?}")?,
            ErrorKind::Config => write!(f, "Configuration error")?,
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind as JwtErrorKind;

        let kind = match err.kind() {
            JwtErrorKind::ExpiredSignature | JwtErrorKind::ImmatureSignature => {
                AuthErrorKind::Expired
            }
            JwtErrorKind::InvalidSignature | JwtErrorKind::InvalidAlgorithm => {
                AuthErrorKind::InvalidSignature
            }
            JwtErrorKind::MissingRequiredClaim(_)
            | JwtErrorKind::InvalidIssuer
            | JwtErrorKind::InvalidAudience
            | JwtErrorKind::InvalidSubject => AuthErrorKind::InvalidClaims,
            _ => AuthErrorKind::MalformedToken,
        };

        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Auth(kind),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Malformed(MalformedErrorKind::InvalidFormat),
        }
    }
}

/// Helper function to create authentication errors.
pub fn auth_error(kind: AuthErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Auth(kind),
    }
}

/// Helper function to create malformed message errors.
pub fn malformed_error(kind: MalformedErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Malformed(kind),
    }
}

/// Helper function to create broker errors.
pub fn broker_error(kind: BrokerErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Broker(kind),
    }
}

/// Helper function to create transport errors.
pub fn transport_error(kind: TransportErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Transport(kind),
    }
}

/// Helper function to create rate limit errors.
pub fn rate_limited_error() -> Error {
    Error {
        source: None,
        error_kind: ErrorKind::RateLimited,
    }
}
