//! Authenticated identities and the broker topics namespaced under them.
//!
//! Every topic a client may reach is `<identity>/<sensor>`. The identity part
//! always comes from the verified credential, the client only ever supplies
//! the sensor name, so one identity can never address another's data.

use crate::error::{auth_error, malformed_error, AuthErrorKind, Error, MalformedErrorKind};
use serde::Serialize;
use std::fmt;

/// Characters that would let a topic segment escape or widen its namespace.
const RESERVED_CHARS: &[char] = &['/', '+', '#', '\0'];

/// The identity bound to a connection after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn parse(value: impl Into<String>) -> Result<Self, Error> {
        let value = value.into();
        if value.is_empty() || value.contains(RESERVED_CHARS) {
            return Err(auth_error(
                AuthErrorKind::InvalidClaims,
                "identity must be a non-empty single topic segment",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the raw broker topic `topic` lives in this identity's namespace.
    pub fn owns(&self, topic: &str) -> bool {
        topic
            .split_once('/')
            .is_some_and(|(owner, _)| owner == self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A broker topic of the form `<identity>/<sensor>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Builds the topic for `sensor` inside `identity`'s namespace.
    pub fn for_sensor(identity: &Identity, sensor: &str) -> Result<Self, Error> {
        if sensor.is_empty() || sensor.contains(RESERVED_CHARS) {
            return Err(malformed_error(
                MalformedErrorKind::InvalidSensor,
                "sensor name must be a non-empty single topic segment",
            ));
        }
        Ok(Self(format!("{identity}/{sensor}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The sensor segment of the topic.
    pub fn sensor(&self) -> &str {
        self.0.split_once('/').map(|(_, sensor)| sensor).unwrap_or("")
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}
