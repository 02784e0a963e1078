use domain::error::{malformed_error, Error, ErrorKind, MalformedErrorKind};
use serde::{Deserialize, Serialize};

/// First message a client must send.
#[derive(Debug, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub action: Action,
    pub sensor: String,
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    action: String,
    #[serde(default)]
    sensor: Option<String>,
}

impl ClientRequest {
    /// Parses `{"action": "...", "sensor": "..."}`.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let request: RawRequest = serde_json::from_str(raw)?;

        let action = match request.action.as_str() {
            "subscribe" => Action::Subscribe,
            "unsubscribe" => Action::Unsubscribe,
            other => {
                return Err(malformed_error(
                    MalformedErrorKind::UnknownAction,
                    &format!("unknown action '{other}'"),
                ))
            }
        };

        let sensor = request.sensor.ok_or_else(|| {
            malformed_error(MalformedErrorKind::InvalidFormat, "missing sensor name")
        })?;

        Ok(Self { action, sensor })
    }
}

/// Machine-readable reason carried by every error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RateLimited,
    InvalidFormat,
    UnknownAction,
    InvalidSensor,
    SubscribeFailed,
    UnsubscribeFailed,
}

impl ErrorCode {
    /// Client-facing message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::RateLimited => {
                "Rate limit exceeded. Please wait before sending more messages."
            }
            ErrorCode::InvalidFormat => "Invalid message format",
            ErrorCode::UnknownAction => "Unknown action",
            ErrorCode::InvalidSensor => "Invalid sensor name",
            ErrorCode::SubscribeFailed => "Failed to subscribe to sensor",
            ErrorCode::UnsubscribeFailed => "Failed to unsubscribe from sensor",
        }
    }

    /// Code for a rejected client message. Broker failures are classified by
    /// the caller, which knows whether it was subscribing or unsubscribing.
    pub fn for_request_error(err: &Error) -> Self {
        match &err.error_kind {
            ErrorKind::RateLimited => ErrorCode::RateLimited,
            ErrorKind::Malformed(MalformedErrorKind::UnknownAction) => ErrorCode::UnknownAction,
            ErrorKind::Malformed(MalformedErrorKind::InvalidSensor) => ErrorCode::InvalidSensor,
            _ => ErrorCode::InvalidFormat,
        }
    }
}

/// Status replies sent to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Authenticated,
    Subscribed {
        sensor: String,
        topic: String,
    },
    Unsubscribed {
        sensor: String,
        topic: String,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sensor: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
}

impl Reply {
    pub fn error(code: ErrorCode) -> Self {
        Reply::Error {
            code,
            message: code.message().to_string(),
            sensor: None,
            topic: None,
        }
    }

    pub fn sensor_error(code: ErrorCode, sensor: &str, topic: Option<&str>) -> Self {
        Reply::Error {
            code,
            message: code.message().to_string(),
            sensor: Some(sensor.to_string()),
            topic: topic.map(str::to_string),
        }
    }
}

/// A broker message forwarded to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    #[serde(rename = "type")]
    pub topic: String,
    pub message: String,
}

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseReason {
    pub const AUTHENTICATION_FAILED: CloseReason = CloseReason {
        code: 1008,
        reason: "Authentication failed",
    };
    pub const AUTHENTICATION_TIMEOUT: CloseReason = CloseReason {
        code: 1008,
        reason: "Authentication timeout",
    };
    pub const HEARTBEAT_TIMEOUT: CloseReason = CloseReason {
        code: 1001,
        reason: "Heartbeat timeout",
    };
    pub const SHUTTING_DOWN: CloseReason = CloseReason {
        code: 1001,
        reason: "Server shutting down",
    };
}

/// Frames the server hands to a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close(CloseReason),
}

impl Outbound {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, Error> {
        Ok(Outbound::Text(serde_json::to_string(value)?))
    }
}

/// Frames a connection's reader hands to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Pong,
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_subscribe_and_unsubscribe() {
        assert_eq!(
            ClientRequest::parse(r#"{"action":"subscribe","sensor":"t1"}"#).unwrap(),
            ClientRequest {
                action: Action::Subscribe,
                sensor: "t1".to_string()
            }
        );
        assert_eq!(
            ClientRequest::parse(r#"{"action":"unsubscribe","sensor":"t1"}"#)
                .unwrap()
                .action,
            Action::Unsubscribe
        );
    }

    #[test]
    fn test_parse_errors_map_to_codes() {
        let cases = [
            ("not json", ErrorCode::InvalidFormat),
            (r#"{"sensor":"t1"}"#, ErrorCode::InvalidFormat),
            (r#"[1,2]"#, ErrorCode::InvalidFormat),
            (r#"{"action":"publish","sensor":"t1"}"#, ErrorCode::UnknownAction),
            (r#"{"action":"subscribe"}"#, ErrorCode::InvalidFormat),
            (r#"{"action":"subscribe","sensor":null}"#, ErrorCode::InvalidFormat),
            (r#"{"action":"subscribe","sensor":7}"#, ErrorCode::InvalidFormat),
        ];
        for (raw, code) in cases {
            let err = ClientRequest::parse(raw).unwrap_err();
            assert_eq!(ErrorCode::for_request_error(&err), code, "input {raw}");
        }
    }

    #[test]
    fn test_reply_wire_format() {
        let value = serde_json::to_value(Reply::Subscribed {
            sensor: "temperature".to_string(),
            topic: "u1/temperature".to_string(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"status": "subscribed", "sensor": "temperature", "topic": "u1/temperature"})
        );

        let value = serde_json::to_value(Reply::Authenticated).unwrap();
        assert_eq!(value, json!({"status": "authenticated"}));

        let value = serde_json::to_value(Reply::error(ErrorCode::RateLimited)).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "error",
                "code": "rate_limited",
                "message": "Rate limit exceeded. Please wait before sending more messages."
            })
        );
    }

    #[test]
    fn test_delivery_wire_format() {
        let value = serde_json::to_value(Delivery {
            topic: "u1/temperature".to_string(),
            message: "21.5".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "u1/temperature", "message": "21.5"}));
    }
}
