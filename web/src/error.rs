use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use domain::error::{Error as DomainError, ErrorKind, TransportErrorKind};

extern crate log;
use log::*;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error(DomainError);

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

// List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html#associatedconstant.UNPROCESSABLE_ENTITY
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        warn!("Request failed: {}", self.0);
        match self.0.error_kind {
            ErrorKind::Auth(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED").into_response(),
            ErrorKind::RateLimited => {
                (StatusCode::TOO_MANY_REQUESTS, "TOO MANY REQUESTS").into_response()
            }
            ErrorKind::Malformed(_) => (StatusCode::BAD_REQUEST, "BAD REQUEST").into_response(),
            ErrorKind::Broker(_) => (StatusCode::BAD_GATEWAY, "BAD GATEWAY").into_response(),
            ErrorKind::Transport(transport_error_kind) => match transport_error_kind {
                TransportErrorKind::ShuttingDown => {
                    (StatusCode::SERVICE_UNAVAILABLE, "SERVICE UNAVAILABLE").into_response()
                }
                TransportErrorKind::ClientClosed => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR").into_response()
                }
            },
            ErrorKind::Config => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR").into_response()
            }
        }
    }
}

impl<E> From<E> for Error
where
    E: Into<DomainError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
