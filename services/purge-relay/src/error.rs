//! Relay Errors
//!
//! One error type per stage of a broadcast. Only `RelayError` is ever
//! turned into a client response, and it never carries per-backend detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::types::AggregateResult;

/// Inbound request does not qualify for broadcast
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid method: expected {expected}, got {got}")]
    InvalidMethod { expected: String, got: String },

    #[error("missing required header: {0}")]
    MissingHeader(String),

    #[error("unreadable request body: {0}")]
    UnreadableBody(String),
}

/// Backend directory could not be populated
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("{provider} authentication failed: {source:#}")]
    Authentication {
        provider: &'static str,
        source: anyhow::Error,
    },

    #[error("{provider} backend lookup failed: {source:#}")]
    Lookup {
        provider: &'static str,
        source: anyhow::Error,
    },
}

/// Per-backend copy of the purge could not be built
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("cannot address backend {target}: {reason}")]
    InvalidTarget { target: String, reason: String },
}

/// Per-backend network exchange did not complete
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("backend request timed out")]
    Timeout,

    #[error("connection to backend failed: {0}")]
    Connect(String),

    #[error("backend request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Timeout
        } else if err.is_connect() {
            DeliveryError::Connect(format!("{:#}", anyhow::Error::from(err)))
        } else {
            DeliveryError::Request(format!("{:#}", anyhow::Error::from(err)))
        }
    }
}

/// Anything that ends a broadcast with a non-success response
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("broadcast degraded: {} of {} backends reported", .0.received, .0.expected)]
    Degraded(AggregateResult),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Discovery(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Degraded(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            RelayError::Validation(err) => err.to_string(),
            RelayError::Discovery(_) => "backend directory unavailable".to_string(),
            RelayError::Degraded(_) => status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string(),
        };
        (status, body).into_response()
    }
}
