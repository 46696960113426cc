//! Request Validator

use axum::http::{HeaderName, Request};

use crate::error::ValidationError;

/// Decides whether an inbound request qualifies for broadcast.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    method: String,
    marker_header: HeaderName,
}

impl RequestValidator {
    pub fn new(method: impl Into<String>, marker_header: HeaderName) -> Self {
        Self {
            method: method.into(),
            marker_header,
        }
    }

    /// Method is checked before the marker header; the header value is not interpreted.
    pub fn validate<B>(&self, request: &Request<B>) -> Result<(), ValidationError> {
        if request.method().as_str() != self.method {
            return Err(ValidationError::InvalidMethod {
                expected: self.method.clone(),
                got: request.method().to_string(),
            });
        }

        if !request.headers().contains_key(&self.marker_header) {
            return Err(ValidationError::MissingHeader(self.marker_header.to_string()));
        }

        Ok(())
    }
}
