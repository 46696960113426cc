//! Per-backend copies of the inbound purge

use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Request};
use reqwest::Url;

use crate::error::{CloneError, ValidationError};
use crate::types::Address;

/// Headers that describe the inbound connection rather than the purge
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Validated inbound request, fully buffered. Read-only template for every clone.
#[derive(Debug, Clone)]
pub struct BroadcastRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BroadcastRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers,
            body,
        }
    }

    /// Buffer the inbound request, rejecting bodies over `limit` bytes.
    pub async fn from_request(request: Request<Body>, limit: usize) -> Result<Self, ValidationError> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, limit)
            .await
            .map_err(|e| ValidationError::UnreadableBody(e.to_string()))?;

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self::new(parts.method, path_and_query, parts.headers, body))
    }
}

/// One backend's copy, ready to send
#[derive(Debug, Clone)]
pub struct ClonedRequest {
    pub target: Address,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestCloner {
    destination_port: u16,
}

impl RequestCloner {
    pub fn new(destination_port: u16) -> Self {
        Self { destination_port }
    }

    pub fn clone_for(&self, template: &BroadcastRequest, target: &Address) -> Result<ClonedRequest, CloneError> {
        let authority = target.authority(self.destination_port);
        let invalid = |reason: String| CloneError::InvalidTarget {
            target: target.to_string(),
            reason,
        };

        let url = Url::parse(&format!("http://{}{}", authority, template.path_and_query))
            .map_err(|e| invalid(e.to_string()))?;
        if url.host_str().is_none() {
            return Err(invalid("no host in backend URL".to_string()));
        }

        let mut headers = template.headers.clone();
        strip_hop_by_hop(&mut headers);

        if !headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(&authority).map_err(|e| invalid(e.to_string()))?;
            headers.insert(header::HOST, host);
        }

        Ok(ClonedRequest {
            target: target.clone(),
            method: template.method.clone(),
            url,
            headers,
            body: template.body.clone(),
        })
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Names listed in Connection are hop-by-hop for this exchange only
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(&name);
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    let proxy: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("proxy-"))
        .cloned()
        .collect();
    for name in proxy {
        headers.remove(&name);
    }
}
