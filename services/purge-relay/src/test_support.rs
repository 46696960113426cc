//! Loopback cache backends for dispatcher and server tests

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::types::Address;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
struct BackendState {
    status: StatusCode,
    delay: Duration,
    seen: Arc<Mutex<Vec<RecordedRequest>>>,
}

async fn record(State(state): State<BackendState>, request: Request<Body>) -> StatusCode {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    state.seen.lock().unwrap().push(RecordedRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
    });
    tokio::time::sleep(state.delay).await;
    state.status
}

/// Handle to a running fake cache
pub struct FakeBackend {
    pub address: Address,
    seen: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FakeBackend {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.seen.lock().unwrap().clone()
    }
}

/// Start a backend on 127.0.0.1 that answers every request with `status`
/// after `delay`.
pub async fn spawn_backend(status: StatusCode, delay: Duration) -> FakeBackend {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let state = BackendState {
        status,
        delay,
        seen: seen.clone(),
    };
    let app = Router::new().fallback(record).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeBackend {
        address: Address::new("127.0.0.1", Some(port)),
        seen,
    }
}

/// An address on which nothing is listening.
pub async fn refused_address() -> Address {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Address::new("127.0.0.1", Some(port))
}
