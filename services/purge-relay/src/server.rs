//! Relay Server
//!
//! Every path and method lands on one fallback handler, which runs the
//! broadcast pipeline inside a span tagged with a fresh `broadcast_id`.

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::broadcast::{
    status_code, BroadcastRequest, Broadcaster, Dispatcher, RequestCloner, RequestValidator,
};
use crate::config::RelayConfig;
use crate::directory::BackendDirectory;
use crate::error::RelayError;

/// Shared state handed to every request
#[derive(Clone)]
pub struct RelayState {
    directory: Arc<BackendDirectory>,
    broadcaster: Arc<Broadcaster>,
    validator: Arc<RequestValidator>,
    body_limit: usize,
}

impl RelayState {
    pub fn new(
        directory: Arc<BackendDirectory>,
        broadcaster: Broadcaster,
        validator: RequestValidator,
        body_limit: usize,
    ) -> Self {
        Self {
            directory,
            broadcaster: Arc::new(broadcaster),
            validator: Arc::new(validator),
            body_limit,
        }
    }

    pub fn from_config(config: &RelayConfig, directory: Arc<BackendDirectory>) -> Result<Self> {
        let dispatcher = Dispatcher::new(config.per_backend_timeout, config.failure_policy)
            .context("Failed to build dispatcher")?;
        let broadcaster = Broadcaster::new(
            RequestCloner::new(config.destination_port),
            dispatcher,
            config.overall_budget,
        );
        let validator = RequestValidator::new(config.purge_method.clone(), config.marker_header.clone());

        Ok(Self::new(directory, broadcaster, validator, config.body_limit))
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .fallback(relay_purge)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn relay_purge(State(state): State<RelayState>, request: Request<Body>) -> Response {
    let span = info_span!(
        "broadcast",
        broadcast_id = %Uuid::new_v4(),
        method = %request.method(),
        uri = %request.uri()
    );

    match handle_purge(&state, request).instrument(span).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_purge(state: &RelayState, request: Request<Body>) -> Result<(), RelayError> {
    state.validator.validate(&request)?;
    let template = BroadcastRequest::from_request(request, state.body_limit).await?;

    let backends = state.directory.get_backends().await?;
    let result = state.broadcaster.broadcast(&template, &backends).await;

    if status_code(&result).is_success() {
        Ok(())
    } else {
        Err(RelayError::Degraded(result))
    }
}

/// Serve until Ctrl-C or SIGTERM.
pub async fn serve(listener: tokio::net::TcpListener, state: RelayState) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Purge relay listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Purge relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining in-flight purges");
}
