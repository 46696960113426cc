//! Purge Relay
//!
//! Accepts one cache PURGE request and replays it against every backend
//! of a dynamically discovered fleet (EC2 by tag, GCE by name prefix, or a
//! static list), then answers the caller with a single status:
//!
//! - `200` when every backend confirmed the purge
//! - `500` when any backend failed, timed out or answered 5xx
//! - `400` when the request is not a purge
//! - `503` when no backend list could ever be obtained

pub mod broadcast;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod server;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::{Cli, FailurePolicy, RelayConfig};
pub use directory::BackendDirectory;
pub use error::RelayError;
pub use server::{router, serve, RelayState};
