//! Relay Configuration
//!
//! Command line surface (with environment fallbacks) and the validated
//! runtime configuration derived from it.

use axum::http::{HeaderName, Method};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::discovery::aws::TagFilter;
use crate::types::Address;

pub const DEFAULT_PURGE_METHOD: &str = "PURGE";
pub const DEFAULT_MARKER_HEADER: &str = "x-purge-regex";
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

// ============================================================
// CLI Definition
// ============================================================

#[derive(Parser, Debug)]
#[command(name = "purge-relay")]
#[command(about = "Broadcast cache PURGE requests to every discovered backend", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "PURGE_RELAY_LISTEN_ADDRESS", default_value = "127.0.0.1")]
    pub listen_address: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "PURGE_RELAY_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Port used to reach backends that were discovered without one
    #[arg(long, env = "PURGE_RELAY_DESTINATION_PORT", default_value_t = 80)]
    pub destport: u16,

    /// Time in seconds to cache the backend lookup
    #[arg(long, env = "PURGE_RELAY_CACHE_TTL", default_value_t = 60)]
    pub cache: u64,

    /// Per-backend request timeout in seconds
    #[arg(long, env = "PURGE_RELAY_BACKEND_TIMEOUT", default_value_t = 10)]
    pub backend_timeout: u64,

    /// Time in seconds the caller waits for all backends to answer
    #[arg(long, env = "PURGE_RELAY_BUDGET", default_value_t = 30)]
    pub budget: u64,

    /// How to decide the broadcast result when a backend fails
    #[arg(long, env = "PURGE_RELAY_FAILURE_POLICY", value_enum, default_value_t = FailurePolicy::WaitAll)]
    pub failure_policy: FailurePolicy,

    /// Request method accepted for broadcast
    #[arg(long, default_value = DEFAULT_PURGE_METHOD)]
    pub purge_method: String,

    /// Header that must be present on a purge request
    #[arg(long, default_value = DEFAULT_MARKER_HEADER)]
    pub marker_header: String,

    /// Largest purge body accepted, in bytes
    #[arg(long, env = "PURGE_RELAY_BODY_LIMIT", default_value_t = DEFAULT_BODY_LIMIT)]
    pub body_limit: usize,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub provider: ProviderCommand,
}

/// Backend discovery provider selection
#[derive(Subcommand, Debug, Clone)]
pub enum ProviderCommand {
    /// Discover running EC2 instances matching every tag
    Aws {
        /// AWS region (defaults to the instance metadata region)
        #[arg(long, env = "AWS_REGION")]
        region: Option<String>,

        /// Key:value pair of tags to match EC2 instances
        #[arg(required = true, value_name = "TAG:VALUE")]
        tags: Vec<TagFilter>,
    },

    /// Discover running GCE instances by name prefix
    Gce {
        /// GCP project ID
        #[arg(long, env = "GCE_PROJECT")]
        project: String,

        /// GCP region whose zones are searched
        #[arg(long, env = "GCE_REGION")]
        region: String,

        /// Match instances whose name contains this prefix
        #[arg(long, env = "GCE_NAME_PREFIX")]
        name_prefix: String,

        /// Service account key file (defaults to the metadata server)
        #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
        credentials: Option<PathBuf>,
    },

    /// Use a fixed list of backends
    Static {
        /// Backend address (host or host:port), repeatable
        #[arg(long = "backend", required = true, value_name = "ADDRESS")]
        backends: Vec<Address>,
    },
}

/// Broadcast failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FailurePolicy {
    /// Wait for every backend (or the budget) before deciding
    #[default]
    WaitAll,
    /// Decide as soon as one backend fails
    ShortCircuit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

// ============================================================
// Runtime Configuration
// ============================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid purge method: {0}")]
    InvalidMethod(String),

    #[error("invalid marker header name: {0}")]
    InvalidHeader(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("backend timeout ({timeout:?}) must not exceed the broadcast budget ({budget:?})")]
    TimeoutExceedsBudget { timeout: Duration, budget: Duration },
}

/// Validated relay settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub destination_port: u16,
    pub directory_ttl: Duration,
    pub per_backend_timeout: Duration,
    pub overall_budget: Duration,
    pub failure_policy: FailurePolicy,
    pub purge_method: String,
    pub marker_header: HeaderName,
    pub body_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8000)),
            destination_port: 80,
            directory_ttl: Duration::from_secs(60),
            per_backend_timeout: Duration::from_secs(10),
            overall_budget: Duration::from_secs(30),
            failure_policy: FailurePolicy::WaitAll,
            purge_method: DEFAULT_PURGE_METHOD.to_string(),
            marker_header: HeaderName::from_static(DEFAULT_MARKER_HEADER),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.purge_method.is_empty() || Method::from_bytes(self.purge_method.as_bytes()).is_err()
        {
            return Err(ConfigError::InvalidMethod(self.purge_method.clone()));
        }
        if self.overall_budget.is_zero() {
            return Err(ConfigError::ZeroDuration("budget"));
        }
        if self.per_backend_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("backend timeout"));
        }
        if self.per_backend_timeout > self.overall_budget {
            return Err(ConfigError::TimeoutExceedsBudget {
                timeout: self.per_backend_timeout,
                budget: self.overall_budget,
            });
        }
        Ok(())
    }
}

impl TryFrom<&Cli> for RelayConfig {
    type Error = ConfigError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let marker_header = HeaderName::from_bytes(cli.marker_header.as_bytes())
            .map_err(|_| ConfigError::InvalidHeader(cli.marker_header.clone()))?;

        let config = Self {
            listen_addr: SocketAddr::new(cli.listen_address, cli.port),
            destination_port: cli.destport,
            directory_ttl: Duration::from_secs(cli.cache),
            per_backend_timeout: Duration::from_secs(cli.backend_timeout),
            overall_budget: Duration::from_secs(cli.budget),
            failure_policy: cli.failure_policy,
            purge_method: cli.purge_method.clone(),
            marker_header,
            body_limit: cli.body_limit,
        };

        config.validate()?;
        Ok(config)
    }
}
