//! Purge Relay Types
//!
//! Core types shared by the backend directory, the dispatcher and the
//! aggregator: backend addresses, delivery outcomes and the aggregate
//! judgment handed back to the caller.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Network endpoint of one backend cache server.
///
/// The port is optional; when absent the relay's configured destination
/// port is used at delivery time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: String,
    port: Option<u16>,
}

/// Error returned when a backend address string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid backend address '{input}': {reason}")]
pub struct AddressParseError {
    input: String,
    reason: &'static str,
}

impl AddressParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

impl Address {
    /// Create an address without validating the host.
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host:port` form used to reach the backend, falling back to
    /// `default_port` when the address carries none.
    pub fn authority(&self, default_port: u16) -> String {
        let port = self.port.unwrap_or(default_port);
        if self.is_ipv6() {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }

    fn is_ipv6(&self) -> bool {
        self.host.parse::<Ipv6Addr>().is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.port, self.is_ipv6()) {
            (Some(port), true) => write!(f, "[{}]:{}", self.host, port),
            (Some(port), false) => write!(f, "{}:{}", self.host, port),
            (None, _) => write!(f, "{}", self.host),
        }
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim();
        if s.is_empty() {
            return Err(AddressParseError::new(input, "empty address"));
        }

        // Bare IPv4 or IPv6 literal without a port
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self::new(ip.to_string(), None));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| AddressParseError::new(input, "unterminated '[' in IPv6 address"))?;
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(AddressParseError::new(input, "bracketed host is not an IPv6 address"));
            }
            let port = match after {
                "" => None,
                _ => Some(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| AddressParseError::new(input, "unexpected text after ']'"))?,
                ),
            };
            (host, port)
        } else {
            match s.split_once(':') {
                Some((host, port)) if !port.contains(':') => (host, Some(port)),
                Some(_) => {
                    return Err(AddressParseError::new(
                        input,
                        "IPv6 addresses with a port must use [host]:port",
                    ))
                }
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(AddressParseError::new(input, "empty host"));
        }
        if host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '?' | '#'))
        {
            return Err(AddressParseError::new(input, "host contains forbidden characters"));
        }

        let port = port
            .map(|p| {
                p.parse::<u16>()
                    .map_err(|_| AddressParseError::new(input, "port is not a number in 0-65535"))
            })
            .transpose()?;

        Ok(Self::new(host, port))
    }
}

/// Immutable, de-duplicated list of backends from one discovery cycle.
///
/// Cloning is cheap; every clone shares the same allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSet(Arc<[Address]>);

impl Default for BackendSet {
    fn default() -> Self {
        Self(Vec::new().into())
    }
}

impl BackendSet {
    /// Build a set from raw discovery output, keeping the first occurrence
    /// of each address so ordering stays stable across refreshes.
    pub fn from_discovered(addresses: impl IntoIterator<Item = Address>) -> Self {
        let mut unique: Vec<Address> = Vec::new();
        for address in addresses {
            if !unique.contains(&address) {
                unique.push(address);
            }
        }
        Self(unique.into())
    }

    /// True when both sets share the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for BackendSet {
    type Target = [Address];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, address) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", address)?;
        }
        write!(f, "]")
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The backend answered; carries the HTTP status code whatever its class
    Succeeded(u16),
    /// The request could not be built or the exchange did not complete
    Failed(String),
    /// No report arrived before the broadcast budget elapsed
    TimedOut,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Succeeded(code) => write!(f, "succeeded ({})", code),
            DeliveryStatus::Failed(reason) => write!(f, "failed ({})", reason),
            DeliveryStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Per-backend outcome of one broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub address: Address,
    pub status: DeliveryStatus,
}

impl DeliveryOutcome {
    pub fn succeeded(address: Address, code: u16) -> Self {
        Self {
            address,
            status: DeliveryStatus::Succeeded(code),
        }
    }

    pub fn failed(address: Address, reason: impl Into<String>) -> Self {
        Self {
            address,
            status: DeliveryStatus::Failed(reason.into()),
        }
    }

    pub fn timed_out(address: Address) -> Self {
        Self {
            address,
            status: DeliveryStatus::TimedOut,
        }
    }

    /// Whether the backend actually reported (as opposed to being
    /// recorded as timed out by the dispatcher).
    pub fn reported(&self) -> bool {
        !matches!(self.status, DeliveryStatus::TimedOut)
    }
}

/// Overall judgment of one broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    Ok,
    Degraded,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallStatus::Ok => write!(f, "ok"),
            OverallStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Reduction of all delivery outcomes of one broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateResult {
    pub status: OverallStatus,
    /// Outcomes that were reported by a delivery task
    pub received: usize,
    /// Backends the broadcast was dispatched to
    pub expected: usize,
}

impl AggregateResult {
    pub fn is_ok(&self) -> bool {
        self.status == OverallStatus::Ok
    }
}
