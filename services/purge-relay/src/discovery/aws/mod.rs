//! AWS EC2 discovery
//!
//! Lists the private IPs of running instances that carry every configured
//! tag, via signed `DescribeInstances` Query API calls.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

mod credentials;
pub mod sigv4;

pub use credentials::{AwsCredentials, InstanceMetadata};

use super::DiscoveryProvider;
use crate::types::Address;

const EC2_API_VERSION: &str = "2016-11-15";
const EC2_SERVICE: &str = "ec2";

// ============================================================
// Tag Filters
// ============================================================

/// One `TAG:VALUE` instance filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    key: String,
    value: String,
}

#[derive(Debug, Error)]
#[error("expected TAG:VALUE got {0}")]
pub struct TagParseError(String);

impl TagFilter {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl FromStr for TagFilter {
    type Err = TagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((key, value)) if !key.is_empty() => Ok(Self {
                key: key.to_string(),
                value: value.to_string(),
            }),
            _ => Err(TagParseError(s.to_string())),
        }
    }
}

/// Query parameters selecting running instances that match every tag
fn build_filter_params(tags: &[TagFilter]) -> Vec<(String, String)> {
    let mut params = Vec::with_capacity((tags.len() + 1) * 2);

    for (i, tag) in tags.iter().enumerate() {
        let n = i + 1;
        params.push((format!("Filter.{}.Name", n), format!("tag:{}", tag.key)));
        params.push((format!("Filter.{}.Value.1", n), tag.value.clone()));
    }

    let n = tags.len() + 1;
    params.push((format!("Filter.{}.Name", n), "instance-state-name".to_string()));
    params.push((format!("Filter.{}.Value.1", n), "running".to_string()));

    params
}

// ============================================================
// DescribeInstances Response
// ============================================================

#[derive(Debug, Deserialize)]
struct DescribeInstancesResponse {
    #[serde(rename = "reservationSet", default)]
    reservation_set: ReservationSet,
    #[serde(rename = "nextToken", default)]
    next_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReservationSet {
    #[serde(rename = "item", default)]
    items: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
struct Reservation {
    #[serde(rename = "instancesSet", default)]
    instances_set: InstancesSet,
}

#[derive(Debug, Default, Deserialize)]
struct InstancesSet {
    #[serde(rename = "item", default)]
    items: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct Instance {
    #[serde(rename = "instanceId", default)]
    instance_id: Option<String>,
    #[serde(rename = "privateIpAddress", default)]
    private_ip_address: Option<String>,
}

/// One page of results: private IPs plus the continuation token
fn parse_describe_instances(body: &str) -> Result<(Vec<String>, Option<String>)> {
    let response: DescribeInstancesResponse =
        quick_xml::de::from_str(body).context("Failed to parse DescribeInstances XML response")?;

    let ips = response
        .reservation_set
        .items
        .into_iter()
        .flat_map(|reservation| reservation.instances_set.items)
        .filter_map(|instance| match instance.private_ip_address {
            Some(ip) if !ip.is_empty() => Some(ip),
            _ => {
                debug!(
                    "Skipping instance {} without a private IP",
                    instance.instance_id.as_deref().unwrap_or("<unknown>")
                );
                None
            }
        })
        .collect();

    let next_token = response.next_token.filter(|t| !t.is_empty());
    Ok((ips, next_token))
}

// ============================================================
// Provider
// ============================================================

pub struct AwsProvider {
    http_client: reqwest::Client,
    configured_region: Option<String>,
    tags: Vec<TagFilter>,
    /// Overrides `https://ec2.{region}.amazonaws.com/`
    endpoint: Option<Url>,
    metadata: InstanceMetadata,
    region: RwLock<Option<String>>,
    credentials: RwLock<Option<AwsCredentials>>,
}

impl AwsProvider {
    pub fn new(region: Option<String>, tags: Vec<TagFilter>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let configured_region = region
            .or_else(|| env::var("AWS_DEFAULT_REGION").ok())
            .filter(|r| !r.is_empty());

        Ok(Self {
            metadata: InstanceMetadata::new(http_client.clone()),
            http_client,
            configured_region,
            tags,
            endpoint: None,
            region: RwLock::new(None),
            credentials: RwLock::new(None),
        })
    }

    /// Point the provider at a different EC2 endpoint and credentials.
    pub fn with_endpoint(mut self, endpoint: Url, credentials: AwsCredentials) -> Self {
        self.endpoint = Some(endpoint);
        self.credentials = RwLock::new(Some(credentials));
        self
    }

    async fn resolve_region(&self) -> Result<String> {
        if let Some(region) = self.region.read().await.clone() {
            return Ok(region);
        }

        let region = match &self.configured_region {
            Some(region) => region.clone(),
            None => self
                .metadata
                .region()
                .await
                .context("Unable to retrieve the region from the EC2 instance")?,
        };

        *self.region.write().await = Some(region.clone());
        Ok(region)
    }

    /// Current credentials, refreshed from the instance role when close to expiry
    async fn current_credentials(&self) -> Result<AwsCredentials> {
        {
            let guard = self.credentials.read().await;
            if let Some(creds) = guard.as_ref() {
                if !creds.needs_refresh(Utc::now()) {
                    return Ok(creds.clone());
                }
            }
        }

        let creds = match AwsCredentials::from_env() {
            Some(creds) => {
                debug!("Using AWS credentials from environment");
                creds
            }
            None => self
                .metadata
                .role_credentials()
                .await
                .context("No AWS credentials in environment or instance role")?,
        };

        *self.credentials.write().await = Some(creds.clone());
        Ok(creds)
    }

    fn endpoint_for(&self, region: &str) -> Result<Url> {
        match &self.endpoint {
            Some(url) => Ok(url.clone()),
            None => Url::parse(&format!("https://ec2.{}.amazonaws.com/", region))
                .with_context(|| format!("Invalid EC2 endpoint for region {}", region)),
        }
    }

    async fn describe_instances_page(
        &self,
        region: &str,
        credentials: &AwsCredentials,
        next_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let endpoint = self.endpoint_for(region)?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => anyhow::bail!("EC2 endpoint {} has no host", endpoint),
        };

        let mut params = vec![
            ("Action".to_string(), "DescribeInstances".to_string()),
            ("Version".to_string(), EC2_API_VERSION.to_string()),
        ];
        params.extend(build_filter_params(&self.tags));
        if let Some(token) = next_token {
            params.push(("NextToken".to_string(), token.to_string()));
        }
        let query = sigv4::canonical_query(&params);

        let mut signed_headers = BTreeMap::new();
        if let Some(token) = &credentials.session_token {
            signed_headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        let request = sigv4::RequestToSign {
            method: "GET",
            host: &host,
            path: endpoint.path(),
            query: &query,
            headers: signed_headers.clone(),
            payload: b"",
        };
        let signature = sigv4::sign(&request, credentials, region, EC2_SERVICE, Utc::now());

        let mut url = endpoint.clone();
        url.set_query(Some(&query));

        let mut builder = self
            .http_client
            .get(url)
            .header("x-amz-date", &signature.amz_date)
            .header("authorization", &signature.authorization);
        for (name, value) in &signed_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.context("Failed to call EC2 DescribeInstances")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("EC2 DescribeInstances failed with {}: {}", status, body);
        }

        let body = response.text().await?;
        parse_describe_instances(&body)
    }
}

#[async_trait]
impl DiscoveryProvider for AwsProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn authenticate(&self) -> Result<()> {
        let region = self.resolve_region().await?;
        self.current_credentials().await?;
        info!("AWS provider ready in region {}", region);
        Ok(())
    }

    async fn list_backend_addresses(&self) -> Result<Vec<Address>> {
        let region = self.resolve_region().await?;
        let credentials = self.current_credentials().await?;

        let mut addresses = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let (ips, token) = self
                .describe_instances_page(&region, &credentials, next_token.as_deref())
                .await?;

            for ip in ips {
                debug!("Adding {} to IP list", ip);
                addresses.push(Address::new(ip, None));
            }

            match token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        Ok(addresses)
    }
}
