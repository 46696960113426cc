//! Google Compute Engine discovery
//!
//! Lists the internal IPs of running instances whose name contains a prefix,
//! across every zone of one region. Access tokens come from a service account
//! key (signed JWT grant) or, without a key file, the metadata server.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::DiscoveryProvider;
use crate::types::Address;

const COMPUTE_API_BASE: &str = "https://compute.googleapis.com/compute/v1";
const COMPUTE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/compute.readonly";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Tokens are renewed this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

fn zone_filter(region: &str) -> String {
    format!("region eq .*{}.*", region)
}

fn instance_filter(name_prefix: &str) -> String {
    format!("(name eq .*{}.*) (status eq RUNNING)", name_prefix)
}

// ============================================================
// Credentials
// ============================================================

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct ServiceAccountClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn from_response(response: TokenResponse) -> Self {
        Self {
            value: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        }
    }

    fn is_usable(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

enum TokenSource {
    ServiceAccount(ServiceAccountKey),
    Metadata { token_url: String },
}

impl TokenSource {
    fn metadata_default() -> Self {
        let host =
            env::var("GCE_METADATA_HOST").unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string());
        Self::Metadata {
            token_url: format!(
                "http://{}/computeMetadata/v1/instance/service-accounts/default/token",
                host
            ),
        }
    }
}

// ============================================================
// Compute API Responses
// ============================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneList {
    #[serde(default)]
    items: Vec<Zone>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Zone {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceList {
    #[serde(default)]
    items: Vec<GceInstance>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceInstance {
    name: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
struct NetworkInterface {
    #[serde(rename = "networkIP", default)]
    network_ip: Option<String>,
}

trait Page {
    fn next_page_token(&self) -> Option<&str>;
}

impl Page for ZoneList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

impl Page for InstanceList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

// ============================================================
// Provider
// ============================================================

pub struct GceProvider {
    http_client: reqwest::Client,
    project: String,
    region: String,
    name_prefix: String,
    api_base: String,
    token_source: TokenSource,
    token: RwLock<Option<AccessToken>>,
}

impl GceProvider {
    pub fn new(
        project: &str,
        region: &str,
        name_prefix: &str,
        credentials: Option<PathBuf>,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let token_source = match credentials {
            Some(path) => {
                let data = std::fs::read_to_string(&path).with_context(|| {
                    format!("Failed to read service account key from {}", path.display())
                })?;
                let key: ServiceAccountKey = serde_json::from_str(&data)
                    .context("Failed to parse service account key")?;
                TokenSource::ServiceAccount(key)
            }
            None => TokenSource::metadata_default(),
        };

        Ok(Self {
            http_client,
            project: project.to_string(),
            region: region.to_string(),
            name_prefix: name_prefix.to_string(),
            api_base: COMPUTE_API_BASE.to_string(),
            token_source,
            token: RwLock::new(None),
        })
    }

    /// Use a different Compute API base URL and metadata token URL.
    pub fn with_endpoints(mut self, api_base: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self.token_source = TokenSource::Metadata {
            token_url: token_url.into(),
        };
        self
    }

    fn service_account_assertion(key: &ServiceAccountKey, token_uri: &str) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = ServiceAccountClaims {
            iss: &key.client_email,
            scope: COMPUTE_READONLY_SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + 3600,
        };

        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("Failed to parse service account private key")?;

        encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .context("Failed to encode JWT")
    }

    async fn fetch_token(&self) -> Result<AccessToken> {
        let response = match &self.token_source {
            TokenSource::ServiceAccount(key) => {
                let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
                let assertion = Self::service_account_assertion(key, token_uri)?;
                self.http_client
                    .post(token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
                    .send()
                    .await
                    .context("Failed to call Google OAuth token endpoint")?
            }
            TokenSource::Metadata { token_url } => self
                .http_client
                .get(token_url)
                .header("Metadata-Flavor", "Google")
                .send()
                .await
                .context("Failed to reach GCE metadata server")?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GCP token request failed with {}: {}", status, body);
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse GCP token response")?;
        Ok(AccessToken::from_response(token))
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.is_usable() {
                return Ok(token.value.clone());
            }
        }

        let token = self.fetch_token().await?;
        let value = token.value.clone();
        *self.token.write().await = Some(token);
        Ok(value)
    }

    /// Fetch every page of a list call.
    async fn list_all<T: DeserializeOwned + Page>(&self, url: &str, filter: &str) -> Result<Vec<T>> {
        let token = self.access_token().await?;
        let mut pages = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http_client
                .get(url)
                .bearer_auth(&token)
                .query(&[("filter", filter)]);
            if let Some(page_token) = &page_token {
                request = request.query(&[("pageToken", page_token.as_str())]);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("Failed to call {}", url))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Compute API {} failed with {}: {}", url, status, body);
            }

            let page: T = response
                .json()
                .await
                .with_context(|| format!("Failed to parse response from {}", url))?;
            page_token = page.next_page_token().map(str::to_string);
            pages.push(page);

            if page_token.is_none() {
                break;
            }
        }

        Ok(pages)
    }

    async fn list_zones(&self) -> Result<Vec<String>> {
        let url = format!("{}/projects/{}/zones", self.api_base, self.project);
        let pages: Vec<ZoneList> = self.list_all(&url, &zone_filter(&self.region)).await?;

        let zones: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.items)
            .map(|zone| zone.name)
            .collect();
        for zone in &zones {
            debug!("Found zone: {}", zone);
        }
        Ok(zones)
    }

    async fn list_zone_ips(&self, zone: &str) -> Result<Vec<String>> {
        debug!("Checking zone: {}", zone);
        let url = format!(
            "{}/projects/{}/zones/{}/instances",
            self.api_base, self.project, zone
        );
        let pages: Vec<InstanceList> = self
            .list_all(&url, &instance_filter(&self.name_prefix))
            .await?;

        let mut ips = Vec::new();
        for instance in pages.into_iter().flat_map(|page| page.items) {
            debug!("Found instance: {}", instance.name);
            for interface in instance.network_interfaces {
                if let Some(ip) = interface.network_ip.filter(|ip| !ip.is_empty()) {
                    debug!("Found address: {}", ip);
                    ips.push(ip);
                }
            }
        }
        Ok(ips)
    }
}

#[async_trait]
impl DiscoveryProvider for GceProvider {
    fn name(&self) -> &'static str {
        "gce"
    }

    async fn authenticate(&self) -> Result<()> {
        self.access_token().await?;
        info!(
            "GCE provider ready for project {} in region {}",
            self.project, self.region
        );
        Ok(())
    }

    async fn list_backend_addresses(&self) -> Result<Vec<Address>> {
        let zones = self.list_zones().await?;
        let per_zone = try_join_all(zones.iter().map(|zone| self.list_zone_ips(zone))).await?;

        Ok(per_zone
            .into_iter()
            .flatten()
            .map(|ip| Address::new(ip, None))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    #[test]
    fn test_filters() {
        assert_eq!(zone_filter("europe-west1"), "region eq .*europe-west1.*");
        assert_eq!(
            instance_filter("varnish"),
            "(name eq .*varnish.*) (status eq RUNNING)"
        );
    }

    #[test]
    fn test_parse_instance_list() {
        let body = json!({
            "kind": "compute#instanceList",
            "items": [
                {
                    "name": "varnish-1",
                    "status": "RUNNING",
                    "networkInterfaces": [
                        { "name": "nic0", "networkIP": "10.132.0.2" },
                        { "name": "nic1", "networkIP": "10.133.0.2" }
                    ]
                },
                { "name": "varnish-2" }
            ],
            "nextPageToken": "next"
        });

        let list: InstanceList = serde_json::from_value(body).unwrap();
        assert_eq!(list.items.len(), 2);
        assert_eq!(
            list.items[0].network_interfaces[1].network_ip.as_deref(),
            Some("10.133.0.2")
        );
        assert!(list.items[1].network_interfaces.is_empty());
        assert_eq!(list.next_page_token(), Some("next"));

        let empty: ZoneList = serde_json::from_value(json!({ "kind": "compute#zoneList" })).unwrap();
        assert!(empty.items.is_empty());
        assert_eq!(empty.next_page_token(), None);
    }

    async fn spawn_compute_api() -> String {
        async fn token(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
            match headers.get("metadata-flavor") {
                Some(v) if v == "Google" => Ok(Json(json!({
                    "access_token": "ya29.test",
                    "expires_in": 3599,
                    "token_type": "Bearer"
                }))),
                _ => Err(StatusCode::FORBIDDEN),
            }
        }

        fn authorized(headers: &HeaderMap) -> bool {
            headers
                .get("authorization")
                .map(|v| v == "Bearer ya29.test")
                .unwrap_or(false)
        }

        async fn zones(
            headers: HeaderMap,
            Query(params): Query<HashMap<String, String>>,
        ) -> Result<Json<Value>, StatusCode> {
            if !authorized(&headers) {
                return Err(StatusCode::UNAUTHORIZED);
            }
            assert_eq!(params.get("filter").map(String::as_str), Some("region eq .*europe-west1.*"));
            Ok(Json(json!({
                "items": [ { "name": "europe-west1-b" }, { "name": "europe-west1-c" } ]
            })))
        }

        async fn instances(
            headers: HeaderMap,
            Path((_project, zone)): Path<(String, String)>,
            Query(params): Query<HashMap<String, String>>,
        ) -> Result<Json<Value>, StatusCode> {
            if !authorized(&headers) {
                return Err(StatusCode::UNAUTHORIZED);
            }
            let page = params.get("pageToken").cloned();
            let body = match (zone.as_str(), page.as_deref()) {
                ("europe-west1-b", None) => json!({
                    "items": [ { "name": "varnish-b1", "networkInterfaces": [ { "networkIP": "10.0.0.1" } ] } ],
                    "nextPageToken": "p2"
                }),
                ("europe-west1-b", Some("p2")) => json!({
                    "items": [ { "name": "varnish-b2", "networkInterfaces": [ { "networkIP": "10.0.0.2" } ] } ]
                }),
                ("europe-west1-c", None) => json!({
                    "items": [ { "name": "varnish-c1", "networkInterfaces": [ { "networkIP": "10.0.1.1" } ] } ]
                }),
                _ => return Err(StatusCode::NOT_FOUND),
            };
            Ok(Json(body))
        }

        let app = Router::new()
            .route("/token", get(token))
            .route("/projects/:project/zones", get(zones))
            .route("/projects/:project/zones/:zone/instances", get(instances));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_list_collects_every_zone_and_page() {
        let base = spawn_compute_api().await;
        let provider = GceProvider::new("demo-project", "europe-west1", "varnish", None)
            .unwrap()
            .with_endpoints(base.clone(), format!("{}/token", base));

        provider.authenticate().await.unwrap();
        let addresses = provider.list_backend_addresses().await.unwrap();

        assert_eq!(
            addresses,
            vec![
                Address::new("10.0.0.1", None),
                Address::new("10.0.0.2", None),
                Address::new("10.0.1.1", None),
            ]
        );
    }

    #[test]
    fn test_missing_key_file_fails() {
        let result = GceProvider::new(
            "demo-project",
            "europe-west1",
            "varnish",
            Some(PathBuf::from("/nonexistent/key.json")),
        );
        assert!(result.is_err());
    }
}
