//! AWS credentials
//!
//! Static keys from the standard environment variables, otherwise the
//! instance role served by the EC2 metadata service (IMDSv2).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::env;
use tracing::{debug, info};

const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";
const METADATA_TOKEN_TTL_SECONDS: &str = "21600";

/// Credentials are refreshed this long before they expire
const REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// `None` for long-lived keys
    pub expires_at: Option<DateTime<Utc>>,
}

// Keep the secret out of debug logs
impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl AwsCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
            expires_at,
        }
    }

    /// Read `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Option<Self> {
        let access_key_id = env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        if access_key_id.is_empty() || secret_access_key.is_empty() {
            return None;
        }
        let session_token = env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty());
        Some(Self::new(access_key_id, secret_access_key, session_token, None))
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + ChronoDuration::minutes(REFRESH_MARGIN_MINUTES) >= expires_at,
            None => false,
        }
    }
}

/// Role credentials document returned by IMDS
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: String,
    expiration: DateTime<Utc>,
}

/// Client for the EC2 instance metadata service
pub struct InstanceMetadata {
    http_client: reqwest::Client,
    endpoint: String,
}

impl InstanceMetadata {
    pub fn new(http_client: reqwest::Client) -> Self {
        let endpoint = env::var("AWS_EC2_METADATA_SERVICE_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_METADATA_ENDPOINT.to_string());
        Self::with_endpoint(http_client, endpoint)
    }

    pub fn with_endpoint(http_client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    async fn session_token(&self) -> Result<String> {
        let response = self
            .http_client
            .put(format!("{}/latest/api/token", self.endpoint))
            .header("X-aws-ec2-metadata-token-ttl-seconds", METADATA_TOKEN_TTL_SECONDS)
            .send()
            .await
            .context("Failed to reach EC2 metadata service")?;

        if !response.status().is_success() {
            anyhow::bail!("EC2 metadata token request failed with {}", response.status());
        }

        response.text().await.context("Failed to read metadata token")
    }

    async fn get(&self, token: &str, path: &str) -> Result<String> {
        let response = self
            .http_client
            .get(format!("{}/latest/meta-data/{}", self.endpoint, path))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await
            .with_context(|| format!("Failed to fetch metadata path {}", path))?;

        if !response.status().is_success() {
            anyhow::bail!("Metadata path {} returned {}", path, response.status());
        }

        let body = response.text().await?;
        Ok(body.trim().to_string())
    }

    /// Region the instance runs in
    pub async fn region(&self) -> Result<String> {
        let token = self.session_token().await?;
        self.get(&token, "placement/region").await
    }

    /// Temporary credentials of the instance profile role
    pub async fn role_credentials(&self) -> Result<AwsCredentials> {
        let token = self.session_token().await?;

        let roles = self.get(&token, "iam/security-credentials/").await?;
        let role = roles
            .lines()
            .next()
            .filter(|r| !r.is_empty())
            .context("No IAM role attached to this instance")?;

        let body = self
            .get(&token, &format!("iam/security-credentials/{}", role))
            .await?;
        let creds: RoleCredentials =
            serde_json::from_str(&body).context("Failed to parse role credentials")?;

        info!("AWS credentials obtained from instance role: {}", role);
        debug!("Instance role credentials expire at {}", creds.expiration);

        Ok(AwsCredentials::new(
            creds.access_key_id,
            creds.secret_access_key,
            Some(creds.token),
            Some(creds.expiration),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::routing::{get, put};
    use axum::Router;

    async fn spawn_metadata_service() -> String {
        async fn token() -> &'static str {
            "imds-token"
        }

        fn authorized(headers: &HeaderMap) -> bool {
            headers
                .get("x-aws-ec2-metadata-token")
                .map(|v| v == "imds-token")
                .unwrap_or(false)
        }

        let app = Router::new()
            .route("/latest/api/token", put(token))
            .route(
                "/latest/meta-data/placement/region",
                get(|headers: HeaderMap| async move {
                    if authorized(&headers) {
                        Ok("eu-west-1\n")
                    } else {
                        Err(axum::http::StatusCode::UNAUTHORIZED)
                    }
                }),
            )
            .route(
                "/latest/meta-data/iam/security-credentials/",
                get(|| async { "cache-relay-role\n" }),
            )
            .route(
                "/latest/meta-data/iam/security-credentials/cache-relay-role",
                get(|| async {
                    r#"{
                        "Code": "Success",
                        "Type": "AWS-HMAC",
                        "AccessKeyId": "ASIAEXAMPLE",
                        "SecretAccessKey": "secret",
                        "Token": "session",
                        "Expiration": "2030-01-01T00:00:00Z"
                    }"#
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_region_and_role_credentials_from_metadata() {
        let endpoint = spawn_metadata_service().await;
        let metadata = InstanceMetadata::with_endpoint(reqwest::Client::new(), endpoint);

        assert_eq!(metadata.region().await.unwrap(), "eu-west-1");

        let creds = metadata.role_credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "ASIAEXAMPLE");
        assert_eq!(creds.session_token.as_deref(), Some("session"));
        assert_eq!(
            creds.expires_at.unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_needs_refresh_inside_margin() {
        let now = Utc::now();
        let static_keys = AwsCredentials::new("a", "b", None, None);
        assert!(!static_keys.needs_refresh(now));

        let fresh = AwsCredentials::new("a", "b", None, Some(now + ChronoDuration::hours(1)));
        assert!(!fresh.needs_refresh(now));

        let expiring = AwsCredentials::new("a", "b", None, Some(now + ChronoDuration::minutes(2)));
        assert!(expiring.needs_refresh(now));
    }

    #[test]
    fn test_debug_hides_secret() {
        let creds = AwsCredentials::new("AKID", "very-secret", Some("tok".to_string()), None);
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("very-secret"));
    }
}
