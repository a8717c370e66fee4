//! Instance metadata discovery.
//!
//! When no region is configured the issuer asks the host's metadata service
//! for one. The same service also backs the last layer of the default
//! credential chain (instance role credentials).
//!
//! - [`MetadataService`] - the seam the issuer consumes
//! - [`StaticMetadata`] - fixed answers, for tests and non-cloud hosts
//! - `ImdsClient` - HTTP client for the EC2-style IMDSv2 endpoint (feature `imds`)

use crate::credentials::Credentials;
use crate::{Error, Result};
use async_trait::async_trait;

/// A host metadata service.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Returns true if the service answers at all.
    async fn available(&self) -> bool;

    /// Region the host runs in.
    async fn region(&self) -> Result<String>;

    /// Credentials of the role attached to the host, if any.
    async fn role_credentials(&self) -> Result<Option<Credentials>>;
}

/// A metadata service with fixed answers.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    available: bool,
    region: Option<String>,
    credentials: Option<Credentials>,
}

impl StaticMetadata {
    /// An available service reporting `region`.
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            available: true,
            region: Some(region.into()),
            credentials: None,
        }
    }

    /// A service that never answers.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

#[async_trait]
impl MetadataService for StaticMetadata {
    async fn available(&self) -> bool {
        self.available
    }

    async fn region(&self) -> Result<String> {
        if !self.available {
            return Err(Error::MetadataUnavailable);
        }
        self.region
            .clone()
            .ok_or_else(|| Error::Metadata("no region in instance identity document".to_string()))
    }

    async fn role_credentials(&self) -> Result<Option<Credentials>> {
        if !self.available {
            return Err(Error::MetadataUnavailable);
        }
        Ok(self.credentials.clone())
    }
}

#[cfg(feature = "imds")]
pub use imds::{ImdsClient, DEFAULT_IMDS_ENDPOINT};

#[cfg(feature = "imds")]
mod imds {
    use super::MetadataService;
    use crate::credentials::Credentials;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::Deserialize;
    use std::time::Duration;
    use tracing::debug;

    /// Link-local address of the metadata service.
    pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254";

    const TOKEN_PATH: &str = "/latest/api/token";
    const TOKEN_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
    const TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
    const TOKEN_TTL_SECS: u32 = 21_600;
    const INSTANCE_ID_PATH: &str = "/latest/meta-data/instance-id";
    const IDENTITY_DOCUMENT_PATH: &str = "/latest/dynamic/instance-identity/document";
    const ROLE_PATH: &str = "/latest/meta-data/iam/security-credentials/";

    #[derive(Debug, Deserialize)]
    struct IdentityDocument {
        region: String,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct RoleCredentials {
        code: String,
        access_key_id: String,
        secret_access_key: String,
        token: Option<String>,
        expiration: Option<DateTime<Utc>>,
    }

    /// Client for an IMDSv2 metadata endpoint.
    ///
    /// A session token is requested before every lookup. Endpoints that do not
    /// issue tokens are queried without one (IMDSv1).
    pub struct ImdsClient {
        client: reqwest::Client,
        endpoint: String,
    }

    impl ImdsClient {
        /// Creates a client for [`DEFAULT_IMDS_ENDPOINT`] with short timeouts.
        pub fn new() -> Result<Self> {
            let client = reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(1))
                .timeout(Duration::from_secs(5))
                .build()
                .map_err(|e| Error::Metadata(format!("failed to build HTTP client: {e}")))?;
            Ok(Self::with_client(client))
        }

        /// Create a client with a pre-configured `reqwest::Client`.
        pub fn with_client(client: reqwest::Client) -> Self {
            Self {
                client,
                endpoint: DEFAULT_IMDS_ENDPOINT.to_string(),
            }
        }

        pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
            self.endpoint = endpoint.into().trim_end_matches('/').to_string();
            self
        }

        async fn session_token(&self) -> Result<Option<String>> {
            let url = format!("{}{TOKEN_PATH}", self.endpoint);
            let response = self
                .client
                .put(&url)
                .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECS.to_string())
                .send()
                .await
                .map_err(|e| Error::Metadata(format!("token request to {url} failed: {e}")))?;

            if !response.status().is_success() {
                debug!(status = %response.status(), "metadata token unavailable, using IMDSv1");
                return Ok(None);
            }
            let token = response
                .text()
                .await
                .map_err(|e| Error::Metadata(format!("failed to read metadata token: {e}")))?;
            Ok(Some(token))
        }

        /// GETs `path`, returning `None` on 404.
        async fn get(&self, path: &str) -> Result<Option<reqwest::Response>> {
            let token = self.session_token().await?;
            let url = format!("{}{path}", self.endpoint);

            let mut request = self.client.get(&url);
            if let Some(token) = token {
                request = request.header(TOKEN_HEADER, token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| Error::Metadata(format!("request to {url} failed: {e}")))?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(Error::Metadata(format!(
                    "metadata request returned HTTP {}: {url}",
                    response.status()
                )));
            }
            Ok(Some(response))
        }

        async fn get_text(&self, path: &str) -> Result<Option<String>> {
            match self.get(path).await? {
                Some(response) => response
                    .text()
                    .await
                    .map(Some)
                    .map_err(|e| Error::Metadata(format!("failed to read {path}: {e}"))),
                None => Ok(None),
            }
        }
    }

    impl std::fmt::Debug for ImdsClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ImdsClient")
                .field("endpoint", &self.endpoint)
                .finish()
        }
    }

    #[async_trait]
    impl MetadataService for ImdsClient {
        async fn available(&self) -> bool {
            match self.get_text(INSTANCE_ID_PATH).await {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => {
                    debug!(endpoint = %self.endpoint, error = %e, "metadata service unavailable");
                    false
                }
            }
        }

        async fn region(&self) -> Result<String> {
            let response = self.get(IDENTITY_DOCUMENT_PATH).await?.ok_or_else(|| {
                Error::Metadata("instance identity document not found".to_string())
            })?;
            let document: IdentityDocument = response.json().await.map_err(|e| {
                Error::Metadata(format!("failed to parse instance identity document: {e}"))
            })?;
            if document.region.is_empty() {
                return Err(Error::Metadata(
                    "instance identity document has an empty region".to_string(),
                ));
            }
            Ok(document.region)
        }

        async fn role_credentials(&self) -> Result<Option<Credentials>> {
            let roles = match self.get_text(ROLE_PATH).await? {
                Some(roles) => roles,
                None => return Ok(None),
            };
            let role = match roles.lines().map(str::trim).find(|l| !l.is_empty()) {
                Some(role) => role.to_string(),
                None => return Ok(None),
            };

            let response = self
                .get(&format!("{ROLE_PATH}{role}"))
                .await?
                .ok_or_else(|| Error::Metadata(format!("role {role} has no credentials")))?;
            let body: RoleCredentials = response.json().await.map_err(|e| {
                Error::Metadata(format!("failed to parse credentials for role {role}: {e}"))
            })?;
            if body.code != "Success" {
                return Err(Error::Metadata(format!(
                    "credentials for role {role} reported {}",
                    body.code
                )));
            }

            let mut credentials = Credentials::new(body.access_key_id, body.secret_access_key);
            if let Some(token) = body.token {
                credentials = credentials.with_session_token(token);
            }
            if let Some(expiration) = body.expiration {
                credentials = credentials.with_expiration(expiration);
            }
            debug!(role = %role, "fetched instance role credentials");
            Ok(Some(credentials))
        }
    }
}
