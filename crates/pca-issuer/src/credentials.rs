//! Credential resolution for the CA client.
//!
//! Credentials come from an ordered [`CredentialChain`] of providers. The
//! chain is consulted in priority order every time a client is built, and the
//! first provider that yields a credential wins. All providers stay
//! registered; nothing is decided up front.
//!
//! The issuer's chain is:
//!
//! 1. [`StaticProvider`] built from the issuer's secret references, when both
//!    the access key id and the secret access key resolve to non-empty values
//! 2. the injected default chain, normally [`EnvironmentProvider`] followed by
//!    [`InstanceMetadataProvider`]
//!
//! [`CredentialResolver`] also settles the CA region: the configured one, or
//! one discovered from the instance metadata service.

use crate::ca::{CaConnector, CaService, ClientSettings};
use crate::config::{IssuerConfig, SecretKeySelector};
use crate::metadata::MetadataService;
use crate::store::{read_field, SecretStore};
use crate::{Error, Result, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Environment variable holding the access key id.
pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// Environment variable holding the secret access key.
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Environment variable holding an optional session token.
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

/// An access key pair, optionally with a session token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_expiration(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// True if either half of the key pair is missing.
    pub fn is_empty(&self) -> bool {
        self.access_key_id.is_empty() || self.secret_access_key.is_empty()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One layer of a credential chain.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Short name for logs and errors.
    fn name(&self) -> &'static str;

    /// Attempts to produce a credential. `Ok(None)` means "nothing here, try
    /// the next provider".
    async fn provide(&self) -> Result<Option<Credentials>>;
}

/// Fixed credentials.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    credentials: Credentials,
}

impl StaticProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn provide(&self) -> Result<Option<Credentials>> {
        if self.credentials.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.credentials.clone()))
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Credentials from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` /
/// `AWS_SESSION_TOKEN`.
#[derive(Clone)]
pub struct EnvironmentProvider {
    lookup: EnvLookup,
}

impl EnvironmentProvider {
    /// Reads the process environment.
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Reads variables through `lookup` instead of the process environment.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }
}

impl Default for EnvironmentProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EnvironmentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentProvider").finish()
    }
}

#[async_trait]
impl CredentialProvider for EnvironmentProvider {
    fn name(&self) -> &'static str {
        "environment"
    }

    async fn provide(&self) -> Result<Option<Credentials>> {
        let access_key_id = self.var(ENV_ACCESS_KEY_ID);
        let secret_access_key = self.var(ENV_SECRET_ACCESS_KEY);

        match (access_key_id, secret_access_key) {
            (None, None) => Ok(None),
            (Some(id), Some(secret)) => {
                let mut credentials = Credentials::new(id, secret);
                if let Some(token) = self.var(ENV_SESSION_TOKEN) {
                    credentials = credentials.with_session_token(token);
                }
                Ok(Some(credentials))
            }
            (Some(_), None) => Err(Error::CredentialProvider {
                provider: self.name(),
                message: format!("{ENV_ACCESS_KEY_ID} is set but {ENV_SECRET_ACCESS_KEY} is not"),
            }),
            (None, Some(_)) => Err(Error::CredentialProvider {
                provider: self.name(),
                message: format!("{ENV_SECRET_ACCESS_KEY} is set but {ENV_ACCESS_KEY_ID} is not"),
            }),
        }
    }
}

/// Role credentials from the instance metadata service.
#[derive(Clone)]
pub struct InstanceMetadataProvider {
    metadata: Arc<dyn MetadataService>,
}

impl InstanceMetadataProvider {
    pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
        Self { metadata }
    }
}

impl std::fmt::Debug for InstanceMetadataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceMetadataProvider").finish()
    }
}

#[async_trait]
impl CredentialProvider for InstanceMetadataProvider {
    fn name(&self) -> &'static str {
        "instance-metadata"
    }

    async fn provide(&self) -> Result<Option<Credentials>> {
        if !self.metadata.available().await {
            return Ok(None);
        }
        let credentials = self.metadata.role_credentials().await?;
        Ok(credentials.filter(|c| !c.is_expired()))
    }
}

/// An ordered list of credential providers.
#[derive(Clone, Default)]
pub struct CredentialChain {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl CredentialChain {
    /// An empty chain; it resolves to [`Error::NoCredentials`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment variables, then instance role credentials when a metadata
    /// service is given.
    pub fn default_chain(metadata: Option<Arc<dyn MetadataService>>) -> Self {
        let mut chain = Self::new().with(EnvironmentProvider::new());
        if let Some(metadata) = metadata {
            chain = chain.with(InstanceMetadataProvider::new(metadata));
        }
        chain
    }

    /// Appends a provider (lowest priority so far).
    pub fn with(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Appends every provider of `other`, keeping their order.
    pub fn extend(mut self, other: CredentialChain) -> Self {
        self.providers.extend(other.providers);
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider names in priority order.
    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Returns the first credential any provider yields, with that provider's
    /// name.
    ///
    /// A failing provider does not stop the walk. If no provider yields a
    /// credential, the first provider error is returned, or
    /// [`Error::NoCredentials`] if every provider was simply empty.
    pub async fn resolve(&self) -> Result<(&'static str, Credentials)> {
        let mut first_error = None;

        for provider in &self.providers {
            match provider.provide().await {
                Ok(Some(credentials)) => {
                    debug!(provider = provider.name(), "resolved credentials");
                    return Ok((provider.name(), credentials));
                }
                Ok(None) => {
                    debug!(provider = provider.name(), "no credentials from provider");
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "credential provider failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(first_error.unwrap_or(Error::NoCredentials))
    }
}

impl std::fmt::Debug for CredentialChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialChain")
            .field("providers", &self.names())
            .finish()
    }
}

/// Builds the CA client settings for an issuer.
pub struct CredentialResolver {
    config: IssuerConfig,
    store: Arc<dyn SecretStore>,
    default_chain: CredentialChain,
    metadata: Option<Arc<dyn MetadataService>>,
}

impl CredentialResolver {
    /// Creates a resolver whose default chain is
    /// [`CredentialChain::default_chain`] over `metadata`.
    pub fn new(
        config: IssuerConfig,
        store: Arc<dyn SecretStore>,
        metadata: Option<Arc<dyn MetadataService>>,
    ) -> Self {
        Self {
            default_chain: CredentialChain::default_chain(metadata.clone()),
            config,
            store,
            metadata,
        }
    }

    /// Replaces the default provider chain.
    pub fn with_default_chain(mut self, chain: CredentialChain) -> Self {
        self.default_chain = chain;
        self
    }

    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    /// Builds the ordered credential chain.
    ///
    /// # Errors
    ///
    /// A reference to a missing secret or field is fatal. Store faults are
    /// transient.
    pub async fn credential_chain(&self) -> Result<CredentialChain> {
        let access_key_id = self.read_ref(self.config.access_key_id_ref.as_ref()).await?;
        let secret_access_key = self
            .read_ref(self.config.secret_access_key_ref.as_ref())
            .await?;

        let mut chain = CredentialChain::new();
        match (access_key_id, secret_access_key) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                debug!(access_key_id = %id, "using static credentials from secret references");
                chain = chain.with(StaticProvider::new(Credentials::new(id, secret)));
            }
            (None, None) => {}
            _ => {
                warn!(
                    namespace = %self.config.resource_namespace,
                    "only one of accessKeyIdRef / secretAccessKeyRef resolved to a value; \
                     falling back to the default credential chain"
                );
            }
        }
        Ok(chain.extend(self.default_chain.clone()))
    }

    async fn read_ref(&self, selector: Option<&SecretKeySelector>) -> Result<Option<String>> {
        let selector = match selector {
            Some(selector) if selector.is_set() => selector,
            _ => return Ok(None),
        };
        let value = read_field(
            self.store.as_ref(),
            &self.config.resource_namespace,
            &selector.name,
            selector.key(),
        )
        .await?;
        Ok(Some(value))
    }

    /// The CA region: configured, or discovered from instance metadata.
    ///
    /// # Errors
    ///
    /// - [`Error::RegionRequired`] (fatal) if no region is configured and no
    ///   metadata service is available to this resolver.
    /// - [`Error::MetadataUnavailable`] (transient) if the metadata service
    ///   does not answer.
    /// - [`Error::Metadata`] (transient) if the region lookup fails.
    pub async fn region(&self) -> Result<String> {
        if let Some(region) = self.config.region() {
            return Ok(region.to_string());
        }

        let metadata = self.metadata.as_ref().ok_or(Error::RegionRequired)?;
        if !metadata.available().await {
            return Err(Error::MetadataUnavailable);
        }
        let region = metadata.region().await?;
        if region.is_empty() {
            return Err(Error::Metadata("metadata service returned an empty region".to_string()));
        }
        info!(region = %region, "discovered region from instance metadata");
        Ok(region)
    }

    /// Resolves region and credential chain.
    pub async fn client_settings(&self) -> Result<ClientSettings> {
        let credentials = self.credential_chain().await?;
        let region = self.region().await?;
        Ok(ClientSettings {
            region,
            credentials,
        })
    }

    /// Resolves the settings and connects through `connector`.
    pub async fn connect(
        &self,
        connector: &dyn CaConnector,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn CaService>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(Stage::Connect)),
            result = async {
                let settings = self.client_settings().await?;
                debug!(
                    region = %settings.region,
                    providers = ?settings.credentials.names(),
                    "connecting to certificate authority"
                );
                connector.connect(settings).await
            } => result,
        }
    }
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("certificate_authority_arn", &self.config.certificate_authority_arn)
            .field("default_chain", &self.default_chain)
            .field("metadata", &self.metadata.is_some())
            .finish()
    }
}
