//! Secret storage.
//!
//! Secrets are addressed by `(namespace, name)` and hold a map of named
//! binary fields. The issuer only reads from the store: it looks up existing
//! private keys and credential references. Writing a freshly generated key is
//! the caller's job.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Field holding a PEM private key.
pub const TLS_PRIVATE_KEY: &str = "tls.key";

/// Field holding the PEM certificate.
pub const TLS_CERTIFICATE: &str = "tls.crt";

/// A stored secret: named binary fields.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret {
    data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Returns a field's raw bytes.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// Field names, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Read access to stored secrets.
///
/// Implementations return `Ok(None)` for a missing secret and reserve `Err`
/// for faults (unreachable backend, permission errors, ...), which the issuer
/// treats as transient.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetches the secret `namespace/name`.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// Reads one field of a secret as a trimmed UTF-8 string.
///
/// A missing secret or field is an [`Error::SecretNotFound`] /
/// [`Error::MissingSecretField`]; both are fatal because a malformed reference
/// cannot be fixed by retrying.
pub async fn read_field(
    store: &dyn SecretStore,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String> {
    let secret = store
        .get(namespace, name)
        .await?
        .ok_or_else(|| Error::SecretNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

    let bytes = secret.get(key).ok_or_else(|| Error::MissingSecretField {
        namespace: namespace.to_string(),
        name: name.to_string(),
        key: key.to_string(),
    })?;

    Ok(String::from_utf8_lossy(bytes).trim().to_string())
}

/// In-memory secret store for development and tests.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<(String, String), Secret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores (or replaces) a secret.
    pub async fn insert(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        secret: Secret,
    ) {
        let mut secrets = self.secrets.write().await;
        secrets.insert((namespace.into(), name.into()), secret);
    }

    /// Replaces a secret with one holding only a private key.
    pub async fn insert_tls_key(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        private_key_pem: impl Into<Vec<u8>>,
    ) {
        let secret = Secret::new().with_field(TLS_PRIVATE_KEY, private_key_pem);
        self.insert(namespace, name, secret).await;
    }

    /// Removes a secret, returning it if present.
    pub async fn remove(&self, namespace: &str, name: &str) -> Option<Secret> {
        let mut secrets = self.secrets.write().await;
        secrets.remove(&(namespace.to_string(), name.to_string()))
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let secrets = self.secrets.read().await;
        Ok(secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
