//! Issuer configuration.
//!
//! The issuer document names the CA to sign with, the region it lives in, and
//! optional references to stored access keys.
//!
//! # Example (YAML)
//! ```yaml
//! certificateAuthorityArn: arn:aws:acm-pca:us-east-1:111122223333:certificate-authority/abc
//! region: us-east-1
//! resourceNamespace: cert-system
//! accessKeyIdRef:
//!   name: pca-credentials
//!   key: access-key-id
//! secretAccessKeyRef:
//!   name: pca-credentials
//!   key: secret-access-key
//! ```

use crate::ca::SigningAlgorithm;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Field read from a referenced secret when the reference names none.
pub const DEFAULT_SECRET_KEY: &str = "token";

/// Namespace used for credential references when none is configured.
pub const DEFAULT_RESOURCE_NAMESPACE: &str = "default";

/// Points at one field of a stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeySelector {
    /// Secret name. An empty name means "not set".
    #[serde(default)]
    pub name: String,
    /// Field within the secret. Defaults to [`DEFAULT_SECRET_KEY`].
    #[serde(default)]
    pub key: Option<String>,
}

impl SecretKeySelector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// The field to read, applying the default.
    pub fn key(&self) -> &str {
        match self.key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => DEFAULT_SECRET_KEY,
        }
    }

    /// Returns true if the selector names a secret.
    pub fn is_set(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Configuration for a private CA issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerConfig {
    /// ARN of the certificate authority that signs requests.
    pub certificate_authority_arn: String,
    /// CA region. When unset it is discovered from instance metadata.
    #[serde(default)]
    pub region: Option<String>,
    /// Namespace that credential references are resolved in.
    #[serde(default = "default_resource_namespace")]
    pub resource_namespace: String,
    /// Reference to the access key id.
    #[serde(default)]
    pub access_key_id_ref: Option<SecretKeySelector>,
    /// Reference to the secret access key.
    #[serde(default)]
    pub secret_access_key_ref: Option<SecretKeySelector>,
    /// Signing algorithm override. Derived from the key algorithm when unset.
    #[serde(default)]
    pub signing_algorithm: Option<SigningAlgorithm>,
}

fn default_resource_namespace() -> String {
    DEFAULT_RESOURCE_NAMESPACE.to_string()
}

impl IssuerConfig {
    /// Creates a configuration for the given CA with every optional field unset.
    pub fn new(certificate_authority_arn: impl Into<String>) -> Self {
        Self {
            certificate_authority_arn: certificate_authority_arn.into(),
            region: None,
            resource_namespace: default_resource_namespace(),
            access_key_id_ref: None,
            secret_access_key_ref: None,
            signing_algorithm: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_resource_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.resource_namespace = namespace.into();
        self
    }

    pub fn with_access_key_id_ref(mut self, selector: SecretKeySelector) -> Self {
        self.access_key_id_ref = Some(selector);
        self
    }

    pub fn with_secret_access_key_ref(mut self, selector: SecretKeySelector) -> Self {
        self.secret_access_key_ref = Some(selector);
        self
    }

    pub fn with_signing_algorithm(mut self, algorithm: SigningAlgorithm) -> Self {
        self.signing_algorithm = Some(algorithm);
        self
    }

    /// Parses and validates a configuration document (YAML or JSON).
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("failed to parse issuer config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.certificate_authority_arn.trim().is_empty() {
            return Err(Error::Config(
                "certificateAuthorityArn is required".to_string(),
            ));
        }
        if !self.certificate_authority_arn.starts_with("arn:") {
            return Err(Error::Config(format!(
                "certificateAuthorityArn is not an ARN: {}",
                self.certificate_authority_arn
            )));
        }
        if self.resource_namespace.is_empty() {
            return Err(Error::Config("resourceNamespace is empty".to_string()));
        }
        Ok(())
    }

    /// Configured region, treating an empty string as unset.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref().filter(|r| !r.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARN: &str = "arn:aws:acm-pca:us-east-1:111122223333:certificate-authority/abc";

    #[test]
    fn test_parse_full_config() {
        let yaml = format!(
            r#"
certificateAuthorityArn: {ARN}
region: eu-west-1
resourceNamespace: cert-system
accessKeyIdRef:
  name: pca-credentials
  key: access-key-id
secretAccessKeyRef:
  name: pca-credentials
signingAlgorithm: SHA384WITHECDSA
"#
        );
        let config = IssuerConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.region(), Some("eu-west-1"));
        assert_eq!(config.resource_namespace, "cert-system");

        let access = config.access_key_id_ref.as_ref().unwrap();
        assert_eq!(access.key(), "access-key-id");
        let secret = config.secret_access_key_ref.as_ref().unwrap();
        assert_eq!(secret.key(), DEFAULT_SECRET_KEY);
        assert_eq!(
            config.signing_algorithm,
            Some(SigningAlgorithm::Sha384WithEcdsa)
        );
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = IssuerConfig::from_yaml(&format!("certificateAuthorityArn: {ARN}")).unwrap();
        assert_eq!(config.region(), None);
        assert_eq!(config.resource_namespace, DEFAULT_RESOURCE_NAMESPACE);
        assert!(config.access_key_id_ref.is_none());
    }

    #[test]
    fn test_empty_region_is_unset() {
        let config = IssuerConfig::new(ARN).with_region("");
        assert_eq!(config.region(), None);
    }

    #[test]
    fn test_rejects_missing_or_malformed_arn() {
        assert!(IssuerConfig::from_yaml("region: us-east-1").is_err());

        let err = IssuerConfig::new("not-an-arn").validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_selector_defaults() {
        let selector = SecretKeySelector::new("creds");
        assert!(selector.is_set());
        assert_eq!(selector.key(), "token");
        assert_eq!(selector.clone().with_key("").key(), "token");
        assert!(!SecretKeySelector::new("").is_set());
    }
}
