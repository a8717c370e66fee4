//! Certificate request descriptors.
//!
//! A [`CertificateRequestDescriptor`] is the immutable input to a single
//! issuance attempt: who the certificate is for, how long it should live,
//! what kind of key backs it, and where an existing key might already be
//! stored.
//!
//! # Example
//!
//! ```
//! use pca_issuer::{CertificateRequestDescriptor, KeyAlgorithm};
//! use std::time::Duration;
//!
//! let request = CertificateRequestDescriptor::new("default", "api", "uid-1", "api-tls")
//!     .with_common_name("api.example.com")
//!     .with_dns_name("api.internal")
//!     .with_key_algorithm(KeyAlgorithm::Ecdsa)
//!     .with_duration(Duration::from_secs(36 * 3600));
//!
//! assert_eq!(request.validity_days().unwrap(), 2);
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Certificate lifetime used when a request does not specify one (90 days).
pub const DEFAULT_CERTIFICATE_DURATION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Longest idempotency token the CA accepts.
pub const MAX_IDEMPOTENCY_TOKEN_LEN: usize = 36;

const NANOS_PER_DAY: u128 = 24 * 60 * 60 * 1_000_000_000;

/// Private key algorithm for a certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    #[default]
    Rsa,
    Ecdsa,
}

impl KeyAlgorithm {
    /// Key size used when the request leaves it unset.
    pub fn default_size(&self) -> u32 {
        match self {
            KeyAlgorithm::Rsa => 2048,
            KeyAlgorithm::Ecdsa => 256,
        }
    }
}

/// Encoding of the private key handed back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEncoding {
    /// `RSA PRIVATE KEY` / `EC PRIVATE KEY`.
    #[default]
    Pkcs1,
    /// `PRIVATE KEY`.
    Pkcs8,
}

/// Everything needed to issue one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestDescriptor {
    /// Namespace of the certificate resource and its key secret.
    pub namespace: String,
    /// Name of the certificate resource.
    pub name: String,
    /// Stable unique identifier of the certificate resource.
    ///
    /// Sent to the CA as the idempotency token.
    pub uid: String,
    /// Secret where the private key is (or will be) stored.
    pub secret_name: String,
    /// Subject common name.
    #[serde(default)]
    pub common_name: Option<String>,
    /// Subject organizations.
    #[serde(default)]
    pub organizations: Vec<String>,
    /// DNS subject alternative names.
    #[serde(default)]
    pub dns_names: Vec<String>,
    /// IP subject alternative names.
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
    /// URI subject alternative names.
    #[serde(default)]
    pub uris: Vec<String>,
    /// Requested certificate lifetime. Defaults to 90 days.
    #[serde(default, with = "duration_secs")]
    pub duration: Option<Duration>,
    /// Private key algorithm.
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,
    /// Private key size in bits (RSA) or curve size (ECDSA).
    #[serde(default)]
    pub key_size: Option<u32>,
    /// Encoding of the returned private key.
    #[serde(default)]
    pub key_encoding: KeyEncoding,
}

impl CertificateRequestDescriptor {
    /// Creates a descriptor with no subject fields and default key settings.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
        secret_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
            secret_name: secret_name.into(),
            common_name: None,
            organizations: Vec::new(),
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
            uris: Vec::new(),
            duration: None,
            key_algorithm: KeyAlgorithm::default(),
            key_size: None,
            key_encoding: KeyEncoding::default(),
        }
    }

    pub fn with_common_name(mut self, cn: impl Into<String>) -> Self {
        self.common_name = Some(cn.into());
        self
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organizations.push(org.into());
        self
    }

    pub fn with_dns_name(mut self, dns: impl Into<String>) -> Self {
        self.dns_names.push(dns.into());
        self
    }

    pub fn with_ip_address(mut self, ip: IpAddr) -> Self {
        self.ip_addresses.push(ip);
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uris.push(uri.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }

    pub fn with_key_size(mut self, size: u32) -> Self {
        self.key_size = Some(size);
        self
    }

    pub fn with_key_encoding(mut self, encoding: KeyEncoding) -> Self {
        self.key_encoding = encoding;
        self
    }

    /// Parses a descriptor from YAML (or JSON).
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidRequest(format!("failed to parse request: {e}")))
    }

    /// Requested lifetime, falling back to [`DEFAULT_CERTIFICATE_DURATION`].
    pub fn effective_duration(&self) -> Duration {
        self.duration.unwrap_or(DEFAULT_CERTIFICATE_DURATION)
    }

    /// Validity to request from the CA, in whole days, rounded up.
    pub fn validity_days(&self) -> Result<u64> {
        let duration = self.effective_duration();
        if duration.is_zero() {
            return Err(Error::InvalidRequest(
                "certificate duration must be positive".to_string(),
            ));
        }
        // At most u64::MAX / 86400 days, so the narrowing is lossless.
        Ok(duration.as_nanos().div_ceil(NANOS_PER_DAY) as u64)
    }

    /// Key size, falling back to the algorithm default.
    pub fn effective_key_size(&self) -> u32 {
        self.key_size
            .unwrap_or_else(|| self.key_algorithm.default_size())
    }

    /// Idempotency token for CA submission.
    pub fn idempotency_token(&self) -> Result<&str> {
        if self.uid.is_empty() {
            return Err(Error::InvalidRequest(
                "certificate uid is required as idempotency token".to_string(),
            ));
        }
        if self.uid.len() > MAX_IDEMPOTENCY_TOKEN_LEN {
            return Err(Error::InvalidRequest(format!(
                "certificate uid exceeds {MAX_IDEMPOTENCY_TOKEN_LEN} characters: {}",
                self.uid
            )));
        }
        Ok(&self.uid)
    }

    /// Returns true if the descriptor names at least one subject.
    pub fn has_subject(&self) -> bool {
        self.common_name.as_deref().is_some_and(|cn| !cn.is_empty())
            || !self.dns_names.is_empty()
            || !self.ip_addresses.is_empty()
            || !self.uris.is_empty()
    }

    /// `namespace/name`, for logs and events.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Serializes `Option<Duration>` as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    fn request() -> CertificateRequestDescriptor {
        CertificateRequestDescriptor::new("default", "web", "uid-1", "web-tls")
    }

    #[test]
    fn test_validity_rounds_up_to_whole_days() {
        assert_eq!(request().with_duration(hours(36)).validity_days().unwrap(), 2);
        assert_eq!(request().with_duration(hours(48)).validity_days().unwrap(), 2);
        assert_eq!(request().with_duration(hours(49)).validity_days().unwrap(), 3);
        assert_eq!(
            request()
                .with_duration(Duration::from_secs(1))
                .validity_days()
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_sub_second_remainder_rounds_up() {
        let day = hours(24);
        assert_eq!(
            request()
                .with_duration(day + Duration::from_millis(500))
                .validity_days()
                .unwrap(),
            2
        );
        assert_eq!(
            request()
                .with_duration(Duration::from_millis(500))
                .validity_days()
                .unwrap(),
            1
        );
        assert_eq!(
            request()
                .with_duration(Duration::from_nanos(1))
                .validity_days()
                .unwrap(),
            1
        );
        assert_eq!(request().with_duration(day).validity_days().unwrap(), 1);
    }

    #[test]
    fn test_default_duration_is_ninety_days() {
        assert_eq!(request().validity_days().unwrap(), 90);
    }

    #[test]
    fn test_zero_duration_is_invalid() {
        let err = request()
            .with_duration(Duration::ZERO)
            .validity_days()
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_idempotency_token_is_uid() {
        let req = request();
        assert_eq!(req.idempotency_token().unwrap(), "uid-1");

        let mut req = request();
        req.uid = String::new();
        assert!(req.idempotency_token().is_err());

        req.uid = "x".repeat(MAX_IDEMPOTENCY_TOKEN_LEN + 1);
        assert!(req.idempotency_token().is_err());
    }

    #[test]
    fn test_key_size_defaults() {
        assert_eq!(request().effective_key_size(), 2048);
        assert_eq!(
            request()
                .with_key_algorithm(KeyAlgorithm::Ecdsa)
                .effective_key_size(),
            256
        );
        assert_eq!(request().with_key_size(4096).effective_key_size(), 4096);
    }

    #[test]
    fn test_has_subject() {
        assert!(!request().has_subject());
        assert!(!request().with_common_name("").has_subject());
        assert!(request().with_dns_name("a.example.com").has_subject());
        assert!(request()
            .with_ip_address("10.0.0.1".parse().unwrap())
            .has_subject());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
namespace: prod
name: api
uid: 1f0e6c1e-7a8b-4f7e-9a55-0c3c1f2b9d11
secretName: api-tls
commonName: api.example.com
dnsNames: [api.example.com, api.internal]
duration: 172800
keyAlgorithm: ecdsa
keySize: 384
keyEncoding: pkcs8
"#;
        let req = CertificateRequestDescriptor::from_yaml(yaml).unwrap();
        assert_eq!(req.secret_name, "api-tls");
        assert_eq!(req.dns_names.len(), 2);
        assert_eq!(req.validity_days().unwrap(), 2);
        assert_eq!(req.key_algorithm, KeyAlgorithm::Ecdsa);
        assert_eq!(req.effective_key_size(), 384);
        assert_eq!(req.key_encoding, KeyEncoding::Pkcs8);
    }

    #[test]
    fn test_parse_yaml_defaults() {
        let yaml = "namespace: a\nname: b\nuid: c\nsecretName: d\n";
        let req = CertificateRequestDescriptor::from_yaml(yaml).unwrap();
        assert_eq!(req.duration, None);
        assert_eq!(req.key_algorithm, KeyAlgorithm::Rsa);
        assert_eq!(req.key_encoding, KeyEncoding::Pkcs1);
    }

    proptest! {
        #[test]
        fn validity_days_is_ceiling_of_hours(h in 1u64..100_000) {
            let days = request().with_duration(hours(h)).validity_days().unwrap();
            prop_assert_eq!(days, h.div_ceil(24));
            prop_assert!(days * 24 >= h);
            prop_assert!((days - 1) * 24 < h);
        }

        #[test]
        fn validity_days_counts_sub_second_remainder(
            secs in 0u64..10_000_000,
            nanos in 1u32..1_000_000_000,
        ) {
            let duration = Duration::new(secs, nanos);
            let days = request().with_duration(duration).validity_days().unwrap();
            // Any positive remainder past a whole number of days adds a day.
            prop_assert_eq!(days, secs / 86_400 + 1);
        }
    }
}
