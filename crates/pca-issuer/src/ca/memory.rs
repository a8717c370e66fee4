//! In-process private CA for development and testing.
//!
//! [`InMemoryCa`] speaks the same three-call protocol as a remote CA and
//! keeps the properties the issuer relies on:
//!
//! - CSRs are parsed and their signatures verified before signing.
//! - A repeated idempotency token returns the original handle without
//!   signing again.
//! - Issuance can be made to stay pending for a number of fetches.
//! - As a subordinate CA it returns a chain above its own certificate.
//!
//! It also records every call, submission and connection, and can inject
//! one-shot failures per operation.
//!
//! **Warning:** This is intended for development and testing only.
//!
//! # Example
//!
//! ```
//! use pca_issuer::ca::{CaService, InMemoryCa};
//!
//! # tokio_test::block_on(async {
//! let ca = InMemoryCa::subordinate().unwrap();
//! let bundle = ca.get_ca_certificate(ca.arn()).await.unwrap();
//! assert!(bundle.chain.is_some());
//! # });
//! ```

use super::{
    CaCertificates, CaConnector, CaError, CaService, CertificateStatus, ClientSettings,
    IssuanceHandle, IssueCertificateRequest, SigningAlgorithm,
};
use crate::{Error, Result};
use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::debug;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION};
use x509_parser::prelude::FromDer;

/// ARN reported by [`InMemoryCa::new`].
pub const DEFAULT_ARN: &str =
    "arn:aws:acm-pca:us-east-1:000000000000:certificate-authority/in-memory";

/// Upper bound on requested validity; larger values are rejected as invalid.
const MAX_VALIDITY_DAYS: u64 = 36_500;

/// One of the CA service operations, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaOperation {
    IssueCertificate,
    GetCertificate,
    GetCaCertificate,
}

/// Number of calls made to each operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub issue_certificate: usize,
    pub get_certificate: usize,
    pub get_ca_certificate: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.issue_certificate + self.get_certificate + self.get_ca_certificate
    }
}

/// A client connection made through [`InMemoryConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub region: String,
    /// Access key id of the credential the chain resolved to.
    pub access_key_id: String,
    /// Name of the provider that supplied it.
    pub provider: String,
}

struct Authority {
    key: KeyPair,
    params: CertificateParams,
    pem: String,
}

impl Authority {
    fn root() -> Result<Self> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Certificate(format!("root key generation failed: {e}")))?;
        let params = authority_params("In-Memory Root CA", None)?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::Certificate(format!("root cert generation failed: {e}")))?;
        Ok(Self {
            key,
            params,
            pem: cert.pem(),
        })
    }

    fn subordinate_of(parent: &Authority) -> Result<Self> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Certificate(format!("subordinate key generation failed: {e}")))?;
        let params = authority_params("In-Memory Subordinate CA", Some(0))?;
        let issuer = rcgen::Issuer::from_params(&parent.params, &parent.key);
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| Error::Certificate(format!("subordinate cert signing failed: {e}")))?;
        Ok(Self {
            key,
            params,
            pem: cert.pem(),
        })
    }
}

fn authority_params(common_name: &str, path_len: Option<u8>) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| Error::Certificate(format!("failed to create params: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "pca-issuer");
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + TimeDuration::days(3650);

    params.is_ca = match path_len {
        Some(len) => IsCa::Ca(BasicConstraints::Constrained(len)),
        None => IsCa::Ca(BasicConstraints::Unconstrained),
    };
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    Ok(params)
}

struct IssuedEntry {
    certificate: String,
    polls_remaining: u32,
}

#[derive(Default)]
struct CaState {
    tokens: HashMap<String, IssuanceHandle>,
    issued: HashMap<IssuanceHandle, IssuedEntry>,
    submissions: Vec<IssueCertificateRequest>,
    calls: CallCounts,
    connections: Vec<Connection>,
    failures: HashMap<CaOperation, CaError>,
}

/// An in-process private CA.
pub struct InMemoryCa {
    arn: String,
    root: Authority,
    /// Signing authority when running as a subordinate CA.
    intermediate: Option<Authority>,
    pending_polls: u32,
    state: Mutex<CaState>,
}

impl InMemoryCa {
    /// Creates a root CA that signs leaves directly (no chain).
    pub fn new() -> Result<Self> {
        Ok(Self {
            arn: DEFAULT_ARN.to_string(),
            root: Authority::root()?,
            intermediate: None,
            pending_polls: 0,
            state: Mutex::new(CaState::default()),
        })
    }

    /// Creates a subordinate CA: leaves are signed by an intermediate whose
    /// chain is the root certificate.
    pub fn subordinate() -> Result<Self> {
        let mut ca = Self::new()?;
        ca.intermediate = Some(Authority::subordinate_of(&ca.root)?);
        Ok(ca)
    }

    pub fn with_arn(mut self, arn: impl Into<String>) -> Self {
        self.arn = arn.into();
        self
    }

    /// Reports each new certificate as pending for `polls` fetches.
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    /// Returns a connector handing out this CA.
    pub fn connector(self: &Arc<Self>) -> InMemoryConnector {
        InMemoryConnector { ca: Arc::clone(self) }
    }

    /// PEM certificate of the authority that signs leaves.
    pub fn signing_certificate_pem(&self) -> &str {
        &self.signing_authority().pem
    }

    /// PEM certificate of the root.
    pub fn root_certificate_pem(&self) -> &str {
        &self.root.pem
    }

    /// Makes the next call to `operation` fail with `error`.
    pub async fn fail_next(&self, operation: CaOperation, error: CaError) {
        self.state.lock().await.failures.insert(operation, error);
    }

    pub async fn call_counts(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    /// Every accepted or rejected submission, in order.
    pub async fn submissions(&self) -> Vec<IssueCertificateRequest> {
        self.state.lock().await.submissions.clone()
    }

    /// Number of certificates actually signed.
    pub async fn issued_count(&self) -> usize {
        self.state.lock().await.issued.len()
    }

    pub async fn connections(&self) -> Vec<Connection> {
        self.state.lock().await.connections.clone()
    }

    fn signing_authority(&self) -> &Authority {
        self.intermediate.as_ref().unwrap_or(&self.root)
    }

    fn check_arn(&self, arn: &str) -> std::result::Result<(), CaError> {
        if arn != self.arn {
            return Err(CaError::from_code(
                "ResourceNotFoundException",
                format!("certificate authority {arn} not found"),
            ));
        }
        Ok(())
    }

    /// Parses the CSR, verifies its signature and checks that the signing
    /// algorithm fits its public key.
    fn validate_csr(&self, request: &IssueCertificateRequest) -> std::result::Result<(), CaError> {
        let malformed = |msg: String| CaError::from_code("MalformedCSRException", msg);

        let parsed = pem::parse(&request.csr).map_err(|e| malformed(format!("invalid PEM: {e}")))?;
        if parsed.tag() != "CERTIFICATE REQUEST" {
            return Err(malformed(format!("unexpected PEM block {}", parsed.tag())));
        }
        let (_, csr) = X509CertificationRequest::from_der(parsed.contents())
            .map_err(|e| malformed(format!("failed to parse CSR: {e}")))?;
        csr.verify_signature()
            .map_err(|e| malformed(format!("CSR signature verification failed: {e}")))?;

        let key_oid = &csr.certification_request_info.subject_pki.algorithm.algorithm;
        let rsa_key = *key_oid == OID_PKCS1_RSAENCRYPTION;
        let ec_key = *key_oid == OID_KEY_TYPE_EC_PUBLIC_KEY;
        let rsa_alg = matches!(
            request.signing_algorithm,
            SigningAlgorithm::Sha256WithRsa
                | SigningAlgorithm::Sha384WithRsa
                | SigningAlgorithm::Sha512WithRsa
        );
        if (rsa_key && !rsa_alg) || (ec_key && rsa_alg) || (!rsa_key && !ec_key) {
            return Err(CaError::from_code(
                "InvalidArgsException",
                format!(
                    "signing algorithm {} does not match the CSR key",
                    request.signing_algorithm
                ),
            ));
        }
        Ok(())
    }

    fn sign(&self, request: &IssueCertificateRequest) -> std::result::Result<String, CaError> {
        if request.validity_days == 0 || request.validity_days > MAX_VALIDITY_DAYS {
            return Err(CaError::from_code(
                "InvalidArgsException",
                format!("validity of {} days is out of range", request.validity_days),
            ));
        }
        self.validate_csr(request)?;

        let mut csr = CertificateSigningRequestParams::from_pem(&request.csr)
            .map_err(|e| CaError::from_code("MalformedCSRException", e.to_string()))?;

        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now;
        csr.params.not_after = now + TimeDuration::days(request.validity_days as i64);
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let authority = self.signing_authority();
        let issuer = rcgen::Issuer::from_params(&authority.params, &authority.key);
        let cert = csr.signed_by(&issuer).map_err(|e| CaError::Service {
            code: "InternalFailure".to_string(),
            message: format!("certificate signing failed: {e}"),
        })?;
        Ok(cert.pem())
    }
}

#[async_trait]
impl CaService for InMemoryCa {
    async fn issue_certificate(
        &self,
        request: &IssueCertificateRequest,
    ) -> std::result::Result<IssuanceHandle, CaError> {
        let mut state = self.state.lock().await;
        state.calls.issue_certificate += 1;
        state.submissions.push(request.clone());
        if let Some(err) = state.failures.remove(&CaOperation::IssueCertificate) {
            return Err(err);
        }
        self.check_arn(&request.certificate_authority_arn)?;

        if let Some(handle) = state.tokens.get(&request.idempotency_token) {
            debug!(token = %request.idempotency_token, handle = %handle, "idempotent resubmission");
            return Ok(handle.clone());
        }

        let certificate = self.sign(request)?;
        let handle = IssuanceHandle::new(format!(
            "{}/certificate/{:016x}",
            self.arn,
            state.issued.len() + 1
        ));
        state
            .tokens
            .insert(request.idempotency_token.clone(), handle.clone());
        state.issued.insert(
            handle.clone(),
            IssuedEntry {
                certificate,
                polls_remaining: self.pending_polls,
            },
        );
        debug!(handle = %handle, validity_days = request.validity_days, "certificate signed");
        Ok(handle)
    }

    async fn get_certificate(
        &self,
        certificate_authority_arn: &str,
        handle: &IssuanceHandle,
    ) -> std::result::Result<CertificateStatus, CaError> {
        let mut state = self.state.lock().await;
        state.calls.get_certificate += 1;
        if let Some(err) = state.failures.remove(&CaOperation::GetCertificate) {
            return Err(err);
        }
        self.check_arn(certificate_authority_arn)?;

        let entry = state.issued.get_mut(handle).ok_or_else(|| {
            CaError::from_code(
                "ResourceNotFoundException",
                format!("certificate {handle} not found"),
            )
        })?;
        if entry.polls_remaining > 0 {
            entry.polls_remaining -= 1;
            return Ok(CertificateStatus::Pending);
        }
        Ok(CertificateStatus::Issued(entry.certificate.clone()))
    }

    async fn get_ca_certificate(
        &self,
        certificate_authority_arn: &str,
    ) -> std::result::Result<CaCertificates, CaError> {
        let mut state = self.state.lock().await;
        state.calls.get_ca_certificate += 1;
        if let Some(err) = state.failures.remove(&CaOperation::GetCaCertificate) {
            return Err(err);
        }
        self.check_arn(certificate_authority_arn)?;

        Ok(match &self.intermediate {
            Some(intermediate) => CaCertificates {
                certificate: intermediate.pem.clone(),
                chain: Some(self.root.pem.clone()),
            },
            None => CaCertificates {
                certificate: self.root.pem.clone(),
                chain: None,
            },
        })
    }
}

impl std::fmt::Debug for InMemoryCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCa")
            .field("arn", &self.arn)
            .field("subordinate", &self.intermediate.is_some())
            .field("pending_polls", &self.pending_polls)
            .finish()
    }
}

/// Connector that resolves credentials and hands out an [`InMemoryCa`].
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    ca: Arc<InMemoryCa>,
}

#[async_trait]
impl CaConnector for InMemoryConnector {
    async fn connect(&self, settings: ClientSettings) -> Result<Arc<dyn CaService>> {
        let (provider, credentials) = settings.credentials.resolve().await?;
        debug!(region = %settings.region, provider, "connected to in-memory CA");
        self.ca.state.lock().await.connections.push(Connection {
            region: settings.region,
            access_key_id: credentials.access_key_id().to_string(),
            provider: provider.to_string(),
        });
        let service: Arc<dyn CaService> = self.ca.clone();
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::SigningRequest;
    use crate::key::PrivateKey;
    use crate::request::{CertificateRequestDescriptor, KeyAlgorithm};
    use x509_parser::prelude::{parse_x509_certificate, GeneralName, ParsedExtension};

    fn submission(csr: &str, token: &str) -> IssueCertificateRequest {
        IssueCertificateRequest {
            certificate_authority_arn: DEFAULT_ARN.to_string(),
            csr: csr.to_string(),
            signing_algorithm: SigningAlgorithm::Sha256WithEcdsa,
            validity_days: 2,
            idempotency_token: token.to_string(),
        }
    }

    fn ecdsa_csr() -> String {
        let key = PrivateKey::generate(KeyAlgorithm::Ecdsa, 256).unwrap();
        let request = CertificateRequestDescriptor::new("default", "web", "uid-1", "web-tls")
            .with_common_name("web.example.com")
            .with_dns_name("web.example.com");
        SigningRequest::build(&request, &key).unwrap().pem().to_string()
    }

    async fn issued_pem(ca: &InMemoryCa, handle: &IssuanceHandle) -> String {
        match ca.get_certificate(DEFAULT_ARN, handle).await.unwrap() {
            CertificateStatus::Issued(pem) => pem,
            CertificateStatus::Pending => panic!("certificate still pending"),
        }
    }

    #[tokio::test]
    async fn test_issue_and_fetch() {
        let ca = InMemoryCa::new().unwrap();
        let handle = ca
            .issue_certificate(&submission(&ecdsa_csr(), "token-1"))
            .await
            .unwrap();
        assert!(handle.as_str().starts_with(DEFAULT_ARN));

        let pem = issued_pem(&ca, &handle).await;
        let der = pem::parse(&pem).unwrap().into_contents();
        let (_, cert) = parse_x509_certificate(&der).unwrap();

        let validity = cert.validity();
        let days = (validity.not_after.timestamp() - validity.not_before.timestamp()) / 86_400;
        assert_eq!(days, 2);

        let mut dns = Vec::new();
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    if let GeneralName::DNSName(d) = name {
                        dns.push(d.to_string());
                    }
                }
            }
        }
        assert_eq!(dns, vec!["web.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_same_token_returns_same_handle_without_resigning() {
        let ca = InMemoryCa::new().unwrap();
        let csr = ecdsa_csr();

        let first = ca.issue_certificate(&submission(&csr, "uid-1")).await.unwrap();
        let second = ca.issue_certificate(&submission(&csr, "uid-1")).await.unwrap();
        let third = ca.issue_certificate(&submission(&csr, "uid-2")).await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first, third);
        assert_eq!(ca.issued_count().await, 2);
        assert_eq!(ca.call_counts().await.issue_certificate, 3);
    }

    #[tokio::test]
    async fn test_pending_polls() {
        let ca = InMemoryCa::new().unwrap().with_pending_polls(2);
        let handle = ca
            .issue_certificate(&submission(&ecdsa_csr(), "t"))
            .await
            .unwrap();

        for _ in 0..2 {
            assert_eq!(
                ca.get_certificate(DEFAULT_ARN, &handle).await.unwrap(),
                CertificateStatus::Pending
            );
        }
        assert!(issued_pem(&ca, &handle).await.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn test_rejects_malformed_csr() {
        let ca = InMemoryCa::new().unwrap();
        let bogus = concat!(
            "-----BEGIN CERTIFICATE REQUEST-----\n",
            "Ym9ndXMgZGF0YQ==\n",
            "-----END CERTIFICATE REQUEST-----\n",
        );

        let err = ca.issue_certificate(&submission(bogus, "t")).await.unwrap_err();
        assert!(matches!(err, CaError::InvalidRequest(_)));
        assert_eq!(ca.issued_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejects_algorithm_key_mismatch() {
        let ca = InMemoryCa::new().unwrap();
        let mut request = submission(&ecdsa_csr(), "t");
        request.signing_algorithm = SigningAlgorithm::Sha256WithRsa;

        let err = ca.issue_certificate(&request).await.unwrap_err();
        assert!(matches!(err, CaError::InvalidRequest(ref m) if m.contains("InvalidArgs")));
    }

    #[tokio::test]
    async fn test_unknown_arn_is_service_error() {
        let ca = InMemoryCa::new().unwrap();
        let err = ca.get_ca_certificate("arn:other").await.unwrap_err();
        assert!(matches!(
            err,
            CaError::Service { ref code, .. } if code == "ResourceNotFoundException"
        ));
    }

    #[tokio::test]
    async fn test_with_arn_serves_only_that_arn() {
        let arn = "arn:aws:acm-pca:eu-west-1:210987654321:certificate-authority/test";
        let ca = InMemoryCa::new().unwrap().with_arn(arn);
        assert_eq!(ca.arn(), arn);

        assert!(ca.get_ca_certificate(arn).await.is_ok());
        assert!(ca.get_ca_certificate(DEFAULT_ARN).await.is_err());
    }

    #[tokio::test]
    async fn test_root_ca_has_no_chain() {
        let ca = InMemoryCa::new().unwrap();
        let certs = ca.get_ca_certificate(DEFAULT_ARN).await.unwrap();
        assert_eq!(certs.certificate, ca.root_certificate_pem());
        assert!(certs.chain.is_none());
    }

    #[tokio::test]
    async fn test_subordinate_ca_returns_chain() {
        let ca = InMemoryCa::subordinate().unwrap();
        let certs = ca.get_ca_certificate(DEFAULT_ARN).await.unwrap();
        assert_eq!(certs.certificate, ca.signing_certificate_pem());
        assert_eq!(certs.chain.as_deref(), Some(ca.root_certificate_pem()));
        assert_ne!(ca.signing_certificate_pem(), ca.root_certificate_pem());
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let ca = InMemoryCa::new().unwrap();
        ca.fail_next(
            CaOperation::GetCaCertificate,
            CaError::Transport("connection reset".into()),
        )
        .await;

        assert!(ca.get_ca_certificate(DEFAULT_ARN).await.is_err());
        assert!(ca.get_ca_certificate(DEFAULT_ARN).await.is_ok());
        assert_eq!(ca.call_counts().await.get_ca_certificate, 2);
    }
}
