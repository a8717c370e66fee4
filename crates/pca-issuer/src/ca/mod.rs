//! Certificate Authority (CA) service traits and implementations.
//!
//! The issuer talks to a remote private CA through [`CaService`], an
//! asynchronous three-call protocol:
//!
//! 1. `issue_certificate` submits a CSR and returns an [`IssuanceHandle`].
//!    The idempotency token makes resubmission safe: the CA answers a repeated
//!    token with the original handle.
//! 2. `get_certificate` fetches the issued certificate by handle, or reports
//!    [`CertificateStatus::Pending`] while the CA is still working.
//! 3. `get_ca_certificate` fetches the CA's own certificate and chain.
//!
//! A [`CaConnector`] builds a service for a region and credential chain.
//!
//! Implementations include:
//!
//! - [`InMemoryCa`] - In-process CA for development and testing

mod memory;

pub use memory::{CaOperation, CallCounts, Connection, InMemoryCa, InMemoryConnector, DEFAULT_ARN};

use crate::credentials::CredentialChain;
use crate::request::KeyAlgorithm;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// CA error codes that mean the submitted input itself is invalid.
pub const INVALID_REQUEST_CODES: &[&str] = &[
    "MalformedCSRException",
    "InvalidArgsException",
    "InvalidParameterException",
    "InvalidRequestException",
];

/// CA error code for "issuance has not finished yet".
///
/// The driver reads it as [`CertificateStatus::Pending`].
pub const REQUEST_IN_PROGRESS_CODE: &str = "RequestInProgressException";

/// Opaque CA-side identifier for one issuance attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssuanceHandle(String);

impl IssuanceHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssuanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signature algorithm the CA uses to sign the certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    #[serde(rename = "SHA256WITHRSA")]
    Sha256WithRsa,
    #[serde(rename = "SHA384WITHRSA")]
    Sha384WithRsa,
    #[serde(rename = "SHA512WITHRSA")]
    Sha512WithRsa,
    #[serde(rename = "SHA256WITHECDSA")]
    Sha256WithEcdsa,
    #[serde(rename = "SHA384WITHECDSA")]
    Sha384WithEcdsa,
    #[serde(rename = "SHA512WITHECDSA")]
    Sha512WithEcdsa,
}

impl SigningAlgorithm {
    /// Wire name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::Sha256WithRsa => "SHA256WITHRSA",
            SigningAlgorithm::Sha384WithRsa => "SHA384WITHRSA",
            SigningAlgorithm::Sha512WithRsa => "SHA512WITHRSA",
            SigningAlgorithm::Sha256WithEcdsa => "SHA256WITHECDSA",
            SigningAlgorithm::Sha384WithEcdsa => "SHA384WITHECDSA",
            SigningAlgorithm::Sha512WithEcdsa => "SHA512WITHECDSA",
        }
    }

    /// Default algorithm for a key of the given type and size.
    pub fn for_key(algorithm: KeyAlgorithm, size: u32) -> Self {
        match (algorithm, size) {
            (KeyAlgorithm::Rsa, _) => SigningAlgorithm::Sha256WithRsa,
            (KeyAlgorithm::Ecdsa, 384) => SigningAlgorithm::Sha384WithEcdsa,
            (KeyAlgorithm::Ecdsa, _) => SigningAlgorithm::Sha256WithEcdsa,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a certificate submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueCertificateRequest {
    /// CA that should sign the request.
    pub certificate_authority_arn: String,
    /// PEM-encoded CSR.
    pub csr: String,
    pub signing_algorithm: SigningAlgorithm,
    /// Certificate validity in whole days.
    pub validity_days: u64,
    /// De-duplication token; resubmitting it yields the original handle.
    pub idempotency_token: String,
}

/// Result of fetching a submitted certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    /// The CA has not finished issuing.
    Pending,
    /// PEM-encoded leaf certificate.
    Issued(String),
}

/// The CA's own certificate and, for subordinate CAs, its issuing chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaCertificates {
    /// PEM-encoded CA certificate.
    pub certificate: String,
    /// PEM-encoded chain above the CA, if any.
    pub chain: Option<String>,
}

impl CaCertificates {
    /// CA certificate followed by the chain, separated by a newline.
    pub fn bundle(&self) -> String {
        match self.chain.as_deref() {
            Some(chain) if !chain.is_empty() => format!("{}\n{}", self.certificate, chain),
            _ => self.certificate.clone(),
        }
    }
}

/// Errors reported by a CA service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaError {
    /// The CA rejected the input; resubmitting it unchanged cannot succeed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Any other CA-reported error.
    #[error("{code}: {message}")]
    Service { code: String, message: String },

    /// The request never got a CA answer.
    #[error("transport error: {0}")]
    Transport(String),
}

impl CaError {
    /// Classifies a CA error code.
    ///
    /// Only the codes in [`INVALID_REQUEST_CODES`] are treated as input
    /// errors; everything else stays a (retryable) service error.
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if INVALID_REQUEST_CODES.contains(&code.as_str()) {
            CaError::InvalidRequest(format!("{code}: {message}"))
        } else {
            CaError::Service { code, message }
        }
    }

    /// True for a service error saying the certificate is not ready yet.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, CaError::Service { code, .. } if code == REQUEST_IN_PROGRESS_CODE)
    }
}

/// A remote private CA.
#[async_trait]
pub trait CaService: Send + Sync {
    /// Submits a CSR for signing.
    async fn issue_certificate(
        &self,
        request: &IssueCertificateRequest,
    ) -> std::result::Result<IssuanceHandle, CaError>;

    /// Fetches the certificate for a submission.
    async fn get_certificate(
        &self,
        certificate_authority_arn: &str,
        handle: &IssuanceHandle,
    ) -> std::result::Result<CertificateStatus, CaError>;

    /// Fetches the CA certificate and chain.
    async fn get_ca_certificate(
        &self,
        certificate_authority_arn: &str,
    ) -> std::result::Result<CaCertificates, CaError>;
}

/// Everything needed to build an authenticated CA client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub region: String,
    pub credentials: CredentialChain,
}

/// Builds CA clients.
#[async_trait]
pub trait CaConnector: Send + Sync {
    /// Connects to the CA in `settings.region`, authenticating with the first
    /// provider in `settings.credentials` that yields a credential.
    async fn connect(&self, settings: ClientSettings) -> Result<Arc<dyn CaService>>;
}
