//! Certificate issuance through a remote private certificate authority.
//!
//! This crate issues X.509 leaf certificates by delegating signing to an
//! external CA service (an ACM-PCA style API). It owns the decisions that
//! carry real failure-mode subtlety:
//!
//! - whether to reuse an existing private key or generate a new one,
//! - building the signing request for that key,
//! - which identity to present to the CA (a layered credential chain),
//! - driving the CA's asynchronous submit → fetch → fetch-bundle lifecycle
//!   with an idempotency token so retries never mint duplicates.
//!
//! # Components
//!
//! - [`request`] - Certificate request descriptor and key parameters
//! - [`config`] - Issuer configuration
//! - [`store`] - Secret store seam and an in-memory implementation
//! - [`key`] - Private key reuse, generation and encoding
//! - [`csr`] - CSR construction
//! - [`credentials`] - Credential provider chain and region resolution
//! - [`metadata`] - Instance metadata service seam and HTTP client
//! - [`ca`] - CA service traits and an in-memory CA
//! - [`driver`] - The issuance state machine
//! - [`events`] - Caller-visible notifications
//! - [`issuer`] - The `issue` orchestration entry point
//!
//! # Example
//!
//! ```
//! use pca_issuer::ca::InMemoryCa;
//! use pca_issuer::credentials::{CredentialChain, Credentials, StaticProvider};
//! use pca_issuer::events::MemoryRecorder;
//! use pca_issuer::store::MemorySecretStore;
//! use pca_issuer::{CertificateRequestDescriptor, IssueOutcome, IssuerConfig, PrivateCaIssuer};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let ca = Arc::new(InMemoryCa::new().unwrap());
//! let store = Arc::new(MemorySecretStore::new());
//! let config = IssuerConfig::new(ca.arn()).with_region("us-east-1");
//! let issuer = PrivateCaIssuer::builder(config, store.clone(), Arc::new(ca.connector()))
//!     .recorder(Arc::new(MemoryRecorder::new()))
//!     .default_providers(
//!         CredentialChain::new().with(StaticProvider::new(Credentials::new("AKID", "secret"))),
//!     )
//!     .build();
//!
//! let request = CertificateRequestDescriptor::new("default", "web", "7c1f6a0e-uid", "web-tls")
//!     .with_common_name("web.example.com");
//! let cancel = CancellationToken::new();
//!
//! // First pass only generates a key; the caller persists it.
//! let outcome = issuer.issue(&request, &cancel).await.unwrap();
//! let IssueOutcome::KeyGenerated(response) = outcome else { panic!() };
//! store.insert_tls_key("default", "web-tls", response.private_key.clone()).await;
//!
//! // Second pass signs a CSR for the stored key.
//! let outcome = issuer.issue(&request, &cancel).await.unwrap();
//! assert!(matches!(outcome, IssueOutcome::Issued(_)));
//! # });
//! ```

pub mod ca;
pub mod config;
pub mod credentials;
pub mod csr;
pub mod driver;
pub mod events;
pub mod issuer;
pub mod key;
pub mod metadata;
pub mod request;
pub mod store;

pub use ca::{CaConnector, CaError, CaService, InMemoryCa, IssuanceHandle};
pub use config::{IssuerConfig, SecretKeySelector};
pub use credentials::{CredentialChain, CredentialProvider, CredentialResolver, Credentials};
pub use csr::SigningRequest;
pub use driver::{IssuanceDriver, IssuanceState, IssuedCertificate};
pub use events::{Event, EventRecorder, EventType};
pub use issuer::{IssueOutcome, IssueResponse, PrivateCaIssuer};
pub use key::{KeyMaterial, PrivateKey};
pub use metadata::MetadataService;
pub use request::{CertificateRequestDescriptor, KeyAlgorithm, KeyEncoding};
pub use store::{Secret, SecretStore};

use std::fmt;

/// The step of an issuance attempt a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reading the stored private key.
    LoadKey,
    /// Building the CA client (credentials, region).
    Connect,
    /// Submitting the signing request.
    Submit,
    /// Fetching the issued certificate.
    FetchCertificate,
    /// Fetching the CA certificate and chain.
    FetchCaBundle,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::LoadKey => "load key",
            Stage::Connect => "connect",
            Stage::Submit => "submit",
            Stage::FetchCertificate => "fetch certificate",
            Stage::FetchCaBundle => "fetch CA bundle",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while issuing a certificate.
///
/// Every variant is either fatal (retrying unchanged input cannot succeed) or
/// transient (the caller should retry later, reusing the same request uid).
/// See [`Error::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The certificate request descriptor is unusable.
    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),

    /// Private key generation failed (unsupported algorithm or size).
    #[error("private key generation failed: {0}")]
    KeyGeneration(String),

    /// Private key could not be encoded.
    #[error("private key encoding failed: {0}")]
    KeyEncoding(String),

    /// CSR generation error.
    #[error("CSR generation failed: {0}")]
    CsrGeneration(String),

    /// A referenced secret does not exist.
    #[error("secret '{namespace}/{name}' not found")]
    SecretNotFound { namespace: String, name: String },

    /// A referenced secret exists but lacks the requested field.
    #[error("no data for {key:?} in secret '{namespace}/{name}'")]
    MissingSecretField {
        namespace: String,
        name: String,
        key: String,
    },

    /// The secret store failed for a reason other than absence.
    #[error("secret store error: {0}")]
    SecretStore(String),

    /// No region configured and no metadata service to ask.
    #[error("no region configured and no instance metadata service to discover one")]
    RegionRequired,

    /// The instance metadata service did not respond.
    #[error("instance metadata service is unavailable")]
    MetadataUnavailable,

    /// A metadata service request failed.
    #[error("instance metadata request failed: {0}")]
    Metadata(String),

    /// Every provider in the credential chain came up empty.
    #[error("no credentials available from any provider in the chain")]
    NoCredentials,

    /// A credential provider failed.
    #[error("credential provider {provider} failed: {message}")]
    CredentialProvider {
        provider: &'static str,
        message: String,
    },

    /// The CA reported the request itself as invalid.
    #[error("CA rejected the request during {stage}: {message}")]
    Rejected { stage: Stage, message: String },

    /// The CA has accepted the request but not finished issuing it.
    #[error("certificate request {handle} is still in progress")]
    InProgress { handle: IssuanceHandle },

    /// A CA call failed.
    #[error("CA call failed during {stage}: {source}")]
    Ca {
        stage: Stage,
        #[source]
        source: CaError,
    },

    /// The CA returned something that is not a usable certificate.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Issuer configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The caller cancelled the operation.
    #[error("cancelled during {0}")]
    Cancelled(Stage),
}

impl Error {
    /// Returns true if retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InvalidRequest(_)
            | Error::KeyGeneration(_)
            | Error::KeyEncoding(_)
            | Error::CsrGeneration(_)
            | Error::SecretNotFound { .. }
            | Error::MissingSecretField { .. }
            | Error::RegionRequired
            | Error::Rejected { .. }
            | Error::Config(_) => false,
            Error::SecretStore(_)
            | Error::MetadataUnavailable
            | Error::Metadata(_)
            | Error::NoCredentials
            | Error::CredentialProvider { .. }
            | Error::InProgress { .. }
            | Error::Ca { .. }
            | Error::Certificate(_)
            | Error::Cancelled(_) => true,
        }
    }

    /// Returns true if the CA is still working on the request.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Error::InProgress { .. })
    }
}

/// Result type for pca-issuer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors_are_not_retryable() {
        let fatal = [
            Error::InvalidRequest("no subject".into()),
            Error::KeyGeneration("rsa 1024".into()),
            Error::CsrGeneration("bad san".into()),
            Error::SecretNotFound {
                namespace: "ns".into(),
                name: "creds".into(),
            },
            Error::RegionRequired,
            Error::Rejected {
                stage: Stage::Submit,
                message: "malformed csr".into(),
            },
        ];
        for err in fatal {
            assert!(!err.is_retryable(), "{err} should be fatal");
        }
    }

    #[test]
    fn test_in_progress_is_distinct_and_retryable() {
        let in_progress = Error::InProgress {
            handle: IssuanceHandle::new("arn:cert/1"),
        };
        let other = Error::Ca {
            stage: Stage::FetchCertificate,
            source: CaError::Service {
                code: "ThrottlingException".into(),
                message: "slow down".into(),
            },
        };

        assert!(in_progress.is_retryable());
        assert!(in_progress.is_in_progress());
        assert!(other.is_retryable());
        assert!(!other.is_in_progress());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::FetchCaBundle.to_string(), "fetch CA bundle");
        let err = Error::Cancelled(Stage::Submit);
        assert_eq!(err.to_string(), "cancelled during submit");
        assert_eq!(Error::Cancelled(Stage::LoadKey).to_string(), "cancelled during load key");
    }
}
