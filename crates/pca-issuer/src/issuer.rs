//! The `issue` operation.
//!
//! [`PrivateCaIssuer::issue`] sequences one issuance attempt:
//!
//! 1. Materialize the private key. A freshly generated key is returned alone
//!    as [`IssueOutcome::KeyGenerated`], without contacting the CA. The caller
//!    stores it and calls `issue` again.
//! 2. With a reused key, build the CSR, connect to the CA and drive the
//!    issuance state machine.
//! 3. Return the key, leaf certificate and CA bundle as
//!    [`IssueOutcome::Issued`].
//!
//! Fatal input errors come back as `Ok(IssueOutcome::Rejected(_))` so they
//! are never mistaken for something to retry. `Err` is always transient.

use crate::ca::{CaConnector, IssueCertificateRequest, SigningAlgorithm};
use crate::config::IssuerConfig;
use crate::credentials::{CredentialChain, CredentialResolver};
use crate::csr::SigningRequest;
use crate::driver::{IssuanceDriver, IssuanceState};
use crate::events::{reason, Event, EventRecorder, ObjectRef, TracingRecorder};
use crate::key::{KeyMaterial, KeyMaterializer, PrivateKey};
use crate::metadata::MetadataService;
use crate::request::CertificateRequestDescriptor;
use crate::store::SecretStore;
use crate::{Error, Result, Stage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// PEM material handed back to the caller.
#[derive(Clone, PartialEq, Eq)]
pub struct IssueResponse {
    /// Encoded per the request's key encoding.
    pub private_key: String,
    /// Leaf certificate; absent when only a key was generated.
    pub certificate: Option<String>,
    /// CA certificate followed by its chain; absent when only a key was
    /// generated.
    pub ca: Option<String>,
}

impl std::fmt::Debug for IssueResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueResponse")
            .field("private_key", &"[REDACTED]")
            .field("certificate", &self.certificate.as_ref().map(String::len))
            .field("ca", &self.ca.as_ref().map(String::len))
            .finish()
    }
}

/// Result of one `issue` call.
#[derive(Debug)]
pub enum IssueOutcome {
    /// A new key was generated and nothing else happened. Persist the key and
    /// call again.
    KeyGenerated(IssueResponse),
    /// Key, certificate and CA bundle.
    Issued(IssueResponse),
    /// The input is invalid; retrying it unchanged cannot succeed.
    Rejected(Error),
}

impl IssueOutcome {
    pub fn response(&self) -> Option<&IssueResponse> {
        match self {
            IssueOutcome::KeyGenerated(response) | IssueOutcome::Issued(response) => {
                Some(response)
            }
            IssueOutcome::Rejected(_) => None,
        }
    }

    pub fn is_issued(&self) -> bool {
        matches!(self, IssueOutcome::Issued(_))
    }
}

/// Issues certificates through a remote private CA.
pub struct PrivateCaIssuer {
    config: IssuerConfig,
    materializer: KeyMaterializer,
    resolver: CredentialResolver,
    connector: Arc<dyn CaConnector>,
    recorder: Arc<dyn EventRecorder>,
}

impl PrivateCaIssuer {
    pub fn builder(
        config: IssuerConfig,
        store: Arc<dyn SecretStore>,
        connector: Arc<dyn CaConnector>,
    ) -> PrivateCaIssuerBuilder {
        PrivateCaIssuerBuilder {
            config,
            store,
            connector,
            recorder: None,
            metadata: None,
            default_providers: None,
        }
    }

    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    /// Runs one issuance attempt for `request`.
    ///
    /// # Errors
    ///
    /// Only transient failures: secret store faults, metadata or credential
    /// lookups, CA errors, [`Error::InProgress`] and [`Error::Cancelled`].
    /// Retry later with the same request (same uid).
    pub async fn issue(
        &self,
        request: &CertificateRequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<IssueOutcome> {
        let object = ObjectRef::from(request);

        let (token, validity_days) = match request
            .idempotency_token()
            .and_then(|token| Ok((token.to_string(), request.validity_days()?)))
        {
            Ok(checked) => checked,
            Err(e) => {
                self.warn(
                    &object,
                    reason::ERROR_SIGNING,
                    format!("Invalid certificate request: {e}"),
                );
                return Ok(IssueOutcome::Rejected(e));
            }
        };

        let material = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(Stage::LoadKey)),
            result = self.materializer.materialize(request) => result,
        };
        let key = match material {
            Ok(KeyMaterial::Reused(key)) => key,
            Ok(KeyMaterial::Generated(key)) => {
                return Ok(self.key_generated(request, &object, &key));
            }
            Err(e @ Error::Cancelled(_)) => {
                debug!(certificate = %object, "issuance cancelled");
                return Err(e);
            }
            Err(e) if e.is_retryable() => {
                error!(
                    certificate = %object,
                    secret = %request.secret_name,
                    error = %e,
                    "failed to read private key"
                );
                return Err(e);
            }
            Err(e) => {
                self.warn(
                    &object,
                    reason::PRIVATE_KEY_ERROR,
                    format!("Error generating certificate private key: {e}"),
                );
                return Ok(IssueOutcome::Rejected(e));
            }
        };

        let csr = match SigningRequest::build(request, &key) {
            Ok(csr) => csr,
            Err(e) => {
                self.warn(&object, reason::ERROR_SIGNING, format!("Failed to build CSR: {e}"));
                return Ok(IssueOutcome::Rejected(e));
            }
        };

        let service = match self.resolver.connect(self.connector.as_ref(), cancel).await {
            Ok(service) => service,
            Err(e) => {
                self.warn(
                    &object,
                    reason::ERROR_SIGNING,
                    format!("Failed to request certificate: {e}"),
                );
                return classify(e);
            }
        };

        let submission = IssueCertificateRequest {
            certificate_authority_arn: self.config.certificate_authority_arn.clone(),
            csr: csr.pem().to_string(),
            signing_algorithm: self.signing_algorithm(&key),
            validity_days,
            idempotency_token: token,
        };
        let driver = IssuanceDriver::new(service, submission, cancel.clone());

        let issued = driver
            .run(|state| match state {
                IssuanceState::Submitted { handle } => self.normal(
                    &object,
                    reason::REQUESTED,
                    format!("Certificate Requested, ARN: {handle}"),
                ),
                IssuanceState::InProgress { .. } => self.normal(
                    &object,
                    reason::IN_PROGRESS,
                    "Certificate Request is still in progress",
                ),
                _ => {}
            })
            .await;

        let issued = match issued {
            Ok(issued) => issued,
            Err(e) => {
                self.report_driver_error(&object, &e);
                return classify(e);
            }
        };

        let private_key = match key.encode(request.key_encoding) {
            Ok(pem) => pem,
            Err(e) => {
                self.warn(
                    &object,
                    reason::ERROR_PRIVATE_KEY,
                    format!("Error encoding private key: {e}"),
                );
                return Ok(IssueOutcome::Rejected(e));
            }
        };

        self.normal(
            &object,
            reason::ISSUED,
            format!("Certificate issued, ARN: {}", issued.handle),
        );
        Ok(IssueOutcome::Issued(IssueResponse {
            private_key,
            ca: Some(issued.ca_bundle()),
            certificate: Some(issued.certificate),
        }))
    }

    fn key_generated(
        &self,
        request: &CertificateRequestDescriptor,
        object: &ObjectRef,
        key: &PrivateKey,
    ) -> IssueOutcome {
        let private_key = match key.encode(request.key_encoding) {
            Ok(pem) => pem,
            Err(e) => {
                self.warn(
                    object,
                    reason::ERROR_PRIVATE_KEY,
                    format!("Error encoding private key: {e}"),
                );
                return IssueOutcome::Rejected(e);
            }
        };
        debug!(certificate = %object, "returning new private key for storage");
        self.normal(object, reason::GENERATED, "Generated new private key");
        IssueOutcome::KeyGenerated(IssueResponse {
            private_key,
            certificate: None,
            ca: None,
        })
    }

    fn signing_algorithm(&self, key: &PrivateKey) -> SigningAlgorithm {
        self.config
            .signing_algorithm
            .unwrap_or_else(|| SigningAlgorithm::for_key(key.algorithm(), key.size()))
    }

    fn report_driver_error(&self, object: &ObjectRef, e: &Error) {
        match e {
            // The state machine already reported it.
            Error::InProgress { .. } => {}
            Error::Rejected { stage, .. } | Error::Ca { stage, .. } if *stage == Stage::Submit => {
                self.warn(
                    object,
                    reason::ERROR_SIGNING,
                    format!("Failed to request certificate: {e}"),
                )
            }
            Error::Ca { stage, .. } if *stage == Stage::FetchCertificate => self.warn(
                object,
                reason::ERROR_SIGNING,
                format!("Failed to get certificate: {e}"),
            ),
            Error::Certificate(_) => self.warn(
                object,
                reason::ERROR_SIGNING,
                format!("Failed to get certificate: {e}"),
            ),
            _ => error!(certificate = %object, error = %e, "certificate issuance failed"),
        }
    }

    fn normal(&self, object: &ObjectRef, reason: &str, message: impl Into<String>) {
        self.recorder
            .record(Event::normal(object.clone(), reason, message));
    }

    fn warn(&self, object: &ObjectRef, reason: &str, message: impl Into<String>) {
        self.recorder
            .record(Event::warning(object.clone(), reason, message));
    }
}

impl std::fmt::Debug for PrivateCaIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateCaIssuer")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .finish()
    }
}

fn classify(e: Error) -> Result<IssueOutcome> {
    if e.is_retryable() {
        Err(e)
    } else {
        Ok(IssueOutcome::Rejected(e))
    }
}

/// Builder for [`PrivateCaIssuer`].
pub struct PrivateCaIssuerBuilder {
    config: IssuerConfig,
    store: Arc<dyn SecretStore>,
    connector: Arc<dyn CaConnector>,
    recorder: Option<Arc<dyn EventRecorder>>,
    metadata: Option<Arc<dyn MetadataService>>,
    default_providers: Option<CredentialChain>,
}

impl PrivateCaIssuerBuilder {
    /// Event sink. Defaults to [`TracingRecorder`].
    pub fn recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Metadata service for region discovery and instance role credentials.
    pub fn metadata(mut self, metadata: Arc<dyn MetadataService>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Replaces the default credential chain that follows the static
    /// credentials. Defaults to [`CredentialChain::default_chain`].
    pub fn default_providers(mut self, chain: CredentialChain) -> Self {
        self.default_providers = Some(chain);
        self
    }

    pub fn build(self) -> PrivateCaIssuer {
        let mut resolver =
            CredentialResolver::new(self.config.clone(), self.store.clone(), self.metadata);
        if let Some(chain) = self.default_providers {
            resolver = resolver.with_default_chain(chain);
        }
        info!(
            ca = %self.config.certificate_authority_arn,
            region = ?self.config.region(),
            "private CA issuer configured"
        );
        PrivateCaIssuer {
            config: self.config,
            materializer: KeyMaterializer::new(self.store),
            resolver,
            connector: self.connector,
            recorder: self.recorder.unwrap_or_else(|| Arc::new(TracingRecorder)),
        }
    }
}
