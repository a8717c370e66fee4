//! The issuance state machine.
//!
//! ```text
//! Idle ──submit──▶ Submitted ──fetch──▶ Ready ──fetch CA──▶ ChainFetched ──▶ Complete
//!                      │
//!                      └──pending──▶ InProgress
//! ```
//!
//! Each [`IssuanceDriver::step`] performs at most one CA call and returns the
//! next state. [`IssuanceDriver::run`] steps until `Complete`, or stops at
//! `InProgress` and reports [`Error::InProgress`]: the driver never polls in a
//! loop. The caller retries the whole operation later with the same
//! idempotency token and the CA hands back the same handle.
//!
//! Failure classification:
//!
//! | Stage             | CA says input invalid | Anything else |
//! |-------------------|-----------------------|---------------|
//! | submit            | fatal (`Rejected`)    | transient     |
//! | fetch certificate | transient             | transient     |
//! | fetch CA bundle   | transient             | transient     |

use crate::ca::{
    CaCertificates, CaError, CaService, CertificateStatus, IssuanceHandle, IssueCertificateRequest,
};
use crate::{Error, Result, Stage};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A certificate fetched from the CA together with the CA bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub handle: IssuanceHandle,
    /// PEM leaf certificate.
    pub certificate: String,
    pub ca: CaCertificates,
}

impl IssuedCertificate {
    /// CA certificate followed by its chain.
    pub fn ca_bundle(&self) -> String {
        self.ca.bundle()
    }
}

/// Where an issuance attempt stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuanceState {
    /// Nothing submitted yet.
    Idle,
    /// The CA accepted the request.
    Submitted { handle: IssuanceHandle },
    /// The CA is still issuing.
    InProgress { handle: IssuanceHandle },
    /// The leaf certificate has been fetched.
    Ready {
        handle: IssuanceHandle,
        certificate: String,
    },
    /// The CA certificate and chain have been fetched.
    ChainFetched {
        handle: IssuanceHandle,
        certificate: String,
        ca: CaCertificates,
    },
    Complete(IssuedCertificate),
}

impl IssuanceState {
    pub fn name(&self) -> &'static str {
        match self {
            IssuanceState::Idle => "idle",
            IssuanceState::Submitted { .. } => "submitted",
            IssuanceState::InProgress { .. } => "in-progress",
            IssuanceState::Ready { .. } => "ready",
            IssuanceState::ChainFetched { .. } => "chain-fetched",
            IssuanceState::Complete(_) => "complete",
        }
    }

    /// The CA handle, once there is one.
    pub fn handle(&self) -> Option<&IssuanceHandle> {
        match self {
            IssuanceState::Idle => None,
            IssuanceState::Submitted { handle }
            | IssuanceState::InProgress { handle }
            | IssuanceState::Ready { handle, .. }
            | IssuanceState::ChainFetched { handle, .. } => Some(handle),
            IssuanceState::Complete(issued) => Some(&issued.handle),
        }
    }
}

/// Drives one submission through the CA protocol.
pub struct IssuanceDriver {
    service: Arc<dyn CaService>,
    submission: IssueCertificateRequest,
    cancel: CancellationToken,
}

impl IssuanceDriver {
    pub fn new(
        service: Arc<dyn CaService>,
        submission: IssueCertificateRequest,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service,
            submission,
            cancel,
        }
    }

    /// Runs from `Idle`, calling `observe` with every state entered.
    ///
    /// # Errors
    ///
    /// [`Error::InProgress`] if the CA has not finished; otherwise the first
    /// failing step's error.
    pub async fn run<F>(&self, mut observe: F) -> Result<IssuedCertificate>
    where
        F: FnMut(&IssuanceState),
    {
        let mut state = IssuanceState::Idle;
        loop {
            state = self.step(state).await?;
            observe(&state);
            match state {
                IssuanceState::Complete(issued) => return Ok(issued),
                IssuanceState::InProgress { handle } => return Err(Error::InProgress { handle }),
                _ => {}
            }
        }
    }

    /// Performs the transition out of `state`.
    ///
    /// Stepping `InProgress` fetches the certificate again. Stepping
    /// `Complete` is a no-op.
    pub async fn step(&self, state: IssuanceState) -> Result<IssuanceState> {
        match state {
            IssuanceState::Idle => self.submit().await,
            IssuanceState::Submitted { handle } | IssuanceState::InProgress { handle } => {
                self.fetch_certificate(handle).await
            }
            IssuanceState::Ready {
                handle,
                certificate,
            } => {
                let ca = self.fetch_ca_bundle().await?;
                Ok(IssuanceState::ChainFetched {
                    handle,
                    certificate,
                    ca,
                })
            }
            IssuanceState::ChainFetched {
                handle,
                certificate,
                ca,
            } => Ok(IssuanceState::Complete(IssuedCertificate {
                handle,
                certificate,
                ca,
            })),
            complete @ IssuanceState::Complete(_) => Ok(complete),
        }
    }

    async fn submit(&self) -> Result<IssuanceState> {
        let submission = &self.submission;
        debug!(
            ca = %submission.certificate_authority_arn,
            token = %submission.idempotency_token,
            validity_days = submission.validity_days,
            signing_algorithm = %submission.signing_algorithm,
            "submitting certificate request"
        );

        let handle = self
            .call(Stage::Submit, self.service.issue_certificate(submission))
            .await?
            .map_err(|e| match e {
                CaError::InvalidRequest(message) => Error::Rejected {
                    stage: Stage::Submit,
                    message,
                },
                source => Error::Ca {
                    stage: Stage::Submit,
                    source,
                },
            })?;

        info!(handle = %handle, token = %submission.idempotency_token, "certificate requested");
        Ok(IssuanceState::Submitted { handle })
    }

    async fn fetch_certificate(&self, handle: IssuanceHandle) -> Result<IssuanceState> {
        let status = match self
            .call(
                Stage::FetchCertificate,
                self.service
                    .get_certificate(&self.submission.certificate_authority_arn, &handle),
            )
            .await?
        {
            Ok(status) => status,
            Err(source) if source.is_in_progress() => CertificateStatus::Pending,
            Err(source) => {
                return Err(Error::Ca {
                    stage: Stage::FetchCertificate,
                    source,
                })
            }
        };

        match status {
            CertificateStatus::Pending => {
                debug!(handle = %handle, "certificate request still in progress");
                Ok(IssuanceState::InProgress { handle })
            }
            CertificateStatus::Issued(certificate) => {
                check_certificate_pem(&certificate)?;
                Ok(IssuanceState::Ready {
                    handle,
                    certificate,
                })
            }
        }
    }

    async fn fetch_ca_bundle(&self) -> Result<CaCertificates> {
        let ca = self
            .call(
                Stage::FetchCaBundle,
                self.service
                    .get_ca_certificate(&self.submission.certificate_authority_arn),
            )
            .await?
            .map_err(|source| Error::Ca {
                stage: Stage::FetchCaBundle,
                source,
            })?;
        check_certificate_pem(&ca.certificate)?;
        Ok(ca)
    }

    /// Awaits a CA call unless the attempt is cancelled first.
    async fn call<T>(
        &self,
        stage: Stage,
        call: impl Future<Output = std::result::Result<T, CaError>>,
    ) -> Result<std::result::Result<T, CaError>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(%stage, "issuance cancelled");
                Err(Error::Cancelled(stage))
            }
            result = call => Ok(result),
        }
    }
}

impl std::fmt::Debug for IssuanceDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuanceDriver")
            .field("submission", &self.submission)
            .finish()
    }
}

fn check_certificate_pem(pem_str: &str) -> Result<()> {
    let parsed = pem::parse(pem_str)
        .map_err(|e| Error::Certificate(format!("CA returned an unparseable certificate: {e}")))?;
    if parsed.tag() != "CERTIFICATE" {
        return Err(Error::Certificate(format!(
            "CA returned a {} block instead of a certificate",
            parsed.tag()
        )));
    }
    Ok(())
}
