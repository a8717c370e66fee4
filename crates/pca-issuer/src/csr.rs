//! Certificate Signing Request (CSR) generation.
//!
//! Builds a PKCS#10 request from a [`CertificateRequestDescriptor`]'s subject
//! and a materialized [`PrivateKey`], PEM-wrapped as `CERTIFICATE REQUEST`.
//!
//! # Example
//!
//! ```
//! use pca_issuer::{CertificateRequestDescriptor, KeyAlgorithm, PrivateKey, SigningRequest};
//!
//! let request = CertificateRequestDescriptor::new("default", "web", "uid-1", "web-tls")
//!     .with_common_name("web.example.com")
//!     .with_dns_name("web.example.com");
//! let key = PrivateKey::generate(KeyAlgorithm::Ecdsa, 256).unwrap();
//!
//! let csr = SigningRequest::build(&request, &key).unwrap();
//! assert!(csr.pem().starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
//! ```

use crate::key::PrivateKey;
use crate::request::CertificateRequestDescriptor;
use crate::{Error, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};

/// A PEM-encoded certificate signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    pem: String,
}

impl SigningRequest {
    /// Builds a CSR for `request`, signed by `key`.
    ///
    /// The common name defaults to the first DNS name. Only the first
    /// organization is carried into the subject.
    ///
    /// # Errors
    ///
    /// Any failure is fatal: the descriptor has no subject, a SAN is not
    /// representable, or serialization failed.
    pub fn build(request: &CertificateRequestDescriptor, key: &PrivateKey) -> Result<Self> {
        if !request.has_subject() {
            return Err(Error::InvalidRequest(format!(
                "certificate {} has no common name, DNS names, IP addresses or URIs",
                request.key()
            )));
        }

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| Error::CsrGeneration(format!("failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        let common_name = request
            .common_name
            .as_deref()
            .filter(|cn| !cn.is_empty())
            .or_else(|| request.dns_names.first().map(String::as_str));
        if let Some(cn) = common_name {
            dn.push(DnType::CommonName, cn);
        }
        if let Some(org) = request.organizations.first() {
            dn.push(DnType::OrganizationName, org.as_str());
        }
        params.distinguished_name = dn;

        let mut sans = Vec::new();
        for dns in &request.dns_names {
            let name = rcgen::string::Ia5String::try_from(dns.as_str())
                .map_err(|e| Error::CsrGeneration(format!("invalid DNS name {dns:?}: {e}")))?;
            sans.push(SanType::DnsName(name));
        }
        for ip in &request.ip_addresses {
            sans.push(SanType::IpAddress(*ip));
        }
        for uri in &request.uris {
            let value = rcgen::string::Ia5String::try_from(uri.as_str())
                .map_err(|e| Error::CsrGeneration(format!("invalid URI {uri:?}: {e}")))?;
            sans.push(SanType::URI(value));
        }
        params.subject_alt_names = sans;

        let key_pair = key.key_pair()?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::CsrGeneration(format!("CSR serialization failed: {e}")))?;

        let pem = csr
            .pem()
            .map_err(|e| Error::CsrGeneration(format!("CSR PEM encoding failed: {e}")))?;

        Ok(Self { pem })
    }

    /// Returns the PEM-encoded CSR.
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Returns the DER-encoded CSR bytes.
    pub fn der(&self) -> Result<Vec<u8>> {
        let parsed = pem::parse(&self.pem)
            .map_err(|e| Error::CsrGeneration(format!("failed to parse PEM: {e}")))?;
        Ok(parsed.into_contents())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::KeyAlgorithm;
    use x509_parser::certification_request::X509CertificationRequest;
    use x509_parser::extensions::{GeneralName, ParsedExtension};
    use x509_parser::prelude::FromDer;

    fn request() -> CertificateRequestDescriptor {
        CertificateRequestDescriptor::new("default", "web", "uid-1", "web-tls")
    }

    fn san_names(der: &[u8]) -> Vec<String> {
        let (_, csr) = X509CertificationRequest::from_der(der).unwrap();
        let mut names = Vec::new();
        if let Some(extensions) = csr.requested_extensions() {
            for ext in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = ext {
                    for name in &san.general_names {
                        match name {
                            GeneralName::DNSName(d) => names.push(d.to_string()),
                            GeneralName::URI(u) => names.push(u.to_string()),
                            GeneralName::IPAddress(ip) => names.push(format!("{ip:?}")),
                            _ => {}
                        }
                    }
                }
            }
        }
        names
    }

    #[test]
    fn test_build_csr_with_subject_and_sans() {
        let key = PrivateKey::generate(KeyAlgorithm::Ecdsa, 256).unwrap();
        let req = request()
            .with_common_name("web.example.com")
            .with_organization("Example Corp")
            .with_dns_name("web.example.com")
            .with_dns_name("web.internal")
            .with_ip_address("10.1.2.3".parse().unwrap())
            .with_uri("spiffe://example.org/ns/default/sa/web");

        let csr = SigningRequest::build(&req, &key).unwrap();
        assert!(csr.pem().contains("BEGIN CERTIFICATE REQUEST"));
        assert!(csr.pem().contains("END CERTIFICATE REQUEST"));

        let der = csr.der().unwrap();
        let (_, parsed) = X509CertificationRequest::from_der(&der).unwrap();
        parsed.verify_signature().unwrap();

        let subject = parsed.certification_request_info.subject.to_string();
        assert!(subject.contains("CN=web.example.com"));
        assert!(subject.contains("O=Example Corp"));

        let names = san_names(&der);
        assert!(names.contains(&"web.example.com".to_string()));
        assert!(names.contains(&"web.internal".to_string()));
        assert!(names.contains(&"spiffe://example.org/ns/default/sa/web".to_string()));
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn test_common_name_defaults_to_first_dns_name() {
        let key = PrivateKey::generate(KeyAlgorithm::Ecdsa, 256).unwrap();
        let req = request().with_dns_name("first.example.com").with_dns_name("second.example.com");

        let der = SigningRequest::build(&req, &key).unwrap().der().unwrap();
        let (_, parsed) = X509CertificationRequest::from_der(&der).unwrap();
        assert!(parsed
            .certification_request_info
            .subject
            .to_string()
            .contains("CN=first.example.com"));
    }

    #[test]
    fn test_csr_carries_rsa_key() {
        let key = PrivateKey::generate(KeyAlgorithm::Rsa, 2048).unwrap();
        let csr = SigningRequest::build(&request().with_common_name("rsa.example.com"), &key)
            .unwrap();

        let der = csr.der().unwrap();
        let (_, parsed) = X509CertificationRequest::from_der(&der).unwrap();
        parsed.verify_signature().unwrap();
    }

    #[test]
    fn test_rejects_request_without_subject() {
        let key = PrivateKey::generate(KeyAlgorithm::Ecdsa, 256).unwrap();
        let err = SigningRequest::build(&request(), &key).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rejects_non_ascii_dns_name() {
        let key = PrivateKey::generate(KeyAlgorithm::Ecdsa, 256).unwrap();
        let err = SigningRequest::build(&request().with_dns_name("bücher.example"), &key)
            .unwrap_err();
        assert!(matches!(err, Error::CsrGeneration(_)));
        assert!(!err.is_retryable());
    }
}
