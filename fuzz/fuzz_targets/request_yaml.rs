#![no_main]

use libfuzzer_sys::fuzz_target;
use pca_issuer::CertificateRequestDescriptor;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(request) = CertificateRequestDescriptor::from_yaml(s) {
            let _ = request.idempotency_token();
            let _ = request.validity_days();
            let _ = request.has_subject();
        }
    }
});
