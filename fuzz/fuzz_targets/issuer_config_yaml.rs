#![no_main]

use libfuzzer_sys::fuzz_target;
use pca_issuer::IssuerConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = IssuerConfig::from_yaml(s) {
            assert!(config.certificate_authority_arn.starts_with("arn:"));
        }
    }
});
