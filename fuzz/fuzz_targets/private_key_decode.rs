#![no_main]

use libfuzzer_sys::fuzz_target;
use pca_issuer::{KeyEncoding, PrivateKey};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(key) = PrivateKey::from_pem(s) {
            // A key that decodes must re-encode in both forms.
            let _ = key.encode(KeyEncoding::Pkcs1).unwrap();
            let _ = key.encode(KeyEncoding::Pkcs8).unwrap();
        }
    }
});
