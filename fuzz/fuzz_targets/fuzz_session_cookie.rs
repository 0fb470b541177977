#![no_main]

//! Arbitrary `Cookie` headers must never panic the session check, and never
//! yield a session unless the token was issued by the same key.

use arbitrary::Arbitrary;
use authgate::auth::extract_cookie;
use authgate::session::SessionCodec;
use http::{HeaderMap, HeaderValue, header};
use libfuzzer_sys::fuzz_target;
use std::sync::LazyLock;
use std::time::Duration;

static CODEC: LazyLock<SessionCodec> = LazyLock::new(|| {
    SessionCodec::new(b"fuzz-secret-fuzz-secret-fuzz-secret", Duration::from_secs(3600))
        .expect("valid secret")
});

#[derive(Arbitrary, Debug)]
struct Input {
    cookie_headers: Vec<Vec<u8>>,
    cookie_name: String,
    /// Splice a genuine token into the header to exercise the accepting path.
    splice_valid: bool,
}

fuzz_target!(|input: Input| {
    let mut headers = HeaderMap::new();
    for raw in input.cookie_headers.iter().take(8) {
        if let Ok(value) = HeaderValue::from_bytes(raw) {
            headers.append(header::COOKIE, value);
        }
    }
    if input.splice_valid {
        if let Ok(session) = CODEC.issue("fuzz") {
            if let Ok(value) = HeaderValue::from_str(&format!("user={}", session.token())) {
                headers.append(header::COOKIE, value);
            }
        }
    }

    if let Some(token) = extract_cookie(&headers, &input.cookie_name) {
        if let Some(session) = CODEC.validate(token) {
            // Only the spliced token can validate.
            assert!(input.splice_valid);
            assert_eq!(session.subject(), "fuzz");
        }
    }
});
