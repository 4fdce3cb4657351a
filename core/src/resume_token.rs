//! Resume-token primitive gating disk-resume.
//!
//! A token is `base64url(HMAC-SHA256(secret, sessionId))`. Verification is
//! constant-time so the token comparison cannot be used as a timing oracle.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub fn compute_resume_token(session_id: &str, secret: &str) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail.
    #[allow(clippy::expect_used)]
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(session_id.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

pub fn verify_resume_token(session_id: &str, secret: &str, token: &str) -> bool {
    let expected = compute_resume_token(session_id, secret);
    expected.as_bytes().ct_eq(token.as_bytes()).into()
}
