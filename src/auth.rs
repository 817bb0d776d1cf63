//! Webhook signature verification and API token handling.
//!
//! GitHub signs each delivery body with HMAC-SHA256 under the shared
//! secret and sends the hex digest in `x-hub-signature-256`. We verify
//! against the raw body bytes, with a constant-time comparison, before
//! any payload parsing beyond the repository probe.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify an `x-hub-signature-256` header against the raw delivery body.
/// Any malformed header (missing prefix, bad hex) fails verification.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        debug!("signature header missing sha256= prefix");
        return false;
    };
    let expected = match hex::decode(hex_digest) {
        Ok(b) => b,
        Err(e) => {
            debug!("failed to decode signature hex: {}", e);
            return false;
        }
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Sign a body the way GitHub does. Used by local delivery tooling and
/// the webhook tests.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// 256-bit hex API token for registered users.
pub fn generate_api_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Webhook secret issued to newly registered repositories.
pub fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_hmac_vector() {
        // RFC 4231 test case 2.
        let sig = sign_payload("Jefe", b"what do ya want for nothing?");
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let body = br#"{"action":"opened"}"#;
        let sig = sign_payload("s3cret", body);
        assert!(verify_webhook_signature("s3cret", body, &sig));
    }

    #[test]
    fn test_rejects_tampering_and_wrong_secret() {
        let body = br#"{"action":"opened"}"#;
        let sig = sign_payload("s3cret", body);
        assert!(!verify_webhook_signature(
            "s3cret",
            br#"{"action":"closed"}"#,
            &sig
        ));
        assert!(!verify_webhook_signature("other", body, &sig));
    }

    #[test]
    fn test_rejects_malformed_headers() {
        let body = b"x";
        assert!(!verify_webhook_signature("s", body, ""));
        assert!(!verify_webhook_signature("s", body, "sha1=abcd"));
        assert!(!verify_webhook_signature("s", body, "sha256=zzzz"));
        let unprefixed = sign_payload("s", body).replace(SIGNATURE_PREFIX, "");
        assert!(!verify_webhook_signature("s", body, &unprefixed));
    }

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(bearer_token("Bearer   abc123  "), Some("abc123"));
        assert_eq!(bearer_token("bearer abc123"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Token abc"), None);
    }

    #[test]
    fn test_generated_tokens_are_unique_hex() {
        let a = generate_api_token();
        let b = generate_api_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(generate_webhook_secret().len(), 48);
    }
}
