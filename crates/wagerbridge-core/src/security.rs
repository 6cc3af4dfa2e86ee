//! Credential hashing and HMAC signing.
//!
//! Two HMAC schemes exist and must never share a secret (Design note:
//! "token + signature for direct launch is distinct from the callback
//! signature"): [`sign_launch_token`] derives from the *provider's*
//! `api_secret`, while [`sign_callback_body`]/[`verify_callback_signature`]
//! use the *partner's* shared secret. Mixing them up would let a provider
//! forge partner-facing callbacks or vice versa.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub fn hash_password(plain: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(plain, bcrypt::DEFAULT_COST)
}

pub fn verify_password(plain: &str, hash: &str) -> Result<bool, bcrypt::BcryptError> {
    bcrypt::verify(plain, hash)
}

/// Generates a fresh API secret, returned in plaintext exactly once.
pub fn generate_api_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generates the 32-byte hex session token minted at game launch
/// (spec.md §4.E step 3).
pub fn generate_session_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn hmac_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq_hex(candidate: &str, expected: &str) -> bool {
    candidate.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// `signature = HMAC-SHA256(provider.secret, token|gameCode|currency|playerId)`
/// for direct-integration launch URLs (spec.md §4.E step 4).
pub fn sign_launch_token(
    provider_secret: &str,
    token: &str,
    game_code: &str,
    currency: &str,
    player_id: &str,
) -> String {
    let message = format!("{token}|{game_code}|{currency}|{player_id}");
    hmac_hex(provider_secret, message.as_bytes())
}

/// `HMAC-SHA256(partner.shared_secret, raw_body_bytes)` for provider
/// callbacks (spec.md §6).
pub fn sign_callback_body(partner_secret: &str, raw_body: &[u8]) -> String {
    hmac_hex(partner_secret, raw_body)
}

pub fn verify_callback_signature(partner_secret: &str, raw_body: &[u8], signature_header: &str) -> bool {
    let expected = sign_callback_body(partner_secret, raw_body);
    constant_time_eq_hex(signature_header, &expected)
}

/// Canonical HMAC signing scheme for authenticated internal/operator
/// requests: `METHOD\nPATH\nQUERY\nAPI_KEY\nTIMESTAMP[\nBODY_SHA256]`.
pub fn canonical_request_string(
    method: &str,
    path: &str,
    query: &str,
    api_key: &str,
    timestamp: &str,
    body_sha256_hex: Option<&str>,
) -> String {
    let mut canonical = format!("{method}\n{path}\n{query}\n{api_key}\n{timestamp}");
    if let Some(body_hash) = body_sha256_hex {
        canonical.push('\n');
        canonical.push_str(body_hash);
    }
    canonical
}

pub fn sign_canonical_request(secret: &str, canonical: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest;
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_and_callback_signatures_diverge_for_same_token() {
        let provider_secret = "provider-secret";
        let partner_secret = "partner-secret";
        let token = "deadbeef";
        let launch_sig = sign_launch_token(provider_secret, token, "slots-1", "USD", "player-1");
        let callback_sig = sign_callback_body(partner_secret, token.as_bytes());
        assert_ne!(launch_sig, callback_sig);
    }

    #[test]
    fn callback_signature_roundtrips() {
        let secret = "shared";
        let body = br#"{"action":"bet"}"#;
        let sig = sign_callback_body(secret, body);
        assert!(verify_callback_signature(secret, body, &sig));
        assert!(!verify_callback_signature(secret, body, "deadbeef"));
    }

    #[test]
    fn password_hash_roundtrips() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }
}
