//! Password hashing and session token helpers

use axum::http::{header::AUTHORIZATION, HeaderMap};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;

const HASH_SCHEME: &str = "pbkdf2-sha256";
const HASH_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 16;

/// Hash a password with a fresh random salt.
///
/// Format: `pbkdf2-sha256$<rounds>$<salt hex>$<digest hex>`
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    format!(
        "{}${}${}${}",
        HASH_SCHEME,
        HASH_ROUNDS,
        hex::encode(salt),
        hex::encode(derive_key(&salt, password, HASH_ROUNDS))
    )
}

/// Check a password against a hash produced by [`hash_password`]
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(4, '$');
    let (Some(scheme), Some(rounds), Some(salt_hex), Some(digest_hex)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if scheme != HASH_SCHEME {
        return false;
    }
    let Ok(rounds) = rounds.parse::<u32>() else {
        return false;
    };
    if rounds == 0 {
        return false;
    }
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };

    let actual = derive_key(&salt, password, rounds);
    if actual.len() != expected.len() {
        return false;
    }
    // Constant-time comparison
    let mut diff = 0u8;
    for (a, b) in actual.iter().zip(expected.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

fn derive_key(salt: &[u8], password: &str, rounds: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut key);
    key
}

/// Generate an opaque session token
pub fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("mm_{}", hex::encode(bytes))
}

/// Pull the session token from `Authorization: Bearer` or the `token` query parameter
pub fn token_from_request(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    from_header.or_else(|| params.get("token").filter(|t| !t.is_empty()).cloned())
}
