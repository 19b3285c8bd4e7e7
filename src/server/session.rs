//! Settings password and session cookie

use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_NAME: &str = "settings_auth";

/// Accepted while no password has ever been set.
pub const BOOTSTRAP_PASSWORD: &str = "pibox123";

const COOKIE_MESSAGE: &[u8] = b"settings";
/// Key for comparing password hashes through their MACs
const COMPARE_KEY: &[u8] = b"settings-password";

/// Lowercase hex SHA-256 of `password`, as stored in the config file.
pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// Outcome of checking a login password
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordCheck {
    /// Matches the stored hash
    Accepted,
    /// Bootstrap password with no hash on file; the caller should store this one
    Bootstrap(String),
    Rejected,
}

pub fn check_password(stored_hash: Option<&str>, password: &str) -> PasswordCheck {
    match stored_hash.filter(|h| !h.is_empty()) {
        Some(stored) => {
            if hashes_match(stored, &hash_password(password)) {
                PasswordCheck::Accepted
            } else {
                PasswordCheck::Rejected
            }
        }
        None if password == BOOTSTRAP_PASSWORD => {
            PasswordCheck::Bootstrap(hash_password(password))
        }
        None => PasswordCheck::Rejected,
    }
}

/// Constant-time equality of two hex hashes.
fn hashes_match(stored: &str, candidate: &str) -> bool {
    let keyed = |hash: &str| {
        let mut mac = HmacSha256::new_from_slice(COMPARE_KEY).expect("HMAC key length is valid");
        mac.update(hash.as_bytes());
        mac
    };
    let expected = keyed(stored).finalize().into_bytes();
    keyed(candidate).verify_slice(&expected).is_ok()
}

fn mac(password_hash: &str) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(password_hash.as_bytes()).expect("HMAC key length is valid");
    mac.update(COOKIE_MESSAGE);
    mac
}

/// Cookie value proving knowledge of the password behind `password_hash`.
pub fn session_token(password_hash: &str) -> String {
    BASE64.encode(mac(password_hash).finalize().into_bytes())
}

/// `Set-Cookie` header value carrying a fresh session token.
pub fn session_cookie(password_hash: &str) -> String {
    format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/",
        COOKIE_NAME,
        session_token(password_hash)
    )
}

/// Whether the request carries a session cookie issued for `password_hash`.
pub fn is_authorized(headers: &HeaderMap, password_hash: Option<&str>) -> bool {
    let Some(password_hash) = password_hash.filter(|h| !h.is_empty()) else {
        return false;
    };
    let Some(token) = cookie_value(headers, COOKIE_NAME) else {
        return false;
    };
    let Ok(tag) = BASE64.decode(token) else {
        return false;
    };
    mac(password_hash).verify_slice(&tag).is_ok()
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}
