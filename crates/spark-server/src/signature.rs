//! Verification of the `Upstash-Signature` header on flush webhooks.
//!
//! QStash signs every delivery with an HS256 JWT whose claims bind the
//! issuer, the destination URL and a hash of the body. Two signing keys are
//! live at any time so they can be rotated; a signature valid under either
//! one is accepted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::jwt::{verify_hs256, JwtError};

const ISSUER: &str = "Upstash";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("no signing key configured")]
    NoKeys,

    #[error(transparent)]
    Jwt(#[from] JwtError),
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    iss: String,
    #[serde(default)]
    sub: String,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
    #[serde(default)]
    body: String,
}

#[derive(Clone, Default)]
pub struct SignatureVerifier {
    current: Option<String>,
    next: Option<String>,
}

impl SignatureVerifier {
    pub fn new(current: Option<String>, next: Option<String>) -> Self {
        Self { current, next }
    }

    pub fn verify(&self, signature: &str, body: &[u8], url: &str) -> Result<(), SignatureError> {
        self.verify_at(signature, body, url, chrono::Utc::now().timestamp())
    }

    /// Verify with the current key, then the next one.
    pub fn verify_at(
        &self,
        signature: &str,
        body: &[u8],
        url: &str,
        now: i64,
    ) -> Result<(), SignatureError> {
        let mut last = SignatureError::NoKeys;
        for key in [&self.current, &self.next].into_iter().flatten() {
            match verify_with_key(key, signature, body, url, now) {
                Ok(()) => return Ok(()),
                Err(e) => last = e.into(),
            }
        }
        Err(last)
    }
}

fn verify_with_key(
    key: &str,
    signature: &str,
    body: &[u8],
    url: &str,
    now: i64,
) -> Result<(), JwtError> {
    let claims: Claims = verify_hs256(signature, key.as_bytes())?;

    if claims.iss != ISSUER {
        return Err(JwtError::Claim("iss"));
    }
    if claims.sub != url {
        return Err(JwtError::Claim("sub"));
    }
    if claims.exp.is_some_and(|exp| now > exp) {
        return Err(JwtError::Claim("exp"));
    }
    if claims.nbf.is_some_and(|nbf| now < nbf) {
        return Err(JwtError::Claim("nbf"));
    }

    let digest = URL_SAFE_NO_PAD.encode(Sha256::digest(body));
    if claims.body.trim_end_matches('=') != digest {
        return Err(JwtError::Claim("body"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn sign_for_test(key: &str, url: &str, body: &[u8], now: i64) -> String {
    let claims = serde_json::json!({
        "iss": ISSUER,
        "sub": url,
        "exp": now + 300,
        "nbf": now - 1,
        "iat": now,
        "body": URL_SAFE_NO_PAD.encode(Sha256::digest(body)),
    });
    crate::jwt::sign_hs256(&claims, key.as_bytes())
}
