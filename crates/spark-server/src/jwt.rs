//! Compact HS256 JSON Web Tokens.
//!
//! Only what the server needs: verify an HMAC-SHA256 signed token and decode
//! its claims. Header `alg` must be `HS256`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("malformed token")]
    Malformed,

    #[error("unsupported algorithm: {0}")]
    Algorithm(String),

    #[error("signature mismatch")]
    Signature,

    #[error("invalid claim: {0}")]
    Claim(&'static str),
}

#[derive(Deserialize)]
struct Header {
    alg: String,
}

/// Verify `token` against `secret` and decode its claims.
pub fn verify_hs256<T: DeserializeOwned>(token: &str, secret: &[u8]) -> Result<T, JwtError> {
    let mut parts = token.trim().split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(JwtError::Malformed);
    };

    let header: Header = decode_segment(header)?;
    if header.alg != "HS256" {
        return Err(JwtError::Algorithm(header.alg));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature.trim_end_matches('='))
        .map_err(|_| JwtError::Malformed)?;
    let expected = sign_input(secret, header_and_payload(token))?;
    if expected.len() != signature.len()
        || expected.as_slice().ct_eq(signature.as_slice()).unwrap_u8() != 1
    {
        return Err(JwtError::Signature);
    }

    decode_segment(payload)
}

fn header_and_payload(token: &str) -> &str {
    let token = token.trim();
    match token.rfind('.') {
        Some(idx) => &token[..idx],
        None => token,
    }
}

fn sign_input(secret: &[u8], input: &str) -> Result<Vec<u8>, JwtError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| JwtError::Malformed)?;
    mac.update(input.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, JwtError> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| JwtError::Malformed)?;
    serde_json::from_slice(&raw).map_err(|_| JwtError::Malformed)
}

/// Sign `claims` into an HS256 token.
#[cfg(test)]
pub fn sign_hs256(claims: &serde_json::Value, secret: &[u8]) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let input = format!("{header}.{payload}");
    let signature = sign_input(secret, &input).unwrap();
    format!("{input}.{}", URL_SAFE_NO_PAD.encode(signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Claims {
        uid: String,
    }

    #[test]
    fn test_round_trip() {
        let token = sign_hs256(&json!({"uid": "alice"}), b"secret");
        let claims: Claims = verify_hs256(&token, b"secret").unwrap();
        assert_eq!(claims.uid, "alice");
    }

    #[test]
    fn test_wrong_secret() {
        let token = sign_hs256(&json!({"uid": "alice"}), b"secret");
        let err = verify_hs256::<Claims>(&token, b"other").unwrap_err();
        assert_eq!(err, JwtError::Signature);
    }

    #[test]
    fn test_tampered_payload() {
        let token = sign_hs256(&json!({"uid": "alice"}), b"secret");
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(r#"{"uid":"mallory"}"#);
        parts[1] = &forged;
        let err = verify_hs256::<Claims>(&parts.join("."), b"secret").unwrap_err();
        assert_eq!(err, JwtError::Signature);
    }

    #[test]
    fn test_rejects_other_algorithms() {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(r#"{"uid":"alice"}"#);
        let token = format!("{header}.{payload}.");
        let err = verify_hs256::<Claims>(&token, b"secret").unwrap_err();
        assert_eq!(err, JwtError::Algorithm("none".into()));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(
            verify_hs256::<Claims>("abc", b"secret").unwrap_err(),
            JwtError::Malformed
        );
    }
}
