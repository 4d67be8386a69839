//! WebSocket bearer authentication.
//!
//! Tokens are HS256 JWTs issued by the identity service with the user id in
//! the `uid` claim. Browsers cannot set headers on a WebSocket upgrade, so
//! the token may also arrive as the `token` query parameter.

use axum::http::HeaderMap;
use serde::Deserialize;

use crate::jwt::{verify_hs256, JwtError};

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    exp: Option<i64>,
}

#[derive(Clone)]
pub struct TokenAuth {
    secret: Option<Vec<u8>>,
}

impl TokenAuth {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.map(String::into_bytes),
        }
    }

    /// Resolve the caller's user id from the request.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<String, JwtError> {
        let token = bearer_token(headers)
            .or(query_token)
            .filter(|t| !t.is_empty())
            .ok_or(JwtError::Malformed)?;
        self.user_id(token, chrono::Utc::now().timestamp())
    }

    pub fn user_id(&self, token: &str, now: i64) -> Result<String, JwtError> {
        let secret = self.secret.as_deref().ok_or(JwtError::Signature)?;
        let claims: Claims = verify_hs256(token, secret)?;
        if claims.exp.is_some_and(|exp| now > exp) {
            return Err(JwtError::Claim("exp"));
        }
        if claims.uid.is_empty() {
            return Err(JwtError::Claim("uid"));
        }
        Ok(claims.uid)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth = headers.get("authorization")?.to_str().ok()?;
    Some(auth.strip_prefix("Bearer ").unwrap_or(auth).trim())
}
