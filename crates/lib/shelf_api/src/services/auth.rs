//! Bearer token verification.
//!
//! Tokens are issued by the external identity provider and signed HS256 with
//! a shared secret. `sub` is the stable user id everything else keys on.

use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// JWT claims carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: external user id.
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Expiry (unix timestamp).
    pub exp: i64,
    /// Issued at (unix timestamp).
    #[serde(default)]
    pub iat: i64,
}

/// Verify a JWT access token, returning the claims on success.
pub fn verify_access_token(token: &str, secret: &[u8]) -> Option<TokenClaims> {
    let key = DecodingKey::from_secret(secret);
    let mut validation = Validation::default();
    validation.validate_exp = true;
    match decode::<TokenClaims>(token, &key, &validation) {
        Ok(data) if !data.claims.sub.trim().is_empty() => Some(data.claims),
        Ok(_) => None,
        Err(e) => {
            debug!("rejected bearer token: {e}");
            None
        }
    }
}
