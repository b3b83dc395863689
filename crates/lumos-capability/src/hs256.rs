//! HS256 token format: mint and validate [`TokenClaims`].
//!
//! The token is a standard three-segment JWT with header
//! `{"alg":"HS256","typ":"LLMOS-CAP"}`. The `jsonwebtoken` crate does the
//! heavy lifting; its MAC check is constant-time.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use lumos_types::Capability;

use crate::VerifyError;

/// Header `typ` value marking Lumos capability tokens.
pub const TOKEN_TYP: &str = "LLMOS-CAP";

/// Claim set embedded in every capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// The app the capability was granted to.
    pub app_id: String,
    /// The single capability this token proves.
    pub cap: Capability,
    /// Absolute expiry, seconds since Unix epoch.
    pub exp: u64,
    /// 128-bit random hex nonce for revocation and replay protection.
    pub nonce: String,
}

impl TokenClaims {
    /// Build claims for `app_id`/`cap` expiring `ttl_secs` from now.
    pub fn new(app_id: &str, cap: Capability, ttl_secs: u64) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut nonce_bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = nonce_bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self {
            app_id: app_id.to_string(),
            cap,
            exp: now + ttl_secs,
            nonce,
        }
    }
}

/// Mint a signed token from `claims`.
pub fn mint(claims: &TokenClaims, key: &[u8]) -> Result<String, jsonwebtoken::errors::Error> {
    let mut header = Header::new(Algorithm::HS256);
    header.typ = Some(TOKEN_TYP.into());
    encode(&header, claims, &EncodingKey::from_secret(key))
}

/// Validate signature and expiry, returning the claims.
pub fn validate(token: &str, key: &[u8]) -> Result<TokenClaims, VerifyError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    validation.required_spec_claims = ["exp".to_string()].into_iter().collect();

    match decode::<TokenClaims>(token, &DecodingKey::from_secret(key), &validation) {
        Ok(data) => Ok(data.claims),
        Err(e) => Err(map_error(&e)),
    }
}

fn map_error(e: &jsonwebtoken::errors::Error) -> VerifyError {
    use jsonwebtoken::errors::ErrorKind;
    match e.kind() {
        ErrorKind::InvalidSignature => VerifyError::InvalidSignature,
        ErrorKind::ExpiredSignature => VerifyError::Expired,
        ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => VerifyError::InvalidPayload,
        ErrorKind::InvalidToken
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidAlgorithmName
        | ErrorKind::Base64(_)
        | ErrorKind::Utf8(_) => VerifyError::Malformed,
        _ => VerifyError::InvalidSignature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn mint_and_validate_round_trip() {
        let claims = TokenClaims::new("app-1", Capability::UiWindow, 3600);
        let token = mint(&claims, KEY).unwrap();
        let validated = validate(&token, KEY).unwrap();
        assert_eq!(validated, claims);
    }

    #[test]
    fn nonces_are_unique() {
        let a = TokenClaims::new("app", Capability::UiWindow, 60);
        let b = TokenClaims::new("app", Capability::UiWindow, 60);
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(a.nonce.len(), 32);
    }

    #[test]
    fn wrong_key_is_invalid_signature() {
        let claims = TokenClaims::new("app-1", Capability::UiWindow, 3600);
        let token = mint(&claims, KEY).unwrap();
        assert_eq!(
            validate(&token, b"another-key-entirely-32-bytes!!!"),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut claims = TokenClaims::new("app-1", Capability::UiWindow, 3600);
        claims.exp = 1; // 1970
        let token = mint(&claims, KEY).unwrap();
        assert_eq!(validate(&token, KEY), Err(VerifyError::Expired));
    }

    #[test]
    fn structure_damage_is_malformed() {
        assert_eq!(validate("nonsense", KEY), Err(VerifyError::Malformed));
        assert_eq!(validate("a.b", KEY), Err(VerifyError::Malformed));
    }
}
