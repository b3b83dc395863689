#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-capability** – Signed, revocable, per-app capability tokens.
//!
//! Every sandboxed app receives one bearer token per granted capability,
//! signed with a process-scoped HMAC-SHA256 key that never leaves this
//! module. Sandboxes present tokens back to the kernel on host calls; the
//! kernel accepts a token iff the signature matches, the expiry has not
//! passed, and the nonce has not been revoked.
//!
//! The wire format is a three-segment URL-safe base64 token (HS256) carrying
//! the claim set [`TokenClaims`]; minting and validation reuse the
//! `jsonwebtoken` crate, whose MAC comparison is constant-time.

use std::collections::{BTreeMap, HashMap, HashSet};

use base64::Engine as _;
use parking_lot::RwLock;
use rand::RngCore;
use tracing::{debug, warn};

use lumos_types::{Capability, DEFAULT_TOKEN_TTL_SECS, MAX_TOKEN_LEN};

mod proposal;
pub use proposal::{infer_app_type, propose_capabilities};

pub mod hs256;
pub use hs256::TokenClaims;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Why a token failed verification.
///
/// The `Display` spellings are stable and surfaced verbatim through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Structure damage: not three segments, bad base64, or a foreign header.
    #[error("malformed")]
    Malformed,
    /// MAC does not match.
    #[error("invalid_signature")]
    InvalidSignature,
    /// Payload decodes but is not a valid claim set.
    #[error("invalid_payload")]
    InvalidPayload,
    /// `exp` lies in the past.
    #[error("expired")]
    Expired,
    /// The nonce is in the revocation set.
    #[error("revoked")]
    Revoked,
    /// `init_key` was never called.
    #[error("no_key")]
    NoKey,
}

/// Errors from grant operations.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    /// The signing key is missing.
    #[error("capability key not initialized")]
    NoKey,
    /// Token minting failed.
    #[error("token mint failed: {0}")]
    Mint(String),
}

//─────────────────────────────
//  Grants
//─────────────────────────────

/// Result of granting capabilities to an app.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    /// The capabilities actually granted.
    pub capabilities: Vec<Capability>,
    /// One signed bearer token per granted capability.
    pub tokens: BTreeMap<String, String>,
}

//─────────────────────────────
//  Capability service
//─────────────────────────────

/// Process-wide capability authority.
///
/// Owns the signing key, the per-app whitelist, the issued-token ledger and
/// the revocation set. All interior state sits behind single-writer locks;
/// every method is synchronous and cheap enough to call from async contexts.
pub struct CapabilityService {
    key: RwLock<Option<Vec<u8>>>,
    whitelist: RwLock<HashMap<String, HashSet<Capability>>>,
    issued: RwLock<HashMap<String, Vec<String>>>,
    revoked: RwLock<HashSet<String>>,
    token_ttl_secs: u64,
}

impl CapabilityService {
    /// Create a service with the default 4-hour token lifetime.
    ///
    /// The signing key is *not* generated here; call [`init_key`] once during
    /// startup, before the first grant or verification.
    ///
    /// [`init_key`]: CapabilityService::init_key
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TOKEN_TTL_SECS)
    }

    /// Create a service with a custom token lifetime (tests, short-lived apps).
    pub fn with_ttl(token_ttl_secs: u64) -> Self {
        Self {
            key: RwLock::new(None),
            whitelist: RwLock::new(HashMap::new()),
            issued: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashSet::new()),
            token_ttl_secs,
        }
    }

    /// Generate the process-local HMAC-SHA256 key.
    ///
    /// The key is 32 random bytes, lives only in this struct, and is rotated
    /// each process lifetime. Calling this again replaces the key, which
    /// invalidates every outstanding token.
    pub fn init_key(&self) {
        let mut bytes = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let mut key = self.key.write();
        if key.is_some() {
            warn!("capability key re-initialized; all outstanding tokens are now invalid");
        }
        *key = Some(bytes);
    }

    /// Grant `requested` capabilities to `app_id`, minting one token each.
    ///
    /// The request is deduplicated; unknown capability strings never reach
    /// this method because [`Capability`] is a closed enum. The granted set
    /// replaces any previous whitelist entry for the app.
    pub fn grant(&self, app_id: &str, requested: &[Capability]) -> Result<Grant, CapabilityError> {
        let key = self.key.read();
        let key = key.as_ref().ok_or(CapabilityError::NoKey)?;

        let mut granted: Vec<Capability> = Vec::new();
        for cap in requested {
            if !granted.contains(cap) {
                granted.push(*cap);
            }
        }

        let mut tokens = BTreeMap::new();
        let mut issued = Vec::new();
        for cap in &granted {
            let claims = TokenClaims::new(app_id, *cap, self.token_ttl_secs);
            let token = hs256::mint(&claims, key).map_err(|e| CapabilityError::Mint(e.to_string()))?;
            issued.push(token.clone());
            tokens.insert(cap.as_str().to_string(), token);
        }

        self.whitelist
            .write()
            .insert(app_id.to_string(), granted.iter().copied().collect());
        self.issued
            .write()
            .entry(app_id.to_string())
            .or_default()
            .extend(issued);

        debug!(app_id, count = granted.len(), "granted capabilities");
        Ok(Grant { capabilities: granted, tokens })
    }

    /// Synchronous whitelist check: does `app_id` currently hold `cap`?
    pub fn check(&self, app_id: &str, cap: Capability) -> bool {
        self.whitelist
            .read()
            .get(app_id)
            .map(|set| set.contains(&cap))
            .unwrap_or(false)
    }

    /// The full granted set for an app, empty when unknown.
    pub fn granted(&self, app_id: &str) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self
            .whitelist
            .read()
            .get(app_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        caps.sort();
        caps
    }

    /// Verify a bearer token: signature, expiry, then revocation.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(VerifyError::Malformed);
        }
        let key = self.key.read();
        let key = key.as_ref().ok_or(VerifyError::NoKey)?;

        let claims = hs256::validate(token, key)?;
        if self.revoked.read().contains(&claims.nonce) {
            return Err(VerifyError::Revoked);
        }
        Ok(claims)
    }

    /// Revoke a single token by adding its nonce to the revocation set.
    ///
    /// Best effort: a token whose payload cannot be parsed is ignored, since
    /// it could never verify anyway.
    pub fn revoke_token(&self, token: &str) {
        if let Some(nonce) = extract_nonce(token) {
            self.revoked.write().insert(nonce);
        }
    }

    /// Revoke every token issued to `app_id` and clear its whitelist entry.
    pub fn revoke_all(&self, app_id: &str) {
        let tokens = self.issued.write().remove(app_id).unwrap_or_default();
        {
            let mut revoked = self.revoked.write();
            for token in &tokens {
                if let Some(nonce) = extract_nonce(token) {
                    revoked.insert(nonce);
                }
            }
        }
        self.whitelist.write().remove(app_id);
        debug!(app_id, count = tokens.len(), "revoked all tokens");
    }

    /// Number of nonces currently in the revocation set.
    pub fn revocation_count(&self) -> usize {
        self.revoked.read().len()
    }
}

impl Default for CapabilityService {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull the `nonce` claim out of a token without verifying it.
fn extract_nonce(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    value.get("nonce")?.as_str().map(|s| s.to_string())
}
