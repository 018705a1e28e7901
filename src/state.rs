//! Signed OIDC `state` tokens.
//!
//! The `state` parameter round-trips through the identity provider and carries
//! the post-login destination. It is stateless CSRF protection: the gateway
//! keeps nothing server-side, it only checks that the token was minted with
//! its own secret and that it is still fresh.
//!
//! # Wire format
//!
//! ```text
//! base64url(payload_json) "." base64url(hmac_sha256(secret, payload_json))
//! ```
//!
//! `payload_json` is `{"redirect": "...", "ts": <unix seconds>, "nonce": "<uuid>"}`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Destination used when the token carries no usable redirect.
pub const DEFAULT_REDIRECT: &str = "/";

/// Reasons a `state` token is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Not two base64url segments joined by `.`
    #[error("invalid state format")]
    InvalidFormat,
    /// MAC mismatch (forged or tampered token)
    #[error("invalid state signature")]
    InvalidSignature,
    /// Older than the configured TTL
    #[error("state expired")]
    Expired,
    /// Authenticated payload that is not the expected JSON document
    #[error("malformed state payload")]
    MalformedPayload,
}

/// Serialized payload. Field order is fixed by the struct definition, which
/// keeps serialization deterministic.
#[derive(Debug, Serialize)]
struct StatePayload<'a> {
    redirect: &'a str,
    ts: u64,
    nonce: String,
}

/// Payload as read back. `redirect` is kept loose so that a corrupted
/// destination degrades to `/` instead of failing the login.
#[derive(Debug, Deserialize)]
struct ReceivedPayload {
    #[serde(default)]
    redirect: Option<serde_json::Value>,
    ts: Option<u64>,
}

/// Mints and validates signed `state` tokens.
pub struct SignedState {
    secret: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for SignedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedState")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SignedState {
    /// Create a signer keyed by `secret`, accepting tokens up to `ttl` old.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    /// Mint a token that carries `redirect`.
    #[must_use]
    pub fn create(&self, redirect: &str) -> String {
        self.create_at(redirect, unix_now())
    }

    /// Validate `token` and return the embedded redirect destination.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the token is malformed, was not signed
    /// with this secret, or is older than the TTL.
    pub fn validate(&self, token: &str) -> Result<String, StateError> {
        self.validate_at(token, unix_now())
    }

    fn create_at(&self, redirect: &str, now: u64) -> String {
        let payload = StatePayload {
            redirect,
            ts: now,
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        // Serializing a struct of strings and integers cannot fail.
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        let signature = self.sign(&json);

        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&json),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    fn validate_at(&self, token: &str, now: u64) -> Result<String, StateError> {
        let mut parts = token.split('.');
        let (Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(StateError::InvalidFormat);
        };

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| StateError::InvalidFormat)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| StateError::InvalidFormat)?;

        let expected = self.sign(&payload);
        if !bool::from(expected.ct_eq(&signature)) {
            return Err(StateError::InvalidSignature);
        }

        let received: ReceivedPayload =
            serde_json::from_slice(&payload).map_err(|_| StateError::MalformedPayload)?;

        let issued_at = received.ts.ok_or(StateError::MalformedPayload)?;
        if now.saturating_sub(issued_at) > self.ttl.as_secs() {
            return Err(StateError::Expired);
        }

        let redirect = match received.redirect {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            _ => DEFAULT_REDIRECT.to_string(),
        };
        Ok(redirect)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
