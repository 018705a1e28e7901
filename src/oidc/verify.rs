//! ID token verification against the provider's JWKS
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to read `kid` and `alg`.
//! 2. Reject algorithms outside the asymmetric allow-list; there is no
//!    fallback algorithm.
//! 3. Look the key up in the cached JWKS (1 hour); an unknown `kid` forces a
//!    single refresh before failing.
//! 4. Verify the signature and `iss`, `aud`, `exp` with 60 seconds of leeway.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tracing::debug;

use super::ProviderError;

/// How long a fetched key set is trusted
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(3600);

/// Clock skew tolerated on `exp`
const LEEWAY_SECS: u64 = 60;

/// Claims the gateway reads from a verified ID token
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct IdTokenClaims {
    /// Subject
    pub sub: String,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
    /// Full display name
    #[serde(default)]
    pub name: Option<String>,
    /// Given name
    #[serde(default)]
    pub given_name: Option<String>,
    /// Family name
    #[serde(default)]
    pub family_name: Option<String>,
    /// Preferred username
    #[serde(default)]
    pub preferred_username: Option<String>,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Key set of a single provider, refetched once stale.
pub struct JwksCache {
    http: reqwest::Client,
    jwks_uri: String,
    ttl: Duration,
    cached: Mutex<Option<CachedJwks>>,
}

impl JwksCache {
    /// Cache for `jwks_uri` with the default 1-hour TTL.
    #[must_use]
    pub fn new(http: reqwest::Client, jwks_uri: String) -> Self {
        Self {
            http,
            jwks_uri,
            ttl: DEFAULT_JWKS_TTL,
            cached: Mutex::new(None),
        }
    }

    /// Override the TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Return the cached key set, or fetch it if stale or `force_refresh`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Http`] if the fetch fails.
    pub async fn get(&self, force_refresh: bool) -> Result<JwkSet, ProviderError> {
        if !force_refresh {
            if let Some(keys) = self.fresh() {
                return Ok(keys);
            }
        }

        debug!(jwks_uri = %self.jwks_uri, force_refresh, "Fetching JWKS");
        let keys: JwkSet = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut guard = self.cached.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(CachedJwks {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }

    fn fresh(&self) -> Option<JwkSet> {
        let guard = self.cached.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.keys.clone())
    }
}

/// Verifies ID tokens issued by one provider for one client.
pub struct IdTokenVerifier {
    jwks: JwksCache,
    issuer: String,
    client_id: String,
}

impl IdTokenVerifier {
    /// `issuer` is the discovered issuer identifier, matched exactly.
    #[must_use]
    pub fn new(jwks: JwksCache, issuer: String, client_id: String) -> Self {
        Self {
            jwks,
            issuer,
            client_id,
        }
    }

    /// Verify `token` and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the token is malformed, uses an
    /// unsupported algorithm, names an unknown key, fails signature
    /// verification, or has the wrong issuer, audience or expiry.
    pub async fn verify(&self, token: &str) -> Result<IdTokenClaims, ProviderError> {
        let header = decode_header(token)?;
        let alg = supported_algorithm(header.alg)?;
        let key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(alg);
        validation.leeway = LEEWAY_SECS;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.client_id.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let data = decode::<IdTokenClaims>(token, &key, &validation)?;
        Ok(data.claims)
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, ProviderError> {
        let jwks = self.jwks.get(false).await?;
        if let Some(key) = select_key(&jwks, kid)? {
            return Ok(key);
        }

        debug!(kid = ?kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks.get(true).await?;
        select_key(&jwks, kid)?
            .ok_or_else(|| ProviderError::UnknownKeyId(kid.unwrap_or("(none)").to_string()))
    }
}

fn supported_algorithm(alg: Algorithm) -> Result<Algorithm, ProviderError> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => Ok(alg),
        other => Err(ProviderError::UnsupportedAlgorithm(other)),
    }
}

fn is_signing_key(jwk: &Jwk) -> bool {
    let for_encryption = matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption));
    let asymmetric = matches!(
        jwk.algorithm,
        AlgorithmParameters::RSA(_) | AlgorithmParameters::EllipticCurve(_)
    );
    asymmetric && !for_encryption
}

/// Pick the verification key. Without a `kid`, only an unambiguous key set
/// (exactly one signing key) is acceptable.
fn select_key(jwks: &JwkSet, kid: Option<&str>) -> Result<Option<DecodingKey>, ProviderError> {
    let mut candidates = jwks.keys.iter().filter(|jwk| is_signing_key(jwk));

    let jwk = match kid {
        Some(kid) => candidates.find(|jwk| jwk.common.key_id.as_deref() == Some(kid)),
        None => {
            let first = candidates.next();
            if first.is_some() && candidates.next().is_some() {
                return Err(ProviderError::AmbiguousKey);
            }
            first
        }
    };

    jwk.map(to_decoding_key).transpose()
}

fn to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, ProviderError> {
    let key = match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)?,
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)?,
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => {
            return Err(ProviderError::UnknownKeyId(
                jwk.common.key_id.clone().unwrap_or_default(),
            ));
        }
    };
    Ok(key)
}
