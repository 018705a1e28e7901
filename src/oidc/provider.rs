//! OpenID Connect relying-party client
//!
//! Discovery, authorization URL construction and the authorization-code
//! exchange. ID-token verification is delegated to [`IdTokenVerifier`].

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::verify::{IdTokenClaims, IdTokenVerifier, JwksCache};
use crate::config::{OidcConfig, TokenAuthMethod};
use crate::error::error_body;


/// Default timeout for calls to the identity provider
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity provider failures
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Discovery document missing or unusable
    #[error("OIDC discovery failed: {0}")]
    Discovery(String),

    /// Discovery document names a different issuer
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Configured issuer
        expected: String,
        /// Issuer in the discovery document
        actual: String,
    },

    /// An advertised endpoint is not a valid URL
    #[error("Invalid {name} endpoint: {url}")]
    InvalidEndpoint {
        /// Metadata field name
        name: &'static str,
        /// Offending value
        url: String,
    },

    /// The provider redirected back with an `error` parameter
    #[error("Provider returned error '{error}': {description}")]
    Callback {
        /// `error` parameter
        error: String,
        /// `error_description` parameter (may be empty)
        description: String,
    },

    /// Token endpoint answered with a non-success status
    #[error("Token exchange failed: HTTP {status} - {body}")]
    TokenExchange {
        /// Response status
        status: StatusCode,
        /// Truncated response body
        body: String,
    },

    /// Token response carried no `id_token`
    #[error("Token response has no id_token")]
    MissingIdToken,

    /// Signature, algorithm or claim validation failed
    #[error("ID token verification failed: {0}")]
    InvalidIdToken(#[from] jsonwebtoken::errors::Error),

    /// Token has no `kid` and the key set has several candidate keys
    #[error("ID token has no 'kid' and the key set holds more than one key")]
    AmbiguousKey,

    /// No key in the provider's key set matches the token
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// Token signed with an algorithm this gateway does not accept
    #[error("Unsupported ID token algorithm: {0:?}")]
    UnsupportedAlgorithm(jsonwebtoken::Algorithm),

    /// Transport error talking to the provider
    #[error("Provider request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Subset of the OpenID Provider metadata the gateway needs
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderMetadata {
    /// Issuer identifier, compared against the `iss` claim
    pub issuer: String,
    /// Browser-facing authorization endpoint
    pub authorization_endpoint: String,
    /// Back-channel token endpoint
    pub token_endpoint: String,
    /// JSON Web Key Set location
    pub jwks_uri: String,
}

impl ProviderMetadata {
    /// Fetch `{issuer}/.well-known/openid-configuration`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on transport failure, a non-success status,
    /// an undecodable document, or an `issuer` that does not match.
    pub async fn discover(client: &Client, issuer: &str) -> Result<Self, ProviderError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(url = %url, "Discovering OpenID provider metadata");

        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::Discovery(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }

        let metadata: Self = response
            .json()
            .await
            .map_err(|e| ProviderError::Discovery(format!("invalid metadata document: {e}")))?;

        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(ProviderError::IssuerMismatch {
                expected: issuer.to_string(),
                actual: metadata.issuer,
            });
        }

        debug!(issuer = %metadata.issuer, "Discovered OpenID provider");
        Ok(metadata)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

/// Configured client for one OpenID provider
pub struct ProviderClient {
    http: Client,
    authorization_endpoint: Url,
    token_endpoint: Url,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scope: String,
    prompt: Option<String>,
    auth_method: TokenAuthMethod,
    verifier: IdTokenVerifier,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("authorization_endpoint", &self.authorization_endpoint.as_str())
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

impl ProviderClient {
    /// Discover the provider and build a client for it.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if discovery fails or advertises bad endpoints.
    pub async fn discover(
        http: Client,
        oidc: &OidcConfig,
        redirect_uri: String,
    ) -> Result<Self, ProviderError> {
        let metadata = ProviderMetadata::discover(&http, &oidc.issuer).await?;
        Self::new(http, metadata, oidc, redirect_uri)
    }

    /// Build a client from already known metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidEndpoint`] if an endpoint is not a URL.
    pub fn new(
        http: Client,
        metadata: ProviderMetadata,
        oidc: &OidcConfig,
        redirect_uri: String,
    ) -> Result<Self, ProviderError> {
        let authorization_endpoint = parse_endpoint("authorization", &metadata.authorization_endpoint)?;
        let token_endpoint = parse_endpoint("token", &metadata.token_endpoint)?;
        parse_endpoint("jwks", &metadata.jwks_uri)?;

        let verifier = IdTokenVerifier::new(
            JwksCache::new(http.clone(), metadata.jwks_uri),
            metadata.issuer,
            oidc.client_id.clone(),
        );

        Ok(Self {
            http,
            authorization_endpoint,
            token_endpoint,
            client_id: oidc.client_id.clone(),
            client_secret: oidc.client_secret.clone(),
            redirect_uri,
            scope: oidc.scopes.join(" "),
            prompt: oidc.prompt.clone().filter(|p| !p.is_empty()),
            auth_method: oidc.token_auth_method,
            verifier,
        })
    }

    /// Registered redirect URI
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Authorization endpoint URL carrying `state`.
    #[must_use]
    pub fn authorization_url(&self, state: &str) -> String {
        let mut url = self.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("scope", &self.scope)
                .append_pair("state", state);
            if let Some(prompt) = &self.prompt {
                query.append_pair("prompt", prompt);
            }
        }
        url.into()
    }

    /// Exchange an authorization code for the raw ID token.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on transport failure, a non-success status or
    /// a response without an `id_token`.
    pub async fn exchange_code(&self, code: &str) -> Result<String, ProviderError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];

        let mut request = self.http.post(self.token_endpoint.clone());
        match self.auth_method {
            TokenAuthMethod::ClientSecretBasic => {
                request = request.basic_auth(&self.client_id, Some(&self.client_secret));
            }
            TokenAuthMethod::ClientSecretPost => {
                form.push(("client_id", self.client_id.as_str()));
                form.push(("client_secret", self.client_secret.as_str()));
            }
        }

        let response = request.form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(ProviderError::TokenExchange { status, body });
        }

        let tokens: TokenResponse = response.json().await?;
        match tokens.id_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ProviderError::MissingIdToken),
        }
    }

    /// Verify an ID token's signature, issuer, audience and expiry.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the token does not verify.
    pub async fn verify_id_token(&self, token: &str) -> Result<IdTokenClaims, ProviderError> {
        self.verifier.verify(token).await
    }
}

fn parse_endpoint(name: &'static str, raw: &str) -> Result<Url, ProviderError> {
    Url::parse(raw).map_err(|_| ProviderError::InvalidEndpoint {
        name,
        url: raw.to_string(),
    })
}
