//! OpenID Connect login flow
//!
//! [`OidcGateway`] drives the authorization-code flow for the browser:
//!
//! 1. `start_auth` resolves the post-login destination, seals it into a
//!    [`SignedState`] token and returns the provider's authorization URL.
//! 2. `handle_callback` validates the state, exchanges the code, verifies
//!    the ID token, maps claims to [`UserData`], applies the allow-lists,
//!    provisions and logs the user in through the [`Backend`] and returns the
//!    rewritten session cookies plus the destination.
//!
//! Every step is a hard stop. Whatever fails, the browser only ever sees
//! [`AuthError`]'s generic response; the cause is logged by the caller.

mod provider;
mod verify;

pub use self::provider::{PROVIDER_TIMEOUT, ProviderClient, ProviderError, ProviderMetadata};
pub use self::verify::{DEFAULT_JWKS_TTL, IdTokenClaims, IdTokenVerifier, JwksCache};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::backend::{Backend, BackendError, UserData};
use crate::config::{AccessConfig, Config};
use crate::cookies::CookieRewriter;
use crate::state::{DEFAULT_REDIRECT, SignedState, StateError};
use crate::{Error, Result};

/// Body of every failed authentication response
pub const AUTH_FAILED_BODY: &str = "Authentication failed";

/// Query parameters of the provider redirect
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// Signed state minted by `start_auth`
    pub state: Option<String>,
    /// Provider error code
    pub error: Option<String>,
    /// Provider error description
    pub error_description: Option<String>,
}

/// Allow-list rejections
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyRejection {
    /// ID token carried no email claim
    #[error("ID token has no email claim")]
    MissingEmail,
    /// Email is not `local@domain`
    #[error("email address is malformed")]
    InvalidEmail,
    /// Domain not in `access.allowed_domains`
    #[error("email domain '{0}' is not allowed")]
    DomainNotAllowed(String),
    /// Address not in `access.allowed_emails`
    #[error("email address is not allowed")]
    EmailNotAllowed,
}

impl PolicyRejection {
    /// Short label for logs
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingEmail => "missing_email",
            Self::InvalidEmail => "invalid_email",
            Self::DomainNotAllowed(_) => "domain_not_allowed",
            Self::EmailNotAllowed => "email_not_allowed",
        }
    }
}

/// Why a login attempt failed. Rendered to the browser as one generic 401.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Missing, forged or expired state
    #[error("state rejected: {0}")]
    State(#[from] StateError),
    /// Provider error, code exchange or token verification failure
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Identity not allowed
    #[error("access denied: {0}")]
    Policy(#[from] PolicyRejection),
    /// Upstream provisioning or login failure
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    /// Required callback parameter absent
    #[error("missing '{0}' parameter")]
    MissingParameter(&'static str),
    /// Callback chain exceeded the request timeout
    #[error("login timed out after {0:?}")]
    Timeout(Duration),
}

impl AuthError {
    /// Short label for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::State(_) => "state",
            Self::Provider(_) => "provider",
            Self::Policy(rejection) => rejection.reason(),
            Self::Backend(_) => "backend",
            Self::MissingParameter(_) => "missing_parameter",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, AUTH_FAILED_BODY).into_response()
    }
}

/// Result of a successful callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    /// Where to send the browser
    pub redirect: String,
    /// Rewritten `Set-Cookie` values
    pub set_cookies: Vec<String>,
}

/// Domain and address allow-lists, lower-cased once at startup.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    domains: HashSet<String>,
    emails: HashSet<String>,
}

impl AccessPolicy {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(access: &AccessConfig) -> Self {
        Self {
            domains: access.domain_set(),
            emails: access.email_set(),
        }
    }

    /// Check an email against both lists. Empty lists allow everyone.
    ///
    /// # Errors
    ///
    /// Returns the [`PolicyRejection`] of the first list that fails.
    pub fn check(&self, email: &str) -> std::result::Result<(), PolicyRejection> {
        let email = email.trim().to_lowercase();

        if !self.domains.is_empty() {
            let mut parts = email.split('@');
            let domain = match (parts.next(), parts.next(), parts.next()) {
                (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty() => domain,
                _ => return Err(PolicyRejection::InvalidEmail),
            };
            if !self.domains.contains(domain) {
                return Err(PolicyRejection::DomainNotAllowed(domain.to_string()));
            }
        }

        if !self.emails.is_empty() && !self.emails.contains(&email) {
            return Err(PolicyRejection::EmailNotAllowed);
        }

        Ok(())
    }
}

/// Map verified claims to [`UserData`].
///
/// `name` is split on whitespace (first token is the first name, the rest the
/// last name); explicit `given_name` / `family_name` win. With no name claims
/// at all the configured defaults apply.
///
/// # Errors
///
/// Returns [`PolicyRejection::MissingEmail`] if there is no usable email.
pub fn user_from_claims(
    claims: IdTokenClaims,
    default_first_name: &str,
    default_last_name: &str,
) -> std::result::Result<UserData, PolicyRejection> {
    let email = claims
        .email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or(PolicyRejection::MissingEmail)?
        .to_string();

    let (mut first_name, mut last_name) = match non_blank(claims.name.as_deref()) {
        Some(name) => {
            let mut tokens = name.split_whitespace();
            let first = tokens.next().unwrap_or_default().to_string();
            let rest: Vec<&str> = tokens.collect();
            (first, rest.join(" "))
        }
        None => (default_first_name.to_string(), default_last_name.to_string()),
    };

    if let Some(given) = non_blank(claims.given_name.as_deref()) {
        first_name = given.to_string();
    }
    if let Some(family) = non_blank(claims.family_name.as_deref()) {
        last_name = family.to_string();
    }

    Ok(UserData {
        email,
        first_name,
        last_name,
        subject: claims.sub,
    })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// The authentication flow, shared by all requests.
pub struct OidcGateway {
    provider: ProviderClient,
    backend: Arc<dyn Backend>,
    state: SignedState,
    cookies: CookieRewriter,
    policy: AccessPolicy,
    external_url: Url,
    default_first_name: String,
    default_last_name: String,
}

impl OidcGateway {
    /// Wire the flow from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `external_url` is not a valid URL.
    pub fn new(provider: ProviderClient, backend: Arc<dyn Backend>, config: &Config) -> Result<Self> {
        let external_url = Url::parse(&config.external_url)
            .map_err(|e| Error::Config(format!("invalid external_url: {e}")))?;

        Ok(Self {
            provider,
            backend,
            state: SignedState::new(config.state.secret.as_bytes(), config.state.ttl),
            cookies: CookieRewriter::new(config.cookies.secure, config.session_cookie_name()),
            policy: AccessPolicy::from_config(&config.access),
            external_url,
            default_first_name: config.oidc.default_first_name.clone(),
            default_last_name: config.oidc.default_last_name.clone(),
        })
    }

    /// Authorization URL for a new login.
    ///
    /// The destination is `rd`, else `referer`, else `/`; anything that is
    /// not a local path or a URL on the external origin becomes `/`.
    #[must_use]
    pub fn start_auth(&self, rd: Option<&str>, referer: Option<&str>) -> String {
        let requested = non_blank(rd).or_else(|| non_blank(referer));
        let destination = requested.map_or(DEFAULT_REDIRECT, |d| self.sanitize_redirect(d));
        debug!(destination, "Starting OIDC login");
        self.provider.authorization_url(&self.state.create(destination))
    }

    fn sanitize_redirect<'a>(&self, candidate: &'a str) -> &'a str {
        if candidate.starts_with('/') && !candidate.starts_with("//") && !candidate.starts_with("/\\") {
            return candidate;
        }
        match Url::parse(candidate) {
            Ok(url) if url.origin() == self.external_url.origin() => candidate,
            _ => DEFAULT_REDIRECT,
        }
    }

    /// Complete a login from the provider redirect.
    ///
    /// `host` is the request's `Host` header, used as the cookie domain.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] of the first step that fails. Nothing is
    /// sent upstream unless the state, token and allow-lists all pass.
    pub async fn handle_callback(
        &self,
        params: &CallbackParams,
        host: Option<&str>,
    ) -> std::result::Result<CallbackOutcome, AuthError> {
        let state = params
            .state
            .as_deref()
            .ok_or(AuthError::MissingParameter("state"))?;
        let redirect = self.state.validate(state)?;

        if let Some(error) = &params.error {
            return Err(ProviderError::Callback {
                error: error.clone(),
                description: params.error_description.clone().unwrap_or_default(),
            }
            .into());
        }
        let code = non_blank(params.code.as_deref()).ok_or(AuthError::MissingParameter("code"))?;

        let id_token = self.provider.exchange_code(code).await?;
        let claims = self.provider.verify_id_token(&id_token).await?;
        let user = user_from_claims(claims, &self.default_first_name, &self.default_last_name)?;
        self.policy.check(&user.email)?;

        let user_id = self.backend.provision_user(&user).await?;
        let raw_cookies = self.backend.login(&user_id, &user).await?;

        let cookie_host = non_blank(host)
            .or_else(|| self.external_url.host_str())
            .unwrap_or_default();
        let set_cookies = self.cookies.rewrite(&raw_cookies, cookie_host);

        info!(
            email = %user.email,
            subject = %user.subject,
            backend = self.backend.name(),
            user_id = %user_id,
            "User logged in"
        );
        Ok(CallbackOutcome {
            redirect,
            set_cookies,
        })
    }

    /// `Set-Cookie` value that ends the upstream session in the browser.
    #[must_use]
    pub fn logout_cookie(&self) -> String {
        self.cookies.clear()
    }
}
