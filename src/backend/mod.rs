//! Upstream application adapters
//!
//! A [`Backend`] knows how to provision an end user in one upstream product
//! and how to open a browser session for that user. Adapters hold a privileged
//! admin credential in a [`SessionCache`](crate::session_cache::SessionCache)
//! through [`AdminClient`].
//!
//! Errors crossing the trait boundary are opaque ([`BackendError`]). The
//! detailed [`UpstreamError`] is logged inside the adapter and never reaches
//! the browser.

mod admin;
pub mod metabase;
pub mod nocodb;

pub use self::admin::AdminClient;
pub use self::metabase::MetabaseBackend;
pub use self::nocodb::NocodbBackend;

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::info;
use url::Url;

use crate::config::{BackendConfig, UpstreamConfig};
use crate::session_cache::AuthorizationFailure;
use crate::{Error, Result};

/// Length of the one-time passwords minted for SSO-only users
pub const PASSWORD_LEN: usize = 24;

const PASSWORD_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_@#";

/// Identity claims taken from a verified ID token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserData {
    /// Email address (trimmed)
    pub email: String,
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
    /// Provider's stable subject identifier
    pub subject: String,
}

/// Opaque adapter failure, safe to surface
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// The user could not be found, created or updated
    #[error("user provisioning failed")]
    ProvisionFailed,
    /// No upstream session could be established
    #[error("user login failed")]
    LoginFailed,
}

/// Detailed upstream failure, only ever logged
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Admin credential rejected (HTTP 401)
    #[error("upstream rejected the admin credential")]
    Unauthorized,

    /// Any other non-success status
    #[error("{context} failed with HTTP {status}: {body}")]
    Status {
        /// Which call failed
        context: &'static str,
        /// Response status
        status: StatusCode,
        /// Truncated response body
        body: String,
    },

    /// Transport or decoding error
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Response was well formed HTTP but unusable
    #[error("invalid upstream response: {0}")]
    Invalid(String),

    /// Admin login task was torn down
    #[error("admin login task failed: {0}")]
    Refresh(#[from] JoinError),
}

impl AuthorizationFailure for UpstreamError {
    fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// Provisioning and login against one upstream product.
///
/// Both operations are cancelled by dropping the returned future.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &'static str;

    /// Find the user by email or create it, then sync profile fields.
    /// Returns the upstream user id. Safe to call on every login.
    async fn provision_user(&self, user: &UserData) -> std::result::Result<String, BackendError>;

    /// Open a fresh upstream session and return its raw `Set-Cookie` values.
    async fn login(
        &self,
        user_id: &str,
        user: &UserData,
    ) -> std::result::Result<Vec<String>, BackendError>;
}

/// Random one-time password drawn from the thread-local CSPRNG.
pub fn generate_password(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(PASSWORD_ALPHABET[rng.random_range(0..PASSWORD_ALPHABET.len())]))
        .collect()
}

/// Build the configured adapter.
///
/// # Errors
///
/// Returns [`Error::Backend`] if the upstream URL is unusable or the HTTP
/// client cannot be built.
pub fn from_config(backend: &BackendConfig, upstream: &UpstreamConfig) -> Result<Arc<dyn Backend>> {
    let base = Url::parse(&upstream.url)
        .map_err(|e| Error::Backend(format!("invalid upstream.url: {e}")))?;
    let http = Client::builder()
        .timeout(upstream.timeout)
        .build()
        .map_err(|e| Error::Backend(format!("failed to build HTTP client: {e}")))?;

    let adapter: Arc<dyn Backend> = match backend {
        BackendConfig::Metabase(cfg) => Arc::new(MetabaseBackend::new(http, base, cfg).map_err(backend_error)?),
        BackendConfig::Nocodb(cfg) => Arc::new(NocodbBackend::new(http, base, cfg).map_err(backend_error)?),
    };
    info!(backend = adapter.name(), "Backend adapter ready");
    Ok(adapter)
}

fn backend_error(e: UpstreamError) -> Error {
    Error::Backend(e.to_string())
}

/// Raw `Set-Cookie` values of a response, in order.
pub(crate) fn set_cookie_values(resp: &reqwest::Response) -> Vec<String> {
    resp.headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect()
}
