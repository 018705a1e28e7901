//! OIDC Gateway Library
//!
//! Authenticating reverse proxy for internal web applications without
//! (usable) single sign-on. The gateway runs the OpenID Connect
//! authorization-code flow, provisions the user in the upstream application
//! through a [`backend::Backend`] adapter, hands the upstream session cookie
//! to the browser and then proxies all other traffic.
//!
//! # Components
//!
//! - [`state::SignedState`]: HMAC-signed, time-limited `state` tokens
//! - [`session_cache::SessionCache`]: cached admin credential, refreshed
//!   under a lock and retried once on HTTP 401
//! - [`backend`]: Metabase and `NocoDB` adapters
//! - [`cookies::CookieRewriter`]: `Set-Cookie` rewriting for the public host
//! - [`oidc::OidcGateway`]: the login flow
//! - [`gateway::ProxyMediator`]: the reverse proxy

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cli;
pub mod config;
pub mod cookies;
pub mod error;
pub mod gateway;
pub mod oidc;
pub mod session_cache;
pub mod state;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging. `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
