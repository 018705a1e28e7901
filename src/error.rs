//! Error types for the OIDC gateway

use std::io;

use thiserror::Error;

/// Result type alias for the OIDC gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors raised while starting up or wiring components together.
///
/// Per-request failures have their own types ([`crate::oidc::AuthError`],
/// [`crate::gateway::proxy::ProxyError`]) because they turn into HTTP
/// responses instead of terminating the process.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identity provider discovery or metadata error
    #[error("Identity provider error: {0}")]
    Provider(#[from] crate::oidc::ProviderError),

    /// Backend adapter construction error
    #[error("Backend error: {0}")]
    Backend(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Longest upstream error body kept for logs
const MAX_ERROR_BODY: usize = 512;

/// Text of a failed response, trimmed and cut to a bounded length.
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    truncate(&body, MAX_ERROR_BODY).trim().to_string()
}

/// Longest prefix of `s` within `max` bytes that ends on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}
