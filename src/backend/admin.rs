//! Admin-authenticated HTTP client shared by the adapters

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use super::UpstreamError;
use crate::error::error_body;
use crate::session_cache::SessionCache;

/// Upstream admin API client.
///
/// Every request carries the cached admin credential in `auth_header` and
/// goes through [`SessionCache::call_with_retry`], so a 401 triggers one
/// re-login and one retry.
pub struct AdminClient {
    http: Client,
    base: Url,
    auth_header: &'static str,
    session: SessionCache<String, UpstreamError>,
}

impl AdminClient {
    /// `login` performs the admin login and returns the credential.
    pub fn new<F, Fut>(
        http: Client,
        base: Url,
        auth_header: &'static str,
        session_ttl: Duration,
        login: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, UpstreamError>> + Send + 'static,
    {
        Self {
            http,
            base,
            auth_header,
            session: SessionCache::new(session_ttl, login),
        }
    }

    /// Underlying HTTP client (for unauthenticated calls such as user login)
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Build an upstream URL from path segments, keeping any base path prefix.
    /// Segments are percent-encoded.
    pub fn url(&self, segments: &[&str]) -> Result<Url, UpstreamError> {
        endpoint(&self.base, segments)
    }

    /// Send an admin-authenticated request and check its status.
    pub async fn send(
        &self,
        method: Method,
        url: &Url,
        query: &[(&str, &str)],
        body: Option<&Value>,
        context: &'static str,
    ) -> Result<Response, UpstreamError> {
        self.session
            .call_with_retry(|credential| {
                let mut request = self
                    .http
                    .request(method.clone(), url.clone())
                    .header(self.auth_header, credential);
                if !query.is_empty() {
                    request = request.query(query);
                }
                if let Some(body) = body {
                    request = request.json(body);
                }
                async move { check_status(request.send().await?, context).await }
            })
            .await
    }

    /// [`send`](Self::send) and decode a JSON response.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &Url,
        query: &[(&str, &str)],
        body: Option<&Value>,
        context: &'static str,
    ) -> Result<T, UpstreamError> {
        let response = self.send(method, url, query, body, context).await?;
        Ok(response.json().await?)
    }
}

/// Join path segments onto `base`, keeping its path prefix.
pub fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, UpstreamError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| UpstreamError::Invalid(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Map 401 to [`UpstreamError::Unauthorized`] and other failures to
/// [`UpstreamError::Status`] with a truncated body.
pub async fn check_status(resp: Response, context: &'static str) -> Result<Response, UpstreamError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(UpstreamError::Unauthorized);
    }
    if !status.is_success() {
        return Err(UpstreamError::Status {
            context,
            status,
            body: error_body(resp).await,
        });
    }
    Ok(resp)
}
