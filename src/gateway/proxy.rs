//! Reverse proxy to the upstream application
//!
//! Requests are forwarded with their method, path, query, headers and body
//! unchanged except for hop-by-hop headers (dropped) and the `X-Forwarded-*`
//! family. The browser's `Host` goes through as is, so upstream-built
//! absolute URLs point at the external origin. Bodies are
//! streamed both ways. Upstream redirects are never followed, and a
//! `Location` pointing at the internal origin is rewritten to the external
//! one. Failed requests are not retried.

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use reqwest::redirect::Policy;
use thiserror::Error;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::{Error, Result};

/// Body of every failed proxy response
pub const UPSTREAM_ERROR_BODY: &str = "Upstream error";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Connection-scoped headers that must not be forwarded (RFC 9110 §7.6.1)
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Upstream unreachable or unusable. Rendered as a generic 502.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Connection, timeout or transport failure
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_GATEWAY, UPSTREAM_ERROR_BODY).into_response()
    }
}

/// Forwards browser traffic to the upstream application.
#[derive(Debug, Clone)]
pub struct ProxyMediator {
    client: Client,
    upstream_base: String,
    external_base: String,
    rewrite_location: bool,
}

impl ProxyMediator {
    /// Build the mediator and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the client cannot be built.
    pub fn new(upstream: &UpstreamConfig, external_url: &str) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .timeout(upstream.timeout)
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            upstream_base: upstream.url.trim_end_matches('/').to_string(),
            external_base: external_url.trim_end_matches('/').to_string(),
            rewrite_location: upstream.rewrite_location,
        })
    }

    /// Forward `request` and stream the upstream response back.
    ///
    /// `peer` is the TCP peer, appended to `X-Forwarded-For` when known.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the upstream cannot be reached.
    pub async fn forward(
        &self,
        request: Request<Body>,
        peer: Option<SocketAddr>,
    ) -> std::result::Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let target = format!("{}{path_and_query}", self.upstream_base);

        let mut headers = parts.headers;
        let inbound_host = headers.get(header::HOST).cloned();
        strip_hop_by_hop(&mut headers);
        add_forwarding_headers(&mut headers, inbound_host, peer);

        debug!(method = %parts.method, target = %target, "Proxying request");
        let upstream = self
            .client
            .request(parts.method, &target)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        if self.rewrite_location {
            self.rewrite_location_header(&mut response_headers);
        }

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    fn rewrite_location_header(&self, headers: &mut HeaderMap) {
        let rewritten = headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| self.rewrite_location(location))
            .and_then(|location| HeaderValue::from_str(&location).ok());
        if let Some(value) = rewritten {
            headers.insert(header::LOCATION, value);
        }
    }

    /// External form of `location` if it points under the upstream base URL.
    #[must_use]
    pub fn rewrite_location(&self, location: &str) -> Option<String> {
        let rest = location.strip_prefix(&self.upstream_base)?;
        if rest.is_empty() || rest.starts_with(['/', '?', '#']) {
            Some(format!("{}{rest}", self.external_base))
        } else {
            None
        }
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn add_forwarding_headers(
    headers: &mut HeaderMap,
    inbound_host: Option<HeaderValue>,
    peer: Option<SocketAddr>,
) {
    // TLS terminates in front of the gateway, if anywhere
    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = inbound_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }

    if let Some(peer) = peer {
        let ip = peer.ip().to_string();
        let prior: Vec<&str> = headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let chain = if prior.is_empty() {
            ip
        } else {
            format!("{}, {ip}", prior.join(", "))
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
}
