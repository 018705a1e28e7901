//! HTTP router and handlers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::warn;

use super::proxy::ProxyMediator;
use crate::oidc::{AuthError, CallbackParams, OidcGateway};

/// Shared application state
pub struct AppState {
    /// Login flow
    pub oidc: OidcGateway,
    /// Reverse proxy for everything else
    pub proxy: ProxyMediator,
    /// Upper bound for the whole callback chain
    pub callback_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct StartParams {
    rd: Option<String>,
}

/// Create the router. `mount` is the normalized auth path, e.g. `/openid/`.
pub fn create_router(state: Arc<AppState>, mount: &str) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(health_handler))
        .route(mount, get(start_handler))
        .route(&format!("{mount}callback"), get(callback_handler))
        .route(&format!("{mount}logout"), get(logout_handler));

    let bare = mount.trim_end_matches('/');
    if !bare.is_empty() {
        router = router.route(bare, get(start_handler));
    }

    router
        .fallback(proxy_handler)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /healthz
async fn health_handler() -> &'static str {
    "ok"
}

/// GET {mount} - redirect to the identity provider
async fn start_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StartParams>,
    headers: HeaderMap,
) -> Response {
    let referer = headers.get(header::REFERER).and_then(|v| v.to_str().ok());
    let location = state.oidc.start_auth(params.rd.as_deref(), referer);
    found(&location)
}

/// GET {mount}callback - complete the login
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Response {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());

    let outcome = match tokio::time::timeout(
        state.callback_timeout,
        state.oidc.handle_callback(&params, host),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(AuthError::Timeout(state.callback_timeout)),
    };

    match outcome {
        Ok(outcome) => {
            let mut response = found(&outcome.redirect);
            append_set_cookies(&mut response, &outcome.set_cookies);
            response
        }
        Err(e) => {
            warn!(reason = e.kind(), error = %e, "Authentication failed");
            e.into_response()
        }
    }
}

/// GET {mount}logout - drop the upstream session cookie
async fn logout_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut response = found("/");
    append_set_cookies(&mut response, &[state.oidc.logout_cookie()]);
    response
}

/// Everything else goes upstream
async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match state.proxy.forward(request, peer).await {
        Ok(response) => response,
        Err(e) => {
            warn!(method = %method, path = %path, error = %e, "Proxy request failed");
            e.into_response()
        }
    }
}

/// 302 with `Cache-Control: no-store`. An unrepresentable target falls back to `/`.
fn found(location: &str) -> Response {
    let location = HeaderValue::from_str(location).unwrap_or_else(|_| HeaderValue::from_static("/"));
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, location),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
    )
        .into_response()
}

fn append_set_cookies(response: &mut Response, cookies: &[String]) {
    for cookie in cookies {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(_) => warn!("Dropping Set-Cookie value with invalid characters"),
        }
    }
}
