//! End-to-end login flow tests
//!
//! Drives the router with `oneshot` against a wiremock identity provider and a
//! recording backend:
//! - start redirect and destination handling
//! - successful callback with cookie rewriting
//! - state tampering, allow-list and backend rejections
//! - name claim mapping
//! - logout and health probe

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{
    EXTERNAL_URL, MockIdp, RecordingBackend, body_text, config, encode_query, get, location,
    query_param, set_cookies,
};
use oidc_gateway::backend::UserData;
use oidc_gateway::config::Config;
use oidc_gateway::gateway::Gateway;

const UPSTREAM: &str = "http://127.0.0.1:9";
const SESSION_COOKIE: &str = "metabase.SESSION=abc123; Domain=metabase.internal; Path=/; HttpOnly";

async fn app_with(config: Config, backend: Arc<RecordingBackend>) -> axum::Router {
    Gateway::with_backend(config, backend).await.unwrap().router()
}

/// Start a login and return the signed state the provider would echo back.
async fn start_login(app: &axum::Router, query: &str) -> String {
    let response = get(app, &format!("/openid/{query}"), &[]).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    query_param(&location(&response), "state").unwrap()
}

fn callback_uri(state: &str, code: &str) -> String {
    format!("/openid/callback?{}", encode_query(&[("state", state), ("code", code)]))
}

/// Scenario A: start, callback, provision, cookies, redirect to `/`
#[tokio::test]
async fn test_successful_login_sets_rewritten_cookie() {
    // GIVEN: a provider issuing a token for a@b.com
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&[SESSION_COOKIE]));
    let app = app_with(config(&idp.issuer(), UPSTREAM), backend.clone()).await;
    idp.expect_code(
        "good-code",
        idp.claims(json!({ "email": "a@b.com", "given_name": "A", "family_name": "B" })),
    )
    .await;

    // WHEN: the browser starts a login without destination and comes back
    let start = get(&app, "/openid/", &[]).await;
    assert_eq!(start.status(), StatusCode::FOUND);
    let auth_url = location(&start);
    assert!(auth_url.starts_with(&format!("{}/authorize?", idp.issuer())));
    assert_eq!(query_param(&auth_url, "response_type").as_deref(), Some("code"));
    assert_eq!(query_param(&auth_url, "client_id").as_deref(), Some(common::CLIENT_ID));
    assert_eq!(
        query_param(&auth_url, "redirect_uri"),
        Some(format!("{EXTERNAL_URL}/openid/callback"))
    );
    assert_eq!(query_param(&auth_url, "scope").as_deref(), Some("openid email profile"));
    let state = query_param(&auth_url, "state").unwrap();

    let response = get(
        &app,
        &callback_uri(&state, "good-code"),
        &[("host", "app.example.com:8443")],
    )
    .await;

    // THEN: redirected to / with the upstream cookie pinned to the public host
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");
    assert_eq!(
        set_cookies(&response),
        vec!["metabase.SESSION=abc123; Domain=app.example.com; Path=/; HttpOnly; Secure; SameSite=Lax"]
    );
    assert_eq!(
        backend.provisioned(),
        vec![UserData {
            email: "a@b.com".into(),
            first_name: "A".into(),
            last_name: "B".into(),
            subject: "subject-123".into(),
        }]
    );
    assert_eq!(backend.logins.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// `rd` wins over `Referer`; foreign destinations collapse to `/`
#[tokio::test]
async fn test_destination_survives_the_round_trip() {
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&["sid=1; Path=/"]));
    let app = app_with(config(&idp.issuer(), UPSTREAM), backend).await;
    idp.expect_code("c1", idp.claims(json!({ "email": "a@b.com" }))).await;

    let state = start_login(&app, "?rd=%2Fdashboard%2F7%3Ftab%3D2").await;
    let response = get(&app, &callback_uri(&state, "c1"), &[]).await;
    assert_eq!(location(&response), "/dashboard/7?tab=2");

    let response = get(&app, "/openid/", &[("referer", "https://app.example.com/question/3")]).await;
    let state = query_param(&location(&response), "state").unwrap();
    let response = get(&app, &callback_uri(&state, "c1"), &[]).await;
    assert_eq!(location(&response), "https://app.example.com/question/3");

    let state = start_login(&app, "?rd=https%3A%2F%2Fevil.example%2F").await;
    let response = get(&app, &callback_uri(&state, "c1"), &[]).await;
    assert_eq!(location(&response), "/");
}

/// Without a `Host` header the cookie domain comes from `external_url`
#[tokio::test]
async fn test_cookie_domain_falls_back_to_external_url() {
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&["refresh_token=r; Domain=nocodb; Path=/"]));
    let mut cfg = config(&idp.issuer(), UPSTREAM);
    cfg.cookies.secure = false;
    let app = app_with(cfg, backend).await;
    idp.expect_code("c2", idp.claims(json!({ "email": "a@b.com" }))).await;

    let state = start_login(&app, "").await;
    let response = get(&app, &callback_uri(&state, "c2"), &[]).await;

    assert_eq!(
        set_cookies(&response),
        vec!["refresh_token=r; Domain=app.example.com; Path=/; SameSite=Lax"]
    );
}

/// Scenario B: tampered state is rejected before any network call
#[tokio::test]
async fn test_tampered_state_is_rejected() {
    // GIVEN: a valid state whose payload segment was altered
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&[SESSION_COOKIE]));
    let app = app_with(config(&idp.issuer(), UPSTREAM), backend.clone()).await;
    idp.expect_code("good-code", idp.claims(json!({ "email": "a@b.com" }))).await;

    let state = start_login(&app, "?rd=%2Fhome").await;
    let (payload, signature) = state.split_once('.').unwrap();
    let forged_payload = format!("{}x", &payload[..payload.len() - 1]);
    let forged_payload = if forged_payload == payload {
        format!("{}y", &payload[..payload.len() - 1])
    } else {
        forged_payload
    };
    let forged = format!("{forged_payload}.{signature}");

    // WHEN: the callback arrives
    let response = get(&app, &callback_uri(&forged, "good-code"), &[]).await;

    // THEN: generic failure, provider and backend untouched
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookies(&response).is_empty());
    assert_eq!(body_text(response).await, "Authentication failed");
    assert_eq!(idp.token_requests().await, 0);
    assert_eq!(backend.calls(), 0);
}

/// Garbage and missing state never reach the provider
#[tokio::test]
async fn test_missing_or_garbage_state_is_rejected() {
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&[]));
    let app = app_with(config(&idp.issuer(), UPSTREAM), backend.clone()).await;

    for uri in [
        "/openid/callback?code=abc".to_string(),
        callback_uri("not-a-state", "abc"),
        callback_uri("a.b.c", "abc"),
    ] {
        let response = get(&app, &uri, &[]).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
    }
    assert_eq!(idp.token_requests().await, 0);
    assert_eq!(backend.calls(), 0);
}

/// Scenario C: domain allow-list rejects before provisioning
#[tokio::test]
async fn test_domain_not_allowed_is_rejected_before_provisioning() {
    // GIVEN: only b.com may log in
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&[SESSION_COOKIE]));
    let mut cfg = config(&idp.issuer(), UPSTREAM);
    cfg.access.allowed_domains = vec!["b.com".into()];
    let app = app_with(cfg, backend.clone()).await;
    idp.expect_code("c3", idp.claims(json!({ "email": "x@c.com" }))).await;

    // WHEN: x@c.com completes the provider login
    let state = start_login(&app, "").await;
    let response = get(&app, &callback_uri(&state, "c3"), &[]).await;

    // THEN: rejected generically, backend never called
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_text(response).await, "Authentication failed");
    assert_eq!(idp.token_requests().await, 1);
    assert_eq!(backend.calls(), 0);
}

/// Email allow-list is exact and case-insensitive
#[tokio::test]
async fn test_email_allow_list() {
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&["sid=1"]));
    let mut cfg = config(&idp.issuer(), UPSTREAM);
    cfg.access.allowed_emails = vec!["Boss@B.com".into()];
    let app = app_with(cfg, backend.clone()).await;
    idp.expect_code("boss", idp.claims(json!({ "email": "boss@b.com" }))).await;
    idp.expect_code("intern", idp.claims(json!({ "email": "intern@b.com" }))).await;

    let state = start_login(&app, "").await;
    let response = get(&app, &callback_uri(&state, "intern"), &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(backend.calls(), 0);

    let response = get(&app, &callback_uri(&state, "boss"), &[]).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(backend.provisioned().len(), 1);
}

/// Scenario D: single-token name and absent names
#[tokio::test]
async fn test_name_claims_are_mapped() {
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&["sid=1"]));
    let app = app_with(config(&idp.issuer(), UPSTREAM), backend.clone()).await;
    idp.expect_code("madonna", idp.claims(json!({ "email": "m@b.com", "name": "Madonna" })))
        .await;
    idp.expect_code("anon", idp.claims(json!({ "email": "n@b.com" }))).await;
    idp.expect_code(
        "full",
        idp.claims(json!({ "email": "f@b.com", "name": "Jean Luc Picard" })),
    )
    .await;

    let state = start_login(&app, "").await;
    for code in ["madonna", "anon", "full"] {
        let response = get(&app, &callback_uri(&state, code), &[]).await;
        assert_eq!(response.status(), StatusCode::FOUND, "{code}");
    }

    let names: Vec<(String, String)> = backend
        .provisioned()
        .into_iter()
        .map(|u| (u.first_name, u.last_name))
        .collect();
    assert_eq!(
        names,
        vec![
            ("Madonna".to_string(), String::new()),
            ("User".to_string(), "OIDC".to_string()),
            ("Jean".to_string(), "Luc Picard".to_string()),
        ]
    );
}

/// A token without an email claim is rejected
#[tokio::test]
async fn test_token_without_email_is_rejected() {
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&["sid=1"]));
    let app = app_with(config(&idp.issuer(), UPSTREAM), backend.clone()).await;
    idp.expect_code("noemail", idp.claims(json!({ "name": "No Mail" }))).await;

    let state = start_login(&app, "").await;
    let response = get(&app, &callback_uri(&state, "noemail"), &[]).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(backend.calls(), 0);
}

/// Token for another client is rejected
#[tokio::test]
async fn test_token_for_other_audience_is_rejected() {
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&["sid=1"]));
    let app = app_with(config(&idp.issuer(), UPSTREAM), backend.clone()).await;
    idp.expect_code(
        "other",
        idp.claims(json!({ "email": "a@b.com", "aud": "another-client" })),
    )
    .await;

    let state = start_login(&app, "").await;
    let response = get(&app, &callback_uri(&state, "other"), &[]).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(backend.calls(), 0);
}

/// Backend login failure surfaces as the same generic failure
#[tokio::test]
async fn test_backend_failure_is_generic() {
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::failing_login());
    let app = app_with(config(&idp.issuer(), UPSTREAM), backend.clone()).await;
    idp.expect_code("c4", idp.claims(json!({ "email": "a@b.com" }))).await;

    let state = start_login(&app, "").await;
    let response = get(&app, &callback_uri(&state, "c4"), &[]).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookies(&response).is_empty());
    assert_eq!(body_text(response).await, "Authentication failed");
    assert_eq!(backend.provisioned().len(), 1);
}

/// Provider-side errors on the redirect are rejected without a token call
#[tokio::test]
async fn test_provider_error_on_callback() {
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::new(&[]));
    let app = app_with(config(&idp.issuer(), UPSTREAM), backend.clone()).await;

    let state = start_login(&app, "").await;
    let uri = format!(
        "/openid/callback?{}",
        encode_query(&[
            ("state", state.as_str()),
            ("error", "access_denied"),
            ("error_description", "User cancelled"),
        ])
    );
    let response = get(&app, &uri, &[]).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(idp.token_requests().await, 0);
    assert_eq!(backend.calls(), 0);
}

/// A callback chain outliving `server.request_timeout` ends in the generic 401
#[tokio::test]
async fn test_callback_timeout_is_generic_failure() {
    // GIVEN: a backend that stalls in provisioning past the request timeout
    let idp = MockIdp::start().await;
    let backend = Arc::new(RecordingBackend::slow_provisioning(Duration::from_secs(10)));
    let mut config = config(&idp.issuer(), UPSTREAM);
    config.server.request_timeout = Duration::from_millis(500);
    let app = app_with(config, backend.clone()).await;
    idp.expect_code("slow", idp.claims(json!({ "email": "a@b.com" }))).await;
    let state = start_login(&app, "").await;

    // WHEN: the provider redirects back
    let response = get(&app, &callback_uri(&state, "slow"), &[]).await;

    // THEN: the browser sees the generic failure and no session cookie
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookies(&response).is_empty());
    assert_eq!(body_text(response).await, "Authentication failed");
    assert_eq!(backend.provisioned().len(), 1);
    assert_eq!(backend.logins.load(std::sync::atomic::Ordering::SeqCst), 0);
}

/// Logout clears the session cookie and sends the browser home
#[tokio::test]
async fn test_logout_clears_cookie() {
    let idp = MockIdp::start().await;
    let mut cfg = config(&idp.issuer(), UPSTREAM);
    cfg.cookies.session_cookie_name = Some("metabase.SESSION".into());
    let app = app_with(cfg, Arc::new(RecordingBackend::new(&[]))).await;

    let response = get(&app, "/openid/logout", &[]).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");
    assert_eq!(
        set_cookies(&response),
        vec!["metabase.SESSION=; HttpOnly; Secure; Path=/; Max-Age=0"]
    );
}

/// Health probe answers without touching anything else
#[tokio::test]
async fn test_healthz() {
    let idp = MockIdp::start().await;
    let app = app_with(config(&idp.issuer(), UPSTREAM), Arc::new(RecordingBackend::new(&[]))).await;

    let response = get(&app, "/healthz", &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
}

/// A custom mount path moves every auth route
#[tokio::test]
async fn test_custom_mount_path() {
    let idp = MockIdp::start().await;
    let mut cfg = config(&idp.issuer(), UPSTREAM);
    cfg.oidc.path = "sso".into();
    let app = app_with(cfg, Arc::new(RecordingBackend::new(&[]))).await;

    let response = get(&app, "/sso/", &[]).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        query_param(&location(&response), "redirect_uri"),
        Some(format!("{EXTERNAL_URL}/sso/callback"))
    );

    let response = get(&app, "/sso", &[]).await;
    assert_eq!(response.status(), StatusCode::FOUND);
}
