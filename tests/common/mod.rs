//! Shared fixtures: a mock identity provider, a recording backend and
//! request helpers.

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, header};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oidc_gateway::backend::{Backend, BackendError, UserData};
use oidc_gateway::config::Config;

/// RSA key the mock provider signs ID tokens with
pub const IDP_KEY_PEM: &str = include_str!("../fixtures/idp_test_key.pem");
/// Public modulus of [`IDP_KEY_PEM`] (base64url)
pub const IDP_KEY_N: &str = "9HMr2FlL9mZ8qT35FkcF8KhecH7KXhbfCnVf2S2Cv1X5B4T_JMfMKa8lTF4_kvyqtnHZme05pSvfB22EW23-hUVqX4q-IIAelDkzGFygJG1PqatXqv8KuDxkZlQ0f58hrTpIARs4wULkaTxdOfuDDOZV8j0rcpt47wizxgVypiiXsHlH6eALk2n6hQRKhnuTJrdjxGELMEICcmYvwje1au5l8U2Xp9j7Ik3lsNh9b3E-kJ3ey4tfCaZuMu9klS-LMun0Dkbzsk8gd8OK0zzBBa4jexp_2ZhXpd09NMf9wtK3scbYJ58YIehuRJzGH-IB4sIpJ5nZNoacMYCSrNMAkw";
pub const KID: &str = "test-key-1";
pub const CLIENT_ID: &str = "oidc-gateway";
pub const EXTERNAL_URL: &str = "https://app.example.com";

/// wiremock-backed OpenID provider
pub struct MockIdp {
    pub server: MockServer,
}

impl MockIdp {
    /// Start a provider serving discovery and JWKS.
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": &base,
                "authorization_endpoint": format!("{base}/authorize"),
                "token_endpoint": format!("{base}/token"),
                "jwks_uri": format!("{base}/jwks"),
                "response_types_supported": ["code"],
                "id_token_signing_alg_values_supported": ["RS256"],
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{
                    "kty": "RSA",
                    "use": "sig",
                    "alg": "RS256",
                    "kid": KID,
                    "n": IDP_KEY_N,
                    "e": "AQAB",
                }]
            })))
            .mount(&server)
            .await;

        Self { server }
    }

    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    /// Standard claims for this provider, overlaid with `extra`.
    pub fn claims(&self, extra: Value) -> Value {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let mut claims = json!({
            "iss": self.issuer(),
            "aud": CLIENT_ID,
            "sub": "subject-123",
            "iat": now,
            "exp": now + 300,
        });
        if let (Some(base), Value::Object(extra)) = (claims.as_object_mut(), extra) {
            base.extend(extra);
        }
        claims
    }

    /// Make the token endpoint answer `code` with an ID token carrying `claims`.
    pub async fn expect_code(&self, code: &str, claims: Value) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains(format!("code={code}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access",
                "token_type": "Bearer",
                "expires_in": 300,
                "id_token": sign_id_token(&claims),
            })))
            .mount(&self.server)
            .await;
    }

    /// Number of token endpoint calls received so far.
    pub async fn token_requests(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/token")
            .count()
    }
}

/// RS256 ID token signed with the test key.
pub fn sign_id_token(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(IDP_KEY_PEM.as_bytes()).unwrap();
    encode(&header, claims, &key).unwrap()
}

/// Backend that records calls and returns a fixed session cookie.
pub struct RecordingBackend {
    pub provisioned: Mutex<Vec<UserData>>,
    pub logins: AtomicUsize,
    pub cookies: Vec<String>,
    pub fail_login: bool,
    pub provision_delay: Option<Duration>,
}

impl RecordingBackend {
    pub fn new(cookies: &[&str]) -> Self {
        Self {
            provisioned: Mutex::new(Vec::new()),
            logins: AtomicUsize::new(0),
            cookies: cookies.iter().map(|c| (*c).to_string()).collect(),
            fail_login: false,
            provision_delay: None,
        }
    }

    /// Provisioning hangs for `delay` after recording the user.
    pub fn slow_provisioning(delay: Duration) -> Self {
        Self {
            provision_delay: Some(delay),
            ..Self::new(&["slow=1; Path=/"])
        }
    }

    pub fn failing_login() -> Self {
        Self {
            fail_login: true,
            ..Self::new(&[])
        }
    }

    pub fn provisioned(&self) -> Vec<UserData> {
        self.provisioned.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.provisioned.lock().unwrap().len() + self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn provision_user(&self, user: &UserData) -> Result<String, BackendError> {
        self.provisioned.lock().unwrap().push(user.clone());
        if let Some(delay) = self.provision_delay {
            tokio::time::sleep(delay).await;
        }
        Ok("42".to_string())
    }

    async fn login(&self, user_id: &str, _user: &UserData) -> Result<Vec<String>, BackendError> {
        assert_eq!(user_id, "42");
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.fail_login {
            return Err(BackendError::LoginFailed);
        }
        Ok(self.cookies.clone())
    }
}

/// Minimal valid configuration pointing at `issuer` and `upstream`.
pub fn config(issuer: &str, upstream: &str) -> Config {
    let mut config = Config::default();
    config.external_url = EXTERNAL_URL.to_string();
    config.upstream.url = upstream.to_string();
    config.oidc.issuer = issuer.to_string();
    config.oidc.client_id = CLIENT_ID.to_string();
    config.oidc.client_secret = "client-secret".to_string();
    config.oidc.scopes = vec!["openid".into(), "email".into(), "profile".into()];
    config.state.secret = "integration-state-secret".to_string();
    config
}

/// GET `uri` through the router with extra headers.
pub async fn get(app: &Router, uri: &str, headers: &[(&str, &str)]) -> Response<Body> {
    let mut request = Request::builder().method("GET").uri(uri);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    app.clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub fn location(response: &Response<Body>) -> String {
    response.headers()[header::LOCATION].to_str().unwrap().to_string()
}

pub fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

pub fn query_param(url: &str, key: &str) -> Option<String> {
    Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Percent-encode a query value.
pub fn encode_query(pairs: &[(&str, &str)]) -> String {
    serde_urlencoded::to_string(pairs).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
