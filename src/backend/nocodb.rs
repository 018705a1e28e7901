//! `NocoDB` adapter
//!
//! Admin calls authenticate with the `xc-auth` token header. `NocoDB` has no
//! admin "set password" endpoint, so login goes through the password reset
//! flow: generate a reset token, redeem it with a one-time password, then sign
//! in as the user. The sign-in response sets the `refresh_token` cookie.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::admin::{check_status, endpoint};
use super::{
    AdminClient, Backend, BackendError, PASSWORD_LEN, UpstreamError, UserData, generate_password,
    set_cookie_values,
};
use crate::config::NocodbConfig;

const TOKEN_HEADER: &str = "xc-auth";

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct NocodbUser {
    id: String,
    email: String,
}

#[derive(Debug, Deserialize)]
struct UserList {
    #[serde(default)]
    list: Vec<NocodbUser>,
}

#[derive(Debug, Deserialize)]
struct ResetToken {
    reset_password_token: String,
}

/// `NocoDB` [`Backend`]
pub struct NocodbBackend {
    admin: AdminClient,
    signin_url: Url,
    default_role: String,
}

impl NocodbBackend {
    /// Create the adapter. No network traffic until the first login.
    pub fn new(http: Client, base: Url, config: &NocodbConfig) -> Result<Self, UpstreamError> {
        let signin_url = endpoint(&base, &["api", "v1", "auth", "user", "signin"])?;

        let login_http = http.clone();
        let login_url = signin_url.clone();
        let admin_email = config.admin_email.clone();
        let admin_password = config.admin_password.clone();

        let admin = AdminClient::new(http, base, TOKEN_HEADER, config.admin_session_ttl, move || {
            let http = login_http.clone();
            let url = login_url.clone();
            let email = admin_email.clone();
            let password = admin_password.clone();
            async move {
                let (token, _) = sign_in(&http, url, &email, &password).await?;
                info!(backend = "nocodb", "Admin token obtained");
                Ok::<_, UpstreamError>(token)
            }
        });

        Ok(Self {
            admin,
            signin_url,
            default_role: config.default_role.clone(),
        })
    }

    async fn find_user(&self, email: &str) -> Result<Option<NocodbUser>, UpstreamError> {
        let url = self.admin.url(&["api", "v1", "users"])?;
        let wanted = email.trim();
        let users: UserList = self
            .admin
            .send_json(Method::GET, &url, &[("query", wanted)], None, "list users")
            .await?;

        Ok(users
            .list
            .into_iter()
            .find(|u| u.email.trim().eq_ignore_ascii_case(wanted)))
    }

    async fn create_user(&self, user: &UserData) -> Result<NocodbUser, UpstreamError> {
        let url = self.admin.url(&["api", "v1", "users"])?;
        let body = json!({
            "email": user.email,
            "firstname": user.first_name,
            "lastname": user.last_name,
            "password": generate_password(PASSWORD_LEN),
            "roles": self.default_role,
        });
        self.admin
            .send_json(Method::POST, &url, &[], Some(&body), "create user")
            .await
    }

    async fn reset_password(&self, user_id: &str, password: &str) -> Result<(), UpstreamError> {
        let url = self
            .admin
            .url(&["api", "v1", "users", user_id, "generate-reset-url"])?;
        let token: ResetToken = self
            .admin
            .send_json(Method::POST, &url, &[], None, "generate reset url")
            .await?;
        if token.reset_password_token.is_empty() {
            return Err(UpstreamError::Invalid("empty reset token".into()));
        }

        let url = self.admin.url(&[
            "api",
            "v1",
            "auth",
            "password",
            "reset",
            token.reset_password_token.as_str(),
        ])?;
        let body = json!({ "password": password });
        self.admin
            .send(Method::POST, &url, &[], Some(&body), "redeem reset token")
            .await?;
        Ok(())
    }
}

/// `POST /api/v1/auth/user/signin`; returns the token and raw `Set-Cookie` values.
async fn sign_in(
    http: &Client,
    url: Url,
    email: &str,
    password: &str,
) -> Result<(String, Vec<String>), UpstreamError> {
    let resp = http
        .post(url)
        .json(&json!({ "email": email, "password": password }))
        .send()
        .await?;
    let resp = check_status(resp, "sign in").await?;
    let cookies = set_cookie_values(&resp);
    let auth: AuthResponse = resp.json().await?;
    if auth.token.is_empty() {
        return Err(UpstreamError::Invalid("empty auth token".into()));
    }
    Ok((auth.token, cookies))
}

#[async_trait]
impl Backend for NocodbBackend {
    fn name(&self) -> &'static str {
        "nocodb"
    }

    async fn provision_user(&self, user: &UserData) -> Result<String, BackendError> {
        let existing = self.find_user(&user.email).await.map_err(|e| {
            warn!(backend = "nocodb", error = %e, "User lookup failed");
            BackendError::ProvisionFailed
        })?;

        let account = if let Some(account) = existing {
            account
        } else {
            info!(backend = "nocodb", email = %user.email, "Creating user");
            self.create_user(user).await.map_err(|e| {
                warn!(backend = "nocodb", error = %e, "User creation failed");
                BackendError::ProvisionFailed
            })?
        };

        debug!(backend = "nocodb", user_id = %account.id, "User provisioned");
        Ok(account.id)
    }

    async fn login(&self, user_id: &str, user: &UserData) -> Result<Vec<String>, BackendError> {
        let password = generate_password(PASSWORD_LEN);
        self.reset_password(user_id, &password).await.map_err(|e| {
            warn!(backend = "nocodb", user_id, error = %e, "Password reset failed");
            BackendError::LoginFailed
        })?;

        let (_, cookies) = sign_in(self.admin.http(), self.signin_url.clone(), &user.email, &password)
            .await
            .map_err(|e| {
                warn!(backend = "nocodb", user_id, error = %e, "User sign-in failed");
                BackendError::LoginFailed
            })?;

        if cookies.is_empty() {
            warn!(backend = "nocodb", user_id, "User sign-in returned no session cookie");
            return Err(BackendError::LoginFailed);
        }
        Ok(cookies)
    }
}
