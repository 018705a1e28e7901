//! Metabase adapter
//!
//! Admin calls authenticate with the `X-Metabase-Session` header. End users
//! are logged in by setting a one-time password and posting it to
//! `/api/session`, whose `Set-Cookie` (`metabase.SESSION`) goes to the browser.

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
use crate::config::MetabaseConfig;

const SESSION_HEADER: &str = "X-Metabase-Session";

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MetabaseUser {
    id: i64,
    email: String,
    #[serde(default = "active_by_default")]
    is_active: bool,
}

fn active_by_default() -> bool {
    true
}

/// `GET /api/user` is paginated (`{"data": [...]}`) in current releases and a
/// bare array in older ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserListing {
    Paged { data: Vec<MetabaseUser> },
    Plain(Vec<MetabaseUser>),
}

impl UserListing {
    fn into_users(self) -> Vec<MetabaseUser> {
        match self {
            Self::Paged { data } => data,
            Self::Plain(users) => users,
        }
    }
}

/// Metabase [`Backend`]
pub struct MetabaseBackend {
    admin: AdminClient,
    session_url: Url,
}

impl MetabaseBackend {
    /// Create the adapter. No network traffic until the first login.
    pub fn new(http: Client, base: Url, config: &MetabaseConfig) -> Result<Self, UpstreamError> {
        let session_url = endpoint(&base, &["api", "session"])?;

        let login_http = http.clone();
        let login_url = session_url.clone();
        let admin_email = config.admin_email.clone();
        let admin_password = config.admin_password.clone();

        let admin = AdminClient::new(http, base, SESSION_HEADER, config.admin_session_ttl, move || {
            let http = login_http.clone();
            let url = login_url.clone();
            let email = admin_email.clone();
            let password = admin_password.clone();
            async move {
                let (id, _) = open_session(&http, url, &email, &password).await?;
                info!(backend = "metabase", "Admin session established");
                Ok::<_, UpstreamError>(id)
            }
        });

        Ok(Self { admin, session_url })
    }

    async fn find_user(&self, email: &str) -> Result<Option<MetabaseUser>, UpstreamError> {
        let url = self.admin.url(&["api", "user"])?;
        let listing: UserListing = self
            .admin
            .send_json(Method::GET, &url, &[("status", "all")], None, "list users")
            .await?;

        let wanted = email.trim();
        Ok(listing
            .into_users()
            .into_iter()
            .find(|u| u.email.trim().eq_ignore_ascii_case(wanted)))
    }

    async fn create_user(&self, user: &UserData) -> Result<MetabaseUser, UpstreamError> {
        let url = self.admin.url(&["api", "user"])?;
        let body = json!({
            "email": user.email,
            "first_name": user.first_name,
            "last_name": user.last_name,
            "password": generate_password(PASSWORD_LEN),
        });
        self.admin
            .send_json(Method::POST, &url, &[], Some(&body), "create user")
            .await
    }

    async fn update_user(&self, id: i64, user: &UserData) -> Result<(), UpstreamError> {
        let url = self.admin.url(&["api", "user", id.to_string().as_str()])?;
        let body = json!({
            "email": user.email,
            "first_name": user.first_name,
            "last_name": user.last_name,
        });
        self.admin
            .send(Method::PUT, &url, &[], Some(&body), "update user")
            .await?;
        Ok(())
    }

    async fn reactivate_user(&self, id: i64) -> Result<(), UpstreamError> {
        let url = self.admin.url(&["api", "user", id.to_string().as_str(), "reactivate"])?;
        self.admin
            .send(Method::PUT, &url, &[], None, "reactivate user")
            .await?;
        Ok(())
    }

    async fn set_password(&self, id: i64, password: &str) -> Result<(), UpstreamError> {
        let url = self.admin.url(&["api", "user", id.to_string().as_str(), "password"])?;
        let body = json!({ "password": password });
        self.admin
            .send(Method::PUT, &url, &[], Some(&body), "set password")
            .await?;
        Ok(())
    }
}

/// `POST /api/session`; returns the session id and the raw `Set-Cookie` values.
async fn open_session(
    http: &Client,
    url: Url,
    username: &str,
    password: &str,
) -> Result<(String, Vec<String>), UpstreamError> {
    let resp = http
        .post(url)
        .json(&json!({ "username": username, "password": password }))
        .send()
        .await?;
    let resp = check_status(resp, "session login").await?;
    let cookies = set_cookie_values(&resp);
    let session: SessionResponse = resp.json().await?;
    if session.id.is_empty() {
        return Err(UpstreamError::Invalid("empty session id".into()));
    }
    Ok((session.id, cookies))
}

#[async_trait]
impl Backend for MetabaseBackend {
    fn name(&self) -> &'static str {
        "metabase"
    }

    async fn provision_user(&self, user: &UserData) -> Result<String, BackendError> {
        let existing = self.find_user(&user.email).await.map_err(|e| {
            warn!(backend = "metabase", error = %e, "User lookup failed");
            BackendError::ProvisionFailed
        })?;

        let account = if let Some(account) = existing {
            account
        } else {
            info!(backend = "metabase", email = %user.email, "Creating user");
            self.create_user(user).await.map_err(|e| {
                warn!(backend = "metabase", error = %e, "User creation failed");
                BackendError::ProvisionFailed
            })?
        };

        // Profile sync and reactivation must not block a login
        if let Err(e) = self.update_user(account.id, user).await {
            warn!(backend = "metabase", user_id = account.id, error = %e, "Profile sync failed");
        }
        if !account.is_active {
            match self.reactivate_user(account.id).await {
                Ok(()) => info!(backend = "metabase", user_id = account.id, "Reactivated user"),
                Err(e) => {
                    warn!(backend = "metabase", user_id = account.id, error = %e, "Reactivation failed");
                }
            }
        }

        debug!(backend = "metabase", user_id = account.id, "User provisioned");
        Ok(account.id.to_string())
    }

    async fn login(&self, user_id: &str, user: &UserData) -> Result<Vec<String>, BackendError> {
        let id: i64 = user_id.parse().map_err(|_| {
            warn!(backend = "metabase", user_id, "Non-numeric user id");
            BackendError::LoginFailed
        })?;

        let password = generate_password(PASSWORD_LEN);
        self.set_password(id, &password).await.map_err(|e| {
            warn!(backend = "metabase", user_id = id, error = %e, "Setting one-time password failed");
            BackendError::LoginFailed
        })?;

        let (_, cookies) = open_session(self.admin.http(), self.session_url.clone(), &user.email, &password)
            .await
            .map_err(|e| {
                warn!(backend = "metabase", user_id = id, error = %e, "User login failed");
                BackendError::LoginFailed
            })?;

        if cookies.is_empty() {
            warn!(backend = "metabase", user_id = id, "User login returned no session cookie");
            return Err(BackendError::LoginFailed);
        }
        Ok(cookies)
    }
}
