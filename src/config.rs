//! Configuration management

use std::{collections::HashSet, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Prefix for environment overrides (`OIDC_GATEWAY_OIDC__CLIENT_ID=...`).
pub const ENV_PREFIX: &str = "OIDC_GATEWAY_";

const REDACTED: &str = "***";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` secrets.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Listener configuration
    pub server: ServerConfig,
    /// Externally visible base URL (what browsers type)
    pub external_url: String,
    /// Proxied application
    pub upstream: UpstreamConfig,
    /// OpenID Connect relying-party settings
    pub oidc: OidcConfig,
    /// `state` token signing
    pub state: StateConfig,
    /// Session cookie handling
    pub cookies: CookieConfig,
    /// Email allow-lists
    pub access: AccessConfig,
    /// Upstream product adapter
    pub backend: Option<BackendConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Upper bound for the whole login callback chain
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Upstream application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Internal base URL of the application
    pub url: String,
    /// Timeout for admin API calls made by the backend adapter
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Rewrite `Location` headers that point at the internal URL
    pub rewrite_location: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(60),
            rewrite_location: true,
        }
    }
}

/// How the client authenticates at the token endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenAuthMethod {
    /// HTTP Basic with client id and secret
    #[default]
    ClientSecretBasic,
    /// Client id and secret in the form body
    ClientSecretPost,
}

/// OpenID Connect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Issuer URL used for discovery and `iss` validation
    pub issuer: String,
    /// Registered client id
    pub client_id: String,
    /// Client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Mount path for the login routes
    pub path: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Optional `prompt` authorization parameter (e.g. `login`, `consent`)
    pub prompt: Option<String>,
    /// Token endpoint client authentication
    pub token_auth_method: TokenAuthMethod,
    /// First name used when the token carries no name claims
    pub default_first_name: String,
    /// Last name used when the token carries no name claims
    pub default_last_name: String,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            path: "/openid/".to_string(),
            scopes: Vec::new(),
            prompt: None,
            token_auth_method: TokenAuthMethod::default(),
            default_first_name: "User".to_string(),
            default_last_name: "OIDC".to_string(),
        }
    }
}

/// `state` signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// HMAC key (supports `env:VAR_NAME`)
    pub secret: String,
    /// Maximum age of an accepted state token
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            ttl: Duration::from_secs(600),
        }
    }
}

/// Cookie configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Force the `Secure` attribute
    pub secure: bool,
    /// Session cookie cleared on logout (defaults to the backend's own)
    pub session_cookie_name: Option<String>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            secure: true,
            session_cookie_name: None,
        }
    }
}

/// Static allow-lists. Empty lists allow everyone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Permitted email domains
    pub allowed_domains: Vec<String>,
    /// Permitted email addresses
    pub allowed_emails: Vec<String>,
}

impl AccessConfig {
    /// Lower-cased domain set.
    pub fn domain_set(&self) -> HashSet<String> {
        lower_set(&self.allowed_domains)
    }

    /// Lower-cased email set.
    pub fn email_set(&self) -> HashSet<String> {
        lower_set(&self.allowed_emails)
    }
}

fn lower_set(items: &[String]) -> HashSet<String> {
    items
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Backend adapter selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Metabase
    Metabase(MetabaseConfig),
    /// `NocoDB`
    Nocodb(NocodbConfig),
}

/// Metabase admin credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetabaseConfig {
    /// Admin account email
    pub admin_email: String,
    /// Admin account password (supports `env:VAR_NAME`)
    pub admin_password: String,
    /// Soft lifetime of the cached admin session
    #[serde(default = "default_admin_session_ttl", with = "humantime_serde")]
    pub admin_session_ttl: Duration,
}

/// `NocoDB` admin credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NocodbConfig {
    /// Admin account email
    pub admin_email: String,
    /// Admin account password (supports `env:VAR_NAME`)
    pub admin_password: String,
    /// Soft lifetime of the cached admin token
    #[serde(default = "default_admin_session_ttl", with = "humantime_serde")]
    pub admin_session_ttl: Duration,
    /// Role assigned to newly created users
    #[serde(default = "default_nocodb_role")]
    pub default_role: String,
}

fn default_admin_session_ttl() -> Duration {
    Duration::from_secs(8 * 60 * 60)
}

fn default_nocodb_role() -> String {
    "org-level-creator".to_string()
}

impl BackendConfig {
    /// Adapter name as used in logs and config
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metabase(_) => "metabase",
            Self::Nocodb(_) => "nocodb",
        }
    }

    /// The product's own session cookie name
    pub fn default_session_cookie(&self) -> &'static str {
        match self {
            Self::Metabase(_) => "metabase.SESSION",
            Self::Nocodb(_) => "refresh_token",
        }
    }

    fn admin_credentials(&self) -> (&str, &str) {
        match self {
            Self::Metabase(c) => (&c.admin_email, &c.admin_password),
            Self::Nocodb(c) => (&c.admin_email, &c.admin_password),
        }
    }

    fn admin_password_mut(&mut self) -> &mut String {
        match self {
            Self::Metabase(c) => &mut c.admin_password,
            Self::Nocodb(c) => &mut c.admin_password,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or references an unset `env:` variable.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files go into the process environment before `env:` resolution
        config.load_env_files();
        config.resolve_secrets()?;
        config.normalize();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Replace `env:VAR_NAME` references in secret-bearing fields
    fn resolve_secrets(&mut self) -> Result<()> {
        resolve_secret(&mut self.oidc.client_secret, "oidc.client_secret")?;
        resolve_secret(&mut self.state.secret, "state.secret")?;
        if let Some(backend) = &mut self.backend {
            resolve_secret(backend.admin_password_mut(), "backend.admin_password")?;
        }
        Ok(())
    }

    /// Apply derived defaults: mount path slashes and default scopes
    fn normalize(&mut self) {
        self.oidc.path = normalize_mount_path(&self.oidc.path);
        self.oidc.scopes.retain(|s| !s.trim().is_empty());
        if self.oidc.scopes.is_empty() {
            self.oidc.scopes = ["openid", "email", "profile"]
                .into_iter()
                .map(String::from)
                .collect();
        }
        self.external_url = self.external_url.trim_end_matches('/').to_string();
    }

    /// Check that every required value is present and well formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        require_url(&self.external_url, "external_url")?;
        require_url(&self.upstream.url, "upstream.url")?;
        require_url(&self.oidc.issuer, "oidc.issuer")?;
        require(&self.oidc.client_id, "oidc.client_id")?;
        require(&self.oidc.client_secret, "oidc.client_secret")?;
        require(&self.state.secret, "state.secret")?;

        if self.state.ttl.is_zero() {
            return Err(Error::Config("state.ttl must be greater than zero".into()));
        }

        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| Error::Config("backend is required (type: metabase | nocodb)".into()))?;
        let (email, password) = backend.admin_credentials();
        require(email, "backend.admin_email")?;
        require(password, "backend.admin_password")?;

        Ok(())
    }

    /// Callback URL registered at the identity provider
    pub fn redirect_uri(&self) -> String {
        format!(
            "{}{}callback",
            self.external_url.trim_end_matches('/'),
            normalize_mount_path(&self.oidc.path)
        )
    }

    /// Session cookie cleared on logout
    pub fn session_cookie_name(&self) -> String {
        self.cookies
            .session_cookie_name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| {
                self.backend
                    .as_ref()
                    .map(|b| b.default_session_cookie().to_string())
            })
            .unwrap_or_else(|| "session".to_string())
    }

    /// Copy with every secret replaced, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        redact(&mut copy.oidc.client_secret);
        redact(&mut copy.state.secret);
        if let Some(backend) = &mut copy.backend {
            redact(backend.admin_password_mut());
        }
        copy
    }
}

/// Ensure a mount path has exactly one leading and one trailing slash.
pub fn normalize_mount_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

fn resolve_secret(value: &mut String, field: &str) -> Result<()> {
    if let Some(var_name) = value.strip_prefix("env:") {
        let resolved = env::var(var_name).map_err(|_| {
            Error::Config(format!(
                "{field} references environment variable {var_name}, which is not set"
            ))
        })?;
        *value = resolved;
    }
    Ok(())
}

fn redact(value: &mut String) {
    if !value.is_empty() {
        *value = REDACTED.to_string();
    }
}

fn require(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{field} is required")));
    }
    Ok(())
}

fn require_url(value: &str, field: &str) -> Result<()> {
    require(value, field)?;
    let url = Url::parse(value).map_err(|e| Error::Config(format!("{field} is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!("{field} must be an http(s) URL")));
    }
    Ok(())
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Deserialize human-readable duration (e.g., "100ms", "30s", "5m", "8h", or bare seconds)
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let number = |n: &str| {
            n.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration {s:?}: {e}"))
        };

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(number(mins)?, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(number(hours)?, 3600)
        } else {
            // Assume seconds
            number(s).map(Duration::from_secs)
        }
    }

    fn scaled(value: u64, unit_secs: u64) -> Result<Duration, String> {
        value
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {value} x {unit_secs}s"))
    }
}
