//! `Set-Cookie` rewriting for the externally visible host.
//!
//! Upstream applications issue cookies for their own (internal) origin. Before
//! handing them to the browser the gateway pins any `Domain` attribute to the
//! host the browser actually talked to, enforces `Secure` when configured and
//! defaults `SameSite` to `Lax`.

use cookie::time::Duration;
use cookie::{Cookie, SameSite};
use tracing::warn;

/// Rewrites upstream session cookies and produces the logout cookie.
#[derive(Debug, Clone)]
pub struct CookieRewriter {
    secure: bool,
    cookie_name: String,
}

impl CookieRewriter {
    /// Create a rewriter. `cookie_name` is the session cookie cleared on logout.
    pub fn new(secure: bool, cookie_name: impl Into<String>) -> Self {
        Self {
            secure,
            cookie_name: cookie_name.into(),
        }
    }

    /// Name of the session cookie this rewriter clears.
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Rewrite raw `Set-Cookie` values for `host`.
    ///
    /// A `:port` suffix on `host` is ignored. Cookies without a `Domain`
    /// attribute stay host-only. Attribute order is preserved and repeated
    /// rewrites never duplicate `Secure` or `SameSite`.
    pub fn rewrite(&self, set_cookies: &[String], host: &str) -> Vec<String> {
        let domain = host_without_port(host);
        set_cookies
            .iter()
            .map(|cookie| self.rewrite_one(cookie, domain))
            .collect()
    }

    fn rewrite_one(&self, raw: &str, domain: &str) -> String {
        let parsed = match Cookie::parse(raw) {
            Ok(cookie) => cookie,
            Err(e) => {
                warn!(error = %e, "Passing through unparseable Set-Cookie value");
                return raw.to_string();
            }
        };

        // Re-emitted from the raw segments so the upstream attribute order survives
        let (pair, attrs) = raw.split_once(';').unwrap_or((raw, ""));
        let mut out = vec![pair.trim().to_string()];
        let mut wrote_domain = false;
        let mut wrote_secure = false;
        let mut wrote_same_site = false;

        for attr in attrs.split(';').map(str::trim).filter(|a| !a.is_empty()) {
            let key = attr.split_once('=').map_or(attr, |(k, _)| k).trim();

            if key.eq_ignore_ascii_case("domain") {
                if parsed.domain().is_some() && !wrote_domain {
                    out.push(format!("Domain={domain}"));
                    wrote_domain = true;
                }
            } else if key.eq_ignore_ascii_case("secure") {
                if !wrote_secure {
                    out.push(attr.to_string());
                    wrote_secure = true;
                }
            } else if key.eq_ignore_ascii_case("samesite") {
                // Unrecognised values are replaced by the Lax default below
                if parsed.same_site().is_some() && !wrote_same_site {
                    out.push(attr.to_string());
                    wrote_same_site = true;
                }
            } else {
                out.push(attr.to_string());
            }
        }

        if self.secure && parsed.secure() != Some(true) {
            out.push("Secure".to_string());
        }
        if parsed.same_site().is_none() {
            out.push(format!("SameSite={}", SameSite::Lax));
        }

        out.join("; ")
    }

    /// `Set-Cookie` value that expires the session cookie immediately.
    pub fn clear(&self) -> String {
        Cookie::build((self.cookie_name.clone(), ""))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .max_age(Duration::ZERO)
            .build()
            .to_string()
    }
}

/// Strip a trailing `:port` from a `Host` header value.
pub fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
