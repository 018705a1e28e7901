//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use super::proxy::ProxyMediator;
use super::router::{AppState, create_router};
use crate::backend::{self, Backend};
use crate::config::{Config, normalize_mount_path};
use crate::oidc::{OidcGateway, PROVIDER_TIMEOUT, ProviderClient};
use crate::{Error, Result};

/// OIDC gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared handler state
    state: Arc<AppState>,
}

impl Gateway {
    /// Discover the identity provider and build the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if no backend is configured, the backend cannot be
    /// built, or provider discovery fails.
    pub async fn new(config: Config) -> Result<Self> {
        let backend_config = config
            .backend
            .as_ref()
            .ok_or_else(|| Error::Config("backend is required".into()))?;
        let backend = backend::from_config(backend_config, &config.upstream)?;
        Self::with_backend(config, backend).await
    }

    /// Like [`new`](Self::new) with an already built backend.
    ///
    /// # Errors
    ///
    /// Returns an error if provider discovery fails or the configuration is
    /// unusable.
    pub async fn with_backend(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()?;
        let provider = ProviderClient::discover(http, &config.oidc, config.redirect_uri()).await?;
        info!(
            issuer = %config.oidc.issuer,
            redirect_uri = %provider.redirect_uri(),
            "Identity provider discovered"
        );

        let state = Arc::new(AppState {
            oidc: OidcGateway::new(provider, backend, &config)?,
            proxy: ProxyMediator::new(&config.upstream, &config.external_url)?,
            callback_timeout: config.server.request_timeout,
        });

        Ok(Self { config, state })
    }

    /// The HTTP application
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(
            Arc::clone(&self.state),
            &normalize_mount_path(&self.config.oidc.path),
        )
    }

    /// Bind and serve until Ctrl-C or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is invalid or cannot be bound.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        let mount = normalize_mount_path(&self.config.oidc.path);
        info!("============================================================");
        info!("OIDC GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(external_url = %self.config.external_url, upstream = %self.config.upstream.url, "Proxying");
        info!("  GET {mount}          (start login)");
        info!("  GET {mount}callback  (provider redirect)");
        info!("  GET {mount}logout    (clear session)");
        if !self.config.cookies.secure {
            warn!("cookies.secure is off - session cookies will be sent over plain HTTP");
        }
        if self.config.access.allowed_domains.is_empty() && self.config.access.allowed_emails.is_empty() {
            warn!("No allow-list configured - every account at the identity provider can log in");
        }
        info!("============================================================");

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let mut drain_rx = shutdown_tx.subscribe();
        let shutdown_timeout = self.config.server.shutdown_timeout;

        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .into_future();

        // In-flight requests get shutdown_timeout to finish
        let drain_deadline = async move {
            let _ = drain_rx.recv().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = drain_deadline => {
                warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out, dropping open connections");
            }
        }

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
