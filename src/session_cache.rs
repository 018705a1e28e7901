//! Cached upstream admin credential with lazy refresh.
//!
//! Every backend adapter holds a privileged session against its upstream
//! application. [`SessionCache`] keeps that credential together with a soft
//! expiry and is a two-state machine: `Empty` or `Valid(credential, expires_at)`.
//!
//! - [`SessionCache::ensure`] returns the cached credential or performs the
//!   refresh while holding an exclusive lock, so concurrent callers wait behind
//!   one admin login instead of starting their own.
//! - [`SessionCache::invalidate`] drops the credential after the upstream
//!   rejected it, unless another caller already replaced it.
//! - [`SessionCache::call_with_retry`] wraps one upstream call: on an
//!   authorization failure it invalidates and retries exactly once.
//!
//! The lock only covers the check-and-refresh step. The upstream call that
//! uses the credential runs outside it.
//!
//! A refresh runs in its own task. If the request that triggered it goes away
//! (browser disconnect, request timeout) the refresh still finishes and
//! populates the cache for later callers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::debug;

/// Errors that can signal a stale or rejected credential.
pub trait AuthorizationFailure {
    /// `true` when the upstream rejected the credential (HTTP 401 or equivalent).
    fn is_unauthorized(&self) -> bool;
}

type RefreshFn<C, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<C, E>> + Send + Sync>;

enum CacheState<C> {
    Empty,
    Valid { credential: C, expires_at: Instant },
}

/// Single cached credential guarded by an async mutex.
///
/// `E` must absorb a [`JoinError`] because the refresh runs on a spawned task.
pub struct SessionCache<C, E> {
    state: Arc<Mutex<CacheState<C>>>,
    refresh: RefreshFn<C, E>,
    ttl: Duration,
}

impl<C, E> SessionCache<C, E>
where
    C: Clone + PartialEq + Send + 'static,
    E: From<JoinError> + Send + 'static,
{
    /// Create an empty cache.
    ///
    /// `refresh` performs the upstream admin login. A credential it returns is
    /// considered valid for `ttl`, which should sit below the upstream's real
    /// session lifetime.
    pub fn new<F, Fut>(ttl: Duration, refresh: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C, E>> + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(CacheState::Empty)),
            refresh: Arc::new(move || refresh().boxed()),
            ttl,
        }
    }

    /// Return a valid credential, refreshing it if the cache is empty or stale.
    ///
    /// On refresh failure the cache stays empty and the error is returned.
    pub async fn ensure(&self) -> Result<C, E> {
        let mut guard = Arc::clone(&self.state).lock_owned().await;

        if let CacheState::Valid {
            credential,
            expires_at,
        } = &*guard
        {
            if Instant::now() < *expires_at {
                return Ok(credential.clone());
            }
        }

        *guard = CacheState::Empty;
        let refresh = Arc::clone(&self.refresh);
        let ttl = self.ttl;

        // The guard moves into the task so the refresh survives a dropped caller.
        let task = tokio::spawn(async move {
            debug!("Refreshing upstream admin credential");
            let credential = refresh().await?;
            *guard = CacheState::Valid {
                credential: credential.clone(),
                expires_at: Instant::now() + ttl,
            };
            Ok::<C, E>(credential)
        });

        task.await?
    }

    /// Forget `rejected` regardless of its expiry.
    ///
    /// A no-op when the cache already holds a different credential, so callers
    /// that all saw the same stale credential trigger a single re-login.
    pub async fn invalidate(&self, rejected: &C) {
        let mut state = self.state.lock().await;
        if matches!(&*state, CacheState::Valid { credential, .. } if credential == rejected) {
            *state = CacheState::Empty;
        }
    }

    /// Whether a credential is cached and not yet past its soft expiry.
    pub async fn is_valid(&self) -> bool {
        match &*self.state.lock().await {
            CacheState::Valid { expires_at, .. } => Instant::now() < *expires_at,
            CacheState::Empty => false,
        }
    }

    /// Run `op` with a valid credential, retrying once on an authorization failure.
    ///
    /// A second consecutive authorization failure is returned to the caller.
    pub async fn call_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(C) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: AuthorizationFailure,
    {
        let credential = self.ensure().await?;
        let used = credential.clone();
        match op(credential).await {
            Err(err) if err.is_unauthorized() => {
                debug!("Upstream rejected cached credential, re-authenticating once");
                self.invalidate(&used).await;
                let credential = self.ensure().await?;
                op(credential).await
            }
            other => other,
        }
    }
}
