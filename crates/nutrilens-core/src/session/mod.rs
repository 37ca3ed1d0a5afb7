mod token_store;

pub use token_store::TokenStore;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::task::JoinHandle;

use crate::backend::BackendClient;
use crate::error::Result;
use crate::model::User;

/// Authentication state. `identity` is only ever set while `token` is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    token: Option<String>,
    identity: Option<User>,
}

impl Session {
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn identity(&self) -> Option<&User> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }
}

#[derive(Debug, Default)]
struct Inner {
    session: Session,
    /// Bumped whenever the token changes, so a slow identity refresh for an
    /// old token cannot land on a newer session.
    epoch: u64,
}

/// Single source of truth for "is the user authenticated".
///
/// Shared as `Arc<SessionStore>` by every component that authenticates.
/// Readers get a copy of the token; writers swap token and identity under
/// one lock, so a reader never sees a half-updated session.
#[derive(Debug)]
pub struct SessionStore {
    inner: RwLock<Inner>,
    tokens: TokenStore,
    backend: BackendClient,
}

impl SessionStore {
    pub fn new(backend: BackendClient, tokens: TokenStore) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            tokens,
            backend,
        }
    }

    /// Non-blocking read of the current token.
    pub fn current_token(&self) -> Option<String> {
        self.read().session.token.clone()
    }

    pub fn identity(&self) -> Option<User> {
        self.read().session.identity.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().session.is_authenticated()
    }

    pub fn snapshot(&self) -> Session {
        self.read().session.clone()
    }

    /// Store a new token, persist it, and start a best-effort identity refresh.
    ///
    /// Must be called inside a Tokio runtime. The returned handle resolves
    /// when the refresh has finished (or been discarded as stale).
    pub fn set_token(self: &Arc<Self>, token: impl Into<String>) -> JoinHandle<()> {
        let token = token.into();
        let epoch = {
            let mut inner = self.write();
            inner.epoch += 1;
            inner.session = Session {
                token: Some(token.clone()),
                identity: None,
            };
            inner.epoch
        };

        if let Err(e) = self.tokens.save(&token) {
            tracing::warn!(error = %e, "token not persisted, session is in-memory only");
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.refresh_identity(epoch, token).await })
    }

    async fn refresh_identity(&self, epoch: u64, token: String) {
        let result = self.backend.fetch_profile(&token).await;

        let rejected = {
            let mut inner = self.write();
            if inner.epoch != epoch {
                tracing::debug!(epoch, current = inner.epoch, "discarding stale identity refresh");
                return;
            }
            match result {
                Ok(user) => {
                    tracing::debug!(username = %user.username, "identity refreshed");
                    inner.session.identity = Some(user);
                    false
                }
                Err(e) if e.is_unauthorized() => {
                    tracing::warn!(error = %e, "token rejected, clearing session");
                    inner.epoch += 1;
                    inner.session = Session::default();
                    true
                }
                Err(e) => {
                    tracing::warn!(error = %e, "identity refresh failed");
                    inner.session.identity = None;
                    false
                }
            }
        };

        if rejected {
            self.forget_persisted();
        }
    }

    /// Remove token and identity. Idempotent.
    pub fn clear(&self) {
        {
            let mut inner = self.write();
            if inner.session != Session::default() {
                inner.epoch += 1;
                inner.session = Session::default();
                tracing::info!("session cleared");
            }
        }
        self.forget_persisted();
    }

    /// Clear the session only if `token` is still the current one.
    ///
    /// A rejection for a token that has since been replaced says nothing
    /// about the new session. Returns whether the session was cleared.
    pub fn clear_if_current(&self, token: &str) -> bool {
        {
            let mut inner = self.write();
            if inner.session.token.as_deref() != Some(token) {
                tracing::debug!("rejected token already replaced, session kept");
                return false;
            }
            inner.epoch += 1;
            inner.session = Session::default();
            tracing::info!("session cleared");
        }
        self.forget_persisted();
        true
    }

    /// Restore a persisted token at startup. No-op when none is persisted.
    pub fn restore(self: &Arc<Self>) -> Result<Option<JoinHandle<()>>> {
        match self.tokens.load()? {
            Some(token) => {
                tracing::debug!("restored persisted session");
                Ok(Some(self.set_token(token)))
            }
            None => Ok(None),
        }
    }

    /// Log in against the backend and adopt the issued token.
    pub async fn login(self: &Arc<Self>, username: &str, password: &str) -> Result<JoinHandle<()>> {
        let token = self.backend.login(username, password).await?;
        tracing::info!(username, "logged in");
        Ok(self.set_token(token))
    }

    fn forget_persisted(&self) {
        if let Err(e) = self.tokens.clear() {
            tracing::warn!(error = %e, "failed to remove persisted token");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    /// Backend pointing at a closed port: identity refreshes fail as unreachable.
    fn offline_store(tokens: TokenStore) -> Arc<SessionStore> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = BackendConfig {
            base_url: format!("http://{addr}"),
            ..Default::default()
        };
        Arc::new(SessionStore::new(
            BackendClient::from_config(&config).unwrap(),
            tokens,
        ))
    }

    #[tokio::test]
    async fn test_set_token_then_read() {
        let store = offline_store(TokenStore::memory());
        assert!(store.current_token().is_none());
        let refresh = store.set_token("tok-1");
        assert_eq!(store.current_token().as_deref(), Some("tok-1"));
        refresh.await.unwrap();
        // transport failure clears identity but keeps the token
        assert_eq!(store.current_token().as_deref(), Some("tok-1"));
        assert!(store.identity().is_none());
    }

    #[tokio::test]
    async fn test_clear_twice_equals_clear_once() {
        let store = offline_store(TokenStore::memory());
        store.set_token("tok").await.unwrap();

        store.clear();
        let once = store.snapshot();
        store.clear();
        let twice = store.snapshot();

        assert_eq!(once, twice);
        assert_eq!(once, Session::default());
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn test_token_persisted_and_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");

        let first = offline_store(TokenStore::file(&path));
        first.set_token("persisted").await.unwrap();

        let second = offline_store(TokenStore::file(&path));
        let handle = second.restore().unwrap();
        assert!(handle.is_some());
        assert_eq!(second.current_token().as_deref(), Some("persisted"));
    }

    #[tokio::test]
    async fn test_restore_without_persisted_token_is_noop() {
        let store = offline_store(TokenStore::memory());
        assert!(store.restore().unwrap().is_none());
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn test_clear_removes_persisted_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let store = offline_store(TokenStore::file(&path));
        store.set_token("t").await.unwrap();
        assert!(path.exists());
        store.clear();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_clear_if_current_keeps_replaced_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let store = offline_store(TokenStore::file(&path));
        store.set_token("old").await.unwrap();
        store.set_token("new").await.unwrap();

        assert!(!store.clear_if_current("old"));
        assert_eq!(store.current_token().as_deref(), Some("new"));
        assert!(path.exists());

        assert!(store.clear_if_current("new"));
        assert!(!store.is_authenticated());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_identity_never_without_token() {
        let store = offline_store(TokenStore::memory());
        let handle = store.set_token("t");
        store.clear();
        handle.await.unwrap();
        let snap = store.snapshot();
        assert!(snap.token().is_none());
        assert!(snap.identity().is_none());
    }
}
