use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::SyncResult;

/// The identity whose mutation queue and overlays are currently active.
///
/// Durable state is partitioned per user; switching users flushes in-memory
/// state but leaves every user's durable log intact.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn authenticated(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub user: User,
}

pub type CredentialChangeListener = Arc<dyn Fn(User) + Send + Sync>;

/// Source of authentication tokens for the watch and write streams.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Fetches a token for the current user. `force_refresh` bypasses any
    /// cached token after the server rejected it.
    async fn get_token(&self, force_refresh: bool) -> SyncResult<Option<AuthToken>>;

    /// Registers the listener invoked whenever the active user changes.
    /// Stream re-authentication hangs off this callback.
    fn set_change_listener(&self, listener: CredentialChangeListener);
}

/// Provider used when the client runs without authentication.
#[derive(Default)]
pub struct AnonymousCredentials;

#[async_trait]
impl CredentialsProvider for AnonymousCredentials {
    async fn get_token(&self, _force_refresh: bool) -> SyncResult<Option<AuthToken>> {
        Ok(None)
    }

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        listener(User::unauthenticated());
    }
}

/// Provider wrapping a mutable token slot, primarily for tests and embedders
/// that manage token refresh themselves.
#[derive(Default)]
pub struct StaticCredentials {
    state: Mutex<StaticCredentialState>,
}

#[derive(Default)]
struct StaticCredentialState {
    token: Option<AuthToken>,
    listener: Option<CredentialChangeListener>,
}

impl StaticCredentials {
    pub fn new(token: Option<AuthToken>) -> Self {
        Self {
            state: Mutex::new(StaticCredentialState {
                token,
                listener: None,
            }),
        }
    }

    /// Replaces the token and notifies the registered listener of the user
    /// change.
    pub fn set_token(&self, token: Option<AuthToken>) {
        let (user, listener) = {
            let mut guard = self.state.lock().unwrap();
            guard.token = token;
            let user = guard
                .token
                .as_ref()
                .map(|t| t.user.clone())
                .unwrap_or_else(User::unauthenticated);
            (user, guard.listener.clone())
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn get_token(&self, _force_refresh: bool) -> SyncResult<Option<AuthToken>> {
        Ok(self.state.lock().unwrap().token.clone())
    }

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        let user = {
            let mut guard = self.state.lock().unwrap();
            let user = guard
                .token
                .as_ref()
                .map(|t| t.user.clone())
                .unwrap_or_else(User::unauthenticated);
            guard.listener = Some(listener.clone());
            user
        };
        listener(user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn static_credentials_notify_on_change() {
        let provider = StaticCredentials::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        provider.set_change_listener(Arc::new(move |_user| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        provider.set_token(Some(AuthToken {
            value: "tok".into(),
            user: User::authenticated("alice"),
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let token = provider.get_token(false).await.unwrap().unwrap();
        assert_eq!(token.user.uid(), Some("alice"));
    }
}
