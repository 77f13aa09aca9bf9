use std::sync::Arc;

use photosort_core::OAuthToken;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl Credentials {
    pub fn from_oauth_token(token: &OAuthToken, now_unix: i64) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token
                .expires_in
                .map(|secs| now_unix.saturating_add(secs.min(i64::MAX as u64) as i64)),
            scope: token.scope.clone(),
            token_type: Some(token.token_type.clone()),
        }
    }

    /// Applies a refresh response, keeping fields the token endpoint omitted.
    pub fn refreshed_with(&self, token: &OAuthToken, now_unix: i64) -> Self {
        let mut refreshed = Self::from_oauth_token(token, now_unix);
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = self.refresh_token.clone();
        }
        if refreshed.scope.is_none() {
            refreshed.scope = self.scope.clone();
        }
        refreshed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginProgress {
    #[default]
    NotInProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(skip)]
    pub login: LoginProgress,
}

impl AuthState {
    pub fn logged_out() -> Self {
        Self::default()
    }

    pub fn is_logged_in(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.credentials
            .as_ref()
            .map(|credentials| credentials.access_token.as_str())
    }
}

/// The single authoritative [`AuthState`] of the process.
///
/// Values are never mutated in place: every update publishes a whole new
/// `Arc<AuthState>`, so a snapshot taken by a reader stays internally
/// consistent no matter what writers do afterwards.
#[derive(Clone)]
pub struct AuthStateCell {
    tx: Arc<watch::Sender<Arc<AuthState>>>,
}

impl AuthStateCell {
    pub fn new(initial: AuthState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Arc<AuthState> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn replace(&self, state: AuthState) -> Arc<AuthState> {
        let state = Arc::new(state);
        self.tx.send_replace(Arc::clone(&state));
        state
    }

    /// Read-modify-write under the cell's lock. Returns the published value.
    pub fn update<F>(&self, f: F) -> Arc<AuthState>
    where
        F: FnOnce(&AuthState) -> AuthState,
    {
        let mut published = None;
        self.tx.send_modify(|current| {
            let next = Arc::new(f(current));
            published = Some(Arc::clone(&next));
            *current = next;
        });
        published.unwrap_or_else(|| self.snapshot())
    }

    /// Publishes `next` only if the current value is still `expected`.
    ///
    /// On a lost race the value that won is returned in `Err`.
    pub fn compare_and_swap(
        &self,
        expected: &Arc<AuthState>,
        next: AuthState,
    ) -> Result<Arc<AuthState>, Arc<AuthState>> {
        let next = Arc::new(next);
        let mut outcome = Err(Arc::clone(expected));
        self.tx.send_if_modified(|current| {
            if Arc::ptr_eq(current, expected) {
                *current = Arc::clone(&next);
                outcome = Ok(Arc::clone(&next));
                true
            } else {
                outcome = Err(Arc::clone(current));
                false
            }
        });
        outcome
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AuthState>> {
        self.tx.subscribe()
    }
}

impl Default for AuthStateCell {
    fn default() -> Self {
        Self::new(AuthState::logged_out())
    }
}
