use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use photosort_core::{OAuthClient, OAuthError, OAuthToken};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, warn};

use super::state::{AuthState, AuthStateCell, Credentials, LoginProgress};
use crate::storage::StateFile;

const DEFAULT_REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("oauth client is required to refresh expired token")]
    MissingOAuthClient,
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("oauth request failed: {0}")]
    OAuth(#[from] OAuthError),
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

/// What the auth pipeline needs from whoever owns the session.
#[async_trait]
pub trait AuthTokenStore: Send + Sync {
    /// The token to send right now, refreshed first if it is about to expire.
    async fn current_token(&self) -> Result<Option<AccessToken>, AuthError>;

    /// Forces a refresh. `Ok(false)` means there was no session to refresh.
    async fn refresh(&self) -> Result<bool, AuthError>;

    fn logout(&self);
}

#[async_trait]
impl<S: AuthTokenStore + ?Sized> AuthTokenStore for Arc<S> {
    async fn current_token(&self) -> Result<Option<AccessToken>, AuthError> {
        (**self).current_token().await
    }

    async fn refresh(&self) -> Result<bool, AuthError> {
        (**self).refresh().await
    }

    fn logout(&self) {
        (**self).logout()
    }
}

/// Session owner backed by an OAuth refresh-token grant.
///
/// At most one refresh grant is in flight per store. Writes to the state
/// file are serialized and always reflect the latest published state.
pub struct OAuthTokenStore {
    state: AuthStateCell,
    oauth_client: Option<OAuthClient>,
    state_file: Option<StateFile>,
    refresh_skew_secs: i64,
    refresh_lock: AsyncMutex<()>,
    persist_lock: Mutex<()>,
}

impl OAuthTokenStore {
    pub fn new(state: AuthStateCell, oauth_client: Option<OAuthClient>) -> Self {
        Self {
            state,
            oauth_client,
            state_file: None,
            refresh_skew_secs: DEFAULT_REFRESH_SKEW_SECS,
            refresh_lock: AsyncMutex::new(()),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn with_state_file(mut self, state_file: StateFile) -> Self {
        self.state_file = Some(state_file);
        self
    }

    pub fn state(&self) -> &AuthStateCell {
        &self.state
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.snapshot().is_logged_in()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AuthState>> {
        self.state.subscribe()
    }

    pub fn begin_login(&self) {
        self.set_login_progress(LoginProgress::NotInProgress);
    }

    pub fn complete_login(&self, token: &OAuthToken) -> Arc<AuthState> {
        let credentials = Credentials::from_oauth_token(token, now_unix());
        let published = self.state.update(|_| AuthState {
            credentials: Some(credentials),
            login: LoginProgress::Succeeded,
        });
        self.persist_current();
        info!("login completed");
        published
    }

    pub fn fail_login(&self) {
        self.set_login_progress(LoginProgress::Failed);
        warn!("login failed");
    }

    /// Resolves once the pending login settles; `true` when it succeeded.
    pub async fn wait_for_login(&self) -> bool {
        let mut rx = self.state.subscribe();
        let succeeded = match rx
            .wait_for(|state| state.login != LoginProgress::NotInProgress)
            .await
        {
            Ok(state) => state.login == LoginProgress::Succeeded,
            Err(_) => false,
        };
        self.set_login_progress(LoginProgress::NotInProgress);
        succeeded
    }

    fn set_login_progress(&self, login: LoginProgress) {
        self.state.update(|current| AuthState {
            login,
            ..current.clone()
        });
    }

    fn should_refresh(&self, credentials: &Credentials) -> bool {
        let Some(expires_at) = credentials.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    async fn refresh_from(&self, snapshot: Arc<AuthState>) -> Result<bool, AuthError> {
        let Some(credentials) = snapshot.credentials.as_ref() else {
            return Ok(false);
        };
        let refresh_token = credentials
            .refresh_token
            .as_deref()
            .ok_or(AuthError::MissingRefreshToken)?;
        let client = self
            .oauth_client
            .as_ref()
            .ok_or(AuthError::MissingOAuthClient)?;
        let token = client.refresh_token(refresh_token).await?;
        let next = AuthState {
            credentials: Some(credentials.refreshed_with(&token, now_unix())),
            login: snapshot.login,
        };

        match self.state.compare_and_swap(&snapshot, next) {
            Ok(_) => {
                self.persist_current();
                info!("access token refreshed");
                Ok(true)
            }
            Err(current) => {
                // Someone logged out or refreshed meanwhile; their value stands.
                debug!(
                    logged_in = current.is_logged_in(),
                    "auth state changed during refresh, discarding result"
                );
                Ok(current.is_logged_in())
            }
        }
    }

    /// Mirrors the state published at the time the lock is taken: saved
    /// while logged in, removed otherwise.
    fn persist_current(&self) {
        let Some(file) = &self.state_file else {
            return;
        };
        let _guard = self
            .persist_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self.state.snapshot();
        if current.is_logged_in() {
            if let Err(err) = file.save(&current) {
                warn!(error = %err, "failed to persist auth state");
            }
        } else if let Err(err) = file.delete() {
            warn!(error = %err, "failed to remove persisted auth state");
        }
    }
}

#[async_trait]
impl AuthTokenStore for OAuthTokenStore {
    async fn current_token(&self) -> Result<Option<AccessToken>, AuthError> {
        let snapshot = self.state.snapshot();
        let Some(credentials) = snapshot.credentials.as_ref() else {
            return Ok(None);
        };
        if !self.should_refresh(credentials) {
            return Ok(Some(AccessToken::new(credentials.access_token.clone())));
        }

        let _refreshing = self.refresh_lock.lock().await;
        let snapshot = self.state.snapshot();
        let Some(credentials) = snapshot.credentials.as_ref() else {
            return Ok(None);
        };
        if !self.should_refresh(credentials) {
            // Another caller refreshed while we waited.
            return Ok(Some(AccessToken::new(credentials.access_token.clone())));
        }
        debug!("access token near expiry, refreshing before use");
        self.refresh_from(Arc::clone(&snapshot)).await?;
        Ok(self.state.snapshot().access_token().map(AccessToken::new))
    }

    async fn refresh(&self) -> Result<bool, AuthError> {
        let seen = self.state.snapshot();
        let _refreshing = self.refresh_lock.lock().await;
        let current = self.state.snapshot();
        if current.credentials != seen.credentials {
            debug!("credentials changed while waiting, skipping refresh");
            return Ok(current.is_logged_in());
        }
        self.refresh_from(current).await
    }

    fn logout(&self) {
        self.state.replace(AuthState::logged_out());
        self.persist_current();
        info!("logged out");
    }
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
