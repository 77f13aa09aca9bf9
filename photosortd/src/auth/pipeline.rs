//! Request stages that keep remote calls authenticated.
//!
//! [`auth_pipeline`] composes them around a base transport:
//!
//! ```text
//! LogoutOnUnauthorized -> TokenAttach -> RetryOnUnauthorized -> transport
//! ```
//!
//! Tokens are attached on the way in, a 401 from the transport gets one
//! refresh-and-retry, and a 401 that survives the retry ends the local
//! session and is turned into [`ApiResponse::session_ended`].

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use photosort_core::{ApiRequest, ApiResponse, StatusCode, Transport, TransportError};
use tracing::{debug, info, warn};

use super::token_store::AuthTokenStore;

pub type AuthPipeline<T, S> = LogoutOnUnauthorized<TokenAttach<RetryOnUnauthorized<T, S>, S>, S>;

pub fn auth_pipeline<T, S>(transport: T, tokens: S) -> AuthPipeline<T, S>
where
    T: Transport,
    S: AuthTokenStore + Clone,
{
    let retry = RetryOnUnauthorized::new(transport, tokens.clone());
    let attach = TokenAttach::new(retry, tokens.clone());
    LogoutOnUnauthorized::new(attach, tokens)
}

/// Adds the current bearer token. Without one the request goes out as is and
/// the resulting 401 is left to the later stages.
pub struct TokenAttach<T, S> {
    inner: T,
    tokens: S,
}

impl<T, S> TokenAttach<T, S> {
    pub fn new(inner: T, tokens: S) -> Self {
        Self { inner, tokens }
    }
}

#[async_trait]
impl<T: Transport, S: AuthTokenStore> Transport for TokenAttach<T, S> {
    async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, TransportError> {
        match self.tokens.current_token().await {
            Ok(Some(token)) => request.bearer = Some(token.as_str().to_owned()),
            Ok(None) => debug!(path = %request.path, "no access token, sending unauthenticated"),
            Err(err) => warn!(
                path = %request.path,
                error = %err,
                "token lookup failed, sending unauthenticated"
            ),
        }
        self.inner.send(request).await
    }
}

/// Refreshes once on 401 and retries the request with the new token.
///
/// Only one refresh runs at a time. A caller that hits a 401 while another
/// refresh is in flight does not wait for it; it assumes the refresh will
/// succeed and retries with whatever token the store hands out, which may
/// still be the stale one. That caller then passes its second 401 on.
pub struct RetryOnUnauthorized<T, S> {
    inner: T,
    tokens: S,
    refreshing: Mutex<bool>,
}

impl<T, S> RetryOnUnauthorized<T, S> {
    pub fn new(inner: T, tokens: S) -> Self {
        Self {
            inner,
            tokens,
            refreshing: Mutex::new(false),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        *self.refreshing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim_refresh(&self) -> Option<RefreshClaim<'_>> {
        let mut flag = self.refreshing.lock().unwrap_or_else(PoisonError::into_inner);
        if *flag {
            return None;
        }
        *flag = true;
        Some(RefreshClaim {
            flag: &self.refreshing,
        })
    }
}

impl<T: Transport, S: AuthTokenStore> RetryOnUnauthorized<T, S> {
    async fn refresh_once(&self) -> bool {
        let Some(_claim) = self.try_claim_refresh() else {
            debug!("token refresh already in flight, assuming it succeeds");
            return true;
        };
        match self.tokens.refresh().await {
            Ok(true) => true,
            Ok(false) => {
                info!("no session to refresh");
                false
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed");
                false
            }
        }
    }
}

#[async_trait]
impl<T: Transport, S: AuthTokenStore> Transport for RetryOnUnauthorized<T, S> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let response = self.inner.send(request.clone()).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(path = %request.path, "received 401, attempting token refresh");
        if !self.refresh_once().await {
            return Ok(response);
        }
        let token = match self.tokens.current_token().await {
            Ok(Some(token)) => token,
            Ok(None) => return Ok(response),
            Err(err) => {
                warn!(error = %err, "no token available after refresh");
                return Ok(response);
            }
        };
        self.inner.send(request.with_bearer(token.as_str())).await
    }
}

/// Clears the in-flight flag however the refresh ends.
struct RefreshClaim<'a> {
    flag: &'a Mutex<bool>,
}

impl Drop for RefreshClaim<'_> {
    fn drop(&mut self) {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// Logs the user out when a 401 makes it through the retry stage.
pub struct LogoutOnUnauthorized<T, S> {
    inner: T,
    tokens: S,
}

impl<T, S> LogoutOnUnauthorized<T, S> {
    pub fn new(inner: T, tokens: S) -> Self {
        Self { inner, tokens }
    }
}

#[async_trait]
impl<T: Transport, S: AuthTokenStore> Transport for LogoutOnUnauthorized<T, S> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let path = request.path.clone();
        let response = self.inner.send(request).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        warn!(path = %path, "request still unauthorized, logging out");
        self.tokens.logout();
        Ok(ApiResponse::session_ended())
    }
}
