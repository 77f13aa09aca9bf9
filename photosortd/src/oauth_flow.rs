use std::sync::Arc;

use photosort_core::{OAuthClient, OAuthError};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::auth::OAuthTokenStore;

#[derive(Debug, Error)]
pub enum OAuthFlowError {
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authorization code missing")]
    MissingCode,
}

/// Authorization-code login with a manually pasted code.
pub struct OAuthFlow {
    client: OAuthClient,
    tokens: Arc<OAuthTokenStore>,
}

impl OAuthFlow {
    pub fn new(client: OAuthClient, tokens: Arc<OAuthTokenStore>) -> Self {
        Self { client, tokens }
    }

    /// Prints the authorize url to `output`, reads the code from `input` and
    /// completes the login. The store's login progress reflects the outcome.
    pub async fn authenticate<R, W>(&self, input: R, mut output: W) -> Result<(), OAuthFlowError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.tokens.begin_login();
        let result: Result<(), OAuthFlowError> = async {
            let url = self.client.authorize_url(None, None)?;
            output
                .write_all(format!("Open this URL in your browser:\n{url}\n").as_bytes())
                .await?;
            output.write_all(b"Enter the authorization code: ").await?;
            output.flush().await?;
            let code = read_code(input).await?;
            self.complete_with_code(&code).await
        }
        .await;
        if result.is_err() {
            self.tokens.fail_login();
        }
        result
    }

    pub async fn complete_with_code(&self, code: &str) -> Result<(), OAuthFlowError> {
        let token = self.client.exchange_code(code, None).await?;
        self.tokens.complete_login(&token);
        info!("authorization code exchanged");
        Ok(())
    }
}

async fn read_code<R: AsyncBufRead + Unpin>(input: R) -> Result<String, OAuthFlowError> {
    let mut lines = input.lines();
    let code = lines
        .next_line()
        .await?
        .map(|line| line.trim().to_string())
        .unwrap_or_default();
    if code.is_empty() {
        return Err(OAuthFlowError::MissingCode);
    }
    Ok(code)
}
