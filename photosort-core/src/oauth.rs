use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_TOKEN_BASE_URL: &str = "https://api.dropboxapi.com";
const DEFAULT_AUTHORIZE_BASE_URL: &str = "https://www.dropbox.com";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    token_base_url: Url,
    authorize_base_url: Url,
    client_id: String,
    client_secret: Option<String>,
}

impl OAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Result<Self, OAuthError> {
        Self::with_base_urls(
            DEFAULT_TOKEN_BASE_URL,
            DEFAULT_AUTHORIZE_BASE_URL,
            client_id,
            client_secret,
        )
    }

    /// Uses one base url for both the authorize page and the token endpoint.
    pub fn with_base_url(
        base_url: &str,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Result<Self, OAuthError> {
        Self::with_base_urls(base_url, base_url, client_id, client_secret)
    }

    pub fn with_base_urls(
        token_base_url: &str,
        authorize_base_url: &str,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            token_base_url: Url::parse(token_base_url)?,
            authorize_base_url: Url::parse(authorize_base_url)?,
            client_id: client_id.into(),
            client_secret,
        })
    }

    /// Authorize page url. Requests offline access so the exchange yields a refresh token.
    pub fn authorize_url(
        &self,
        redirect_uri: Option<&str>,
        state: Option<&str>,
    ) -> Result<Url, OAuthError> {
        let mut url = self.authorize_base_url.join("/oauth2/authorize")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.client_id);
            query.append_pair("token_access_type", "offline");
            if let Some(redirect_uri) = redirect_uri {
                query.append_pair("redirect_uri", redirect_uri);
            }
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }
        Ok(url)
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<OAuthToken, OAuthError> {
        let mut form = vec![("grant_type", "authorization_code"), ("code", code)];
        if let Some(redirect_uri) = redirect_uri {
            form.push(("redirect_uri", redirect_uri));
        }
        self.post_token_form(form).await
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, OAuthError> {
        self.post_token_form(vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn post_token_form<'a>(
        &'a self,
        mut form: Vec<(&'a str, &'a str)>,
    ) -> Result<OAuthToken, OAuthError> {
        let url = self.token_base_url.join("/oauth2/token")?;
        form.push(("client_id", self.client_id.as_str()));
        if let Some(secret) = self.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self.http.post(url).form(&form).send().await?;
        if response.status().is_success() {
            Ok(response.json::<OAuthToken>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(OAuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}
