use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use photosort_core::{DEFAULT_API_BASE_URL, OAuthClient};

use crate::moves::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE, MoveQueueConfig, RetryPolicy,
};
use crate::rate_limit::{DEFAULT_MAX_PER_WINDOW, DEFAULT_WINDOW, RateLimitConfig};
use crate::storage::StateFile;

pub const DEFAULT_OAUTH_BASE_URL: &str = "https://api.dropboxapi.com";
pub const DEFAULT_AUTHORIZE_BASE_URL: &str = "https://www.dropbox.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthAppConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub api_base_url: String,
    pub oauth_base_url: String,
    pub authorize_base_url: String,
    pub oauth_app: Option<OAuthAppConfig>,
    pub state_file: PathBuf,
    pub rate_limit: RateLimitConfig,
    pub moves: MoveQueueConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(|name| std::env::var(name).ok(), &home))
    }

    pub fn from_lookup<F>(lookup: F, home: &Path) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let string_or = |name: &str, default: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let oauth_app = lookup("PHOTOSORT_CLIENT_ID")
            .filter(|value| !value.trim().is_empty())
            .map(|client_id| OAuthAppConfig {
                client_id,
                client_secret: lookup("PHOTOSORT_CLIENT_SECRET")
                    .filter(|value| !value.trim().is_empty()),
            });
        let state_file = lookup("PHOTOSORT_STATE_FILE")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(StateFile::default_path);

        let max_per_window = read_u64(
            &lookup,
            "PHOTOSORT_RATE_LIMIT_MAX",
            u64::from(DEFAULT_MAX_PER_WINDOW),
        );
        let window = Duration::from_millis(read_u64(
            &lookup,
            "PHOTOSORT_RATE_LIMIT_WINDOW_MS",
            DEFAULT_WINDOW.as_millis() as u64,
        ));
        let batch_size = read_u64(&lookup, "PHOTOSORT_BATCH_SIZE", DEFAULT_BATCH_SIZE as u64);
        let retry = RetryPolicy::new(
            Duration::from_millis(read_u64(
                &lookup,
                "PHOTOSORT_RETRY_BASE_MS",
                DEFAULT_RETRY_BASE.as_millis() as u64,
            )),
            read_u64(&lookup, "PHOTOSORT_MAX_RETRIES", u64::from(DEFAULT_MAX_RETRIES))
                .min(u64::from(u32::MAX)) as u32,
            read_bool(&lookup, "PHOTOSORT_RETRY_JITTER", false),
        );

        Self {
            api_base_url: string_or("PHOTOSORT_API_BASE_URL", DEFAULT_API_BASE_URL),
            oauth_base_url: string_or("PHOTOSORT_OAUTH_BASE_URL", DEFAULT_OAUTH_BASE_URL),
            authorize_base_url: string_or(
                "PHOTOSORT_AUTHORIZE_BASE_URL",
                DEFAULT_AUTHORIZE_BASE_URL,
            ),
            oauth_app,
            state_file,
            rate_limit: RateLimitConfig::new(
                max_per_window.min(u64::from(u32::MAX)) as u32,
                window,
            ),
            moves: MoveQueueConfig {
                batch_size: usize::try_from(batch_size).unwrap_or(DEFAULT_BATCH_SIZE),
                retry,
            },
        }
    }

    /// `None` when no client id is configured; refresh and login are then unavailable.
    pub fn oauth_client(&self) -> anyhow::Result<Option<OAuthClient>> {
        let Some(app) = &self.oauth_app else {
            return Ok(None);
        };
        let client = OAuthClient::with_base_urls(
            &self.oauth_base_url,
            &self.authorize_base_url,
            app.client_id.clone(),
            app.client_secret.clone(),
        )
        .context("invalid oauth base url/config")?;
        Ok(Some(client))
    }
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
