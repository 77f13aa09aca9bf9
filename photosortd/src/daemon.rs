use std::sync::Arc;

use anyhow::Context;
use photosort_core::{
    FilesClient, FilesError, HttpTransport, LIST_FOLDER_PAGE_LIMIT, MoveResult, Photo, Transport,
    is_absolute_path, photos_from_entries,
};
use tracing::{debug, info, warn};

use crate::auth::{
    AuthPipeline, AuthState, AuthStateCell, AuthTokenStore, OAuthTokenStore, auth_pipeline,
};
use crate::config::AppConfig;
use crate::moves::{MoveError, MoveQueue};
use crate::oauth_flow::OAuthFlow;
use crate::rate_limit::RateLimiter;
use crate::storage::StateFile;

pub type ApiTransport = AuthPipeline<HttpTransport, Arc<OAuthTokenStore>>;

#[derive(Debug)]
pub struct MoveReport {
    pub from: String,
    pub to: String,
    pub outcome: Result<MoveResult, MoveError>,
}

/// Everything a command needs, wired once: the persisted session, the
/// authenticated files client, the shared rate limiter and the move worker.
pub struct DaemonRuntime {
    config: AppConfig,
    tokens: Arc<OAuthTokenStore>,
    files: FilesClient<Arc<ApiTransport>>,
    limiter: RateLimiter,
    moves: MoveQueue,
}

impl DaemonRuntime {
    /// Must run inside a tokio runtime; the move worker is spawned here.
    pub fn bootstrap(config: AppConfig) -> anyhow::Result<Self> {
        let state_file = StateFile::new(&config.state_file);
        let initial = match state_file.load_or_logged_out() {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable auth state");
                AuthState::logged_out()
            }
        };
        let tokens = Arc::new(
            OAuthTokenStore::new(AuthStateCell::new(initial), config.oauth_client()?)
                .with_state_file(state_file),
        );

        let http = HttpTransport::with_base_url(&config.api_base_url)
            .with_context(|| format!("invalid api base url {}", config.api_base_url))?;
        let transport = Arc::new(auth_pipeline(http, Arc::clone(&tokens)));
        let files = FilesClient::new(Arc::clone(&transport));
        let limiter = RateLimiter::new(config.rate_limit);
        let moves = MoveQueue::start(
            FilesClient::new(transport),
            limiter.clone(),
            config.moves,
        );

        Ok(Self {
            config,
            tokens,
            files,
            limiter,
            moves,
        })
    }

    pub fn tokens(&self) -> &Arc<OAuthTokenStore> {
        &self.tokens
    }

    pub fn oauth_flow(&self) -> anyhow::Result<OAuthFlow> {
        let client = self
            .config
            .oauth_client()?
            .context("PHOTOSORT_CLIENT_ID is not set")?;
        Ok(OAuthFlow::new(client, Arc::clone(&self.tokens)))
    }

    /// Submits every pair at once and waits for all of them.
    pub async fn move_all(&self, pairs: &[(String, String)]) -> Vec<MoveReport> {
        let submitted: Vec<_> = pairs
            .iter()
            .map(|(from, to)| (from, to, self.moves.submit(from, to)))
            .collect();
        let mut reports = Vec::with_capacity(submitted.len());
        for (from, to, pending) in submitted {
            let outcome = match pending {
                Ok(pending) => pending.wait().await,
                Err(err) => Err(err),
            };
            reports.push(MoveReport {
                from: from.clone(),
                to: to.clone(),
                outcome,
            });
        }
        reports
    }

    pub async fn list_photos(&self, folder: &str) -> Result<Vec<Photo>, FilesError> {
        list_photos_paced(&self.files, &self.limiter, folder).await
    }

    pub async fn temporary_link(&self, path: &str) -> Result<String, FilesError> {
        self.limiter
            .with_rate_limit(|| self.files.get_temporary_link(path))
            .await
    }

    pub fn logout(&self) {
        self.tokens.logout();
        info!(path = %self.config.state_file.display(), "saved session removed");
    }
}

/// Lists the photos under `folder`, taking one rate-limit slot per page.
pub async fn list_photos_paced<T: Transport>(
    files: &FilesClient<T>,
    limiter: &RateLimiter,
    folder: &str,
) -> Result<Vec<Photo>, FilesError> {
    if !is_absolute_path(folder) {
        return Err(FilesError::InvalidPath(folder.to_string()));
    }
    let mut page = limiter
        .with_rate_limit(|| files.list_folder(folder, Some(LIST_FOLDER_PAGE_LIMIT)))
        .await?;
    let mut entries = std::mem::take(&mut page.entries);
    let mut pages = 1usize;
    while page.has_more {
        let Some(cursor) = page.cursor.take() else {
            break;
        };
        page = limiter
            .with_rate_limit(|| files.list_folder_continue(&cursor))
            .await?;
        entries.append(&mut page.entries);
        pages += 1;
    }
    debug!(folder, pages, entries = entries.len(), "folder listed");
    Ok(photos_from_entries(entries))
}
