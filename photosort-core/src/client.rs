use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{ApiRequest, ApiResponse, Transport, TransportError};

pub const SUPPORTED_PHOTO_EXTENSIONS: &[&str] = &[".png", ".jpg"];

pub const LIST_FOLDER_PAGE_LIMIT: u32 = 2000;

#[derive(Debug, Error)]
pub enum FilesError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("{}", describe_application_error(.tag, .summary.as_deref()))]
    Application {
        status: StatusCode,
        tag: String,
        summary: Option<String>,
    },
    #[error("session ended: the user was logged out")]
    SessionEnded,
    #[error("path must start with '/': {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Typed access to the file endpoints of the remote API.
///
/// Every call goes through the wrapped [`Transport`], so authentication and
/// logging concerns live in whatever transport stack the caller builds.
#[derive(Clone)]
pub struct FilesClient<T> {
    transport: T,
}

impl<T: Transport> FilesClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub async fn move_file(&self, from: &str, to: &str) -> Result<MoveResult, FilesError> {
        self.call(
            "/2/files/move_v2",
            &MoveFileRequest {
                from_path: from,
                to_path: to,
            },
        )
        .await
    }

    pub async fn list_folder(
        &self,
        path: &str,
        limit: Option<u32>,
    ) -> Result<FolderPage, FilesError> {
        self.call("/2/files/list_folder", &ListFolderRequest { path, limit })
            .await
    }

    pub async fn list_folder_continue(&self, cursor: &str) -> Result<FolderPage, FilesError> {
        self.call(
            "/2/files/list_folder/continue",
            &ListFolderContinueRequest { cursor },
        )
        .await
    }

    pub async fn list_folder_all(&self, path: &str) -> Result<Vec<FileMetadata>, FilesError> {
        let mut page = self
            .list_folder(path, Some(LIST_FOLDER_PAGE_LIMIT))
            .await?;
        let mut entries = std::mem::take(&mut page.entries);
        while page.has_more {
            let Some(cursor) = page.cursor.take() else {
                break;
            };
            page = self.list_folder_continue(&cursor).await?;
            entries.append(&mut page.entries);
        }
        Ok(entries)
    }

    /// Lists supported photos under `path`, newest first.
    pub async fn list_photos(&self, path: &str) -> Result<Vec<Photo>, FilesError> {
        require_absolute(path)?;
        Ok(photos_from_entries(self.list_folder_all(path).await?))
    }

    pub async fn get_temporary_link(&self, path: &str) -> Result<String, FilesError> {
        require_absolute(path)?;
        let link: TemporaryLinkResponse = self
            .call("/2/files/get_temporary_link", &TemporaryLinkRequest { path })
            .await?;
        Ok(link.link)
    }

    async fn call<B, R>(&self, path: &str, body: &B) -> Result<R, FilesError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = ApiRequest::post_json(path, body)?;
        let response = self.transport.send(request).await?;
        Self::handle_response(response)
    }

    fn handle_response<R: DeserializeOwned>(response: ApiResponse) -> Result<R, FilesError> {
        if response.is_session_ended() {
            return Err(FilesError::SessionEnded);
        }
        let status = response.status;
        // Throttling wins over whatever the body says.
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FilesError::Api {
                status,
                body: response.body,
            });
        }
        let body = if response.body.trim().is_empty() {
            "{}"
        } else {
            response.body.as_str()
        };
        if let Ok(ErrorEnvelope {
            error: Some(error),
            error_summary,
        }) = serde_json::from_str::<ErrorEnvelope>(body)
        {
            return Err(FilesError::Application {
                status,
                tag: error.tag,
                summary: error_summary,
            });
        }
        if status.is_success() {
            Ok(serde_json::from_str::<R>(body)?)
        } else {
            Err(FilesError::Api {
                status,
                body: response.body,
            })
        }
    }
}

impl FilesError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            FilesError::Api { status, .. } => Some(classify_api_status(*status)),
            FilesError::Application { .. } => Some(ApiErrorClass::Permanent),
            FilesError::SessionEnded => Some(ApiErrorClass::Auth),
            _ => None,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::RateLimit))
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn describe_application_error(tag: &str, summary: Option<&str>) -> String {
    match summary {
        Some(summary) => format!("{tag}: {summary}"),
        None => tag.to_string(),
    }
}

pub fn is_absolute_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Keeps the supported photo files among `entries`, newest first.
pub fn photos_from_entries(entries: Vec<FileMetadata>) -> Vec<Photo> {
    let mut photos: Vec<Photo> = entries
        .into_iter()
        .filter_map(Photo::from_metadata)
        .filter(|photo| {
            SUPPORTED_PHOTO_EXTENSIONS
                .iter()
                .any(|ext| photo.path.ends_with(ext))
        })
        .collect();
    photos.sort_by(|a, b| b.upload_date.cmp(&a.upload_date));
    photos
}

fn require_absolute(path: &str) -> Result<(), FilesError> {
    if is_absolute_path(path) {
        Ok(())
    } else {
        Err(FilesError::InvalidPath(path.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct MoveFileRequest<'a> {
    from_path: &'a str,
    to_path: &'a str,
}

#[derive(Debug, Serialize)]
struct ListFolderRequest<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ListFolderContinueRequest<'a> {
    cursor: &'a str,
}

#[derive(Debug, Serialize)]
struct TemporaryLinkRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Deserialize)]
struct TemporaryLinkResponse {
    link: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ApiErrorTag>,
    #[serde(default)]
    error_summary: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ApiErrorTag {
    #[serde(rename = ".tag")]
    pub tag: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MoveResult {
    #[serde(default)]
    pub metadata: Option<FileMetadata>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FolderPage {
    pub entries: Vec<FileMetadata>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileMetadata {
    #[serde(rename = ".tag", default)]
    pub tag: Option<EntryTag>,
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub client_modified: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryTag {
    File,
    Folder,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    pub name: String,
    pub id: String,
    pub path: String,
    pub upload_date: String,
}

impl Photo {
    fn from_metadata(entry: FileMetadata) -> Option<Self> {
        if entry.tag != Some(EntryTag::File) {
            return None;
        }
        Some(Self {
            id: entry.id?,
            path: entry.path_lower?,
            upload_date: entry.client_modified.unwrap_or_default(),
            name: entry.name,
        })
    }
}
