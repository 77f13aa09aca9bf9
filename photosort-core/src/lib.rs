mod client;
mod oauth;
mod transport;

pub use client::{
    ApiErrorClass, ApiErrorTag, EntryTag, FileMetadata, FilesClient, FilesError, FolderPage,
    LIST_FOLDER_PAGE_LIMIT, MoveResult, Photo, SUPPORTED_PHOTO_EXTENSIONS, is_absolute_path,
    photos_from_entries,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
pub use reqwest::{Method, StatusCode};
pub use transport::{
    ApiRequest, ApiResponse, DEFAULT_API_BASE_URL, HttpTransport, Transport, TransportError,
};
