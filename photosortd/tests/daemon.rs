use std::path::{Path, PathBuf};

use photosort_core::FilesError;
use photosortd::auth::{AuthState, Credentials, LoginProgress};
use photosortd::config::AppConfig;
use photosortd::daemon::DaemonRuntime;
use photosortd::moves::MoveError;
use photosortd::storage::StateFile;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    server: MockServer,
    _dir: TempDir,
    state_file: PathBuf,
}

impl Fixture {
    async fn logged_in(access_token: &str) -> Self {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("auth.json");
        StateFile::new(&state_file)
            .save(&AuthState {
                credentials: Some(Credentials {
                    access_token: access_token.into(),
                    refresh_token: Some("refresh-1".into()),
                    expires_at: None,
                    scope: None,
                    token_type: Some("bearer".into()),
                }),
                login: LoginProgress::NotInProgress,
            })
            .unwrap();
        Self {
            server,
            _dir: dir,
            state_file,
        }
    }

    fn runtime(&self) -> DaemonRuntime {
        let uri = self.server.uri();
        let state_file = self.state_file.display().to_string();
        let vars = [
            ("PHOTOSORT_API_BASE_URL", uri.as_str()),
            ("PHOTOSORT_OAUTH_BASE_URL", uri.as_str()),
            ("PHOTOSORT_AUTHORIZE_BASE_URL", uri.as_str()),
            ("PHOTOSORT_CLIENT_ID", "client-id"),
            ("PHOTOSORT_STATE_FILE", state_file.as_str()),
            ("PHOTOSORT_RATE_LIMIT_WINDOW_MS", "10"),
            ("PHOTOSORT_RETRY_BASE_MS", "20"),
        ];
        let config = AppConfig::from_lookup(
            |name| {
                vars.iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| value.to_string())
            },
            Path::new("/home/alice"),
        );
        DaemonRuntime::bootstrap(config).unwrap()
    }

    async fn mount_refresh(&self, status: u16) {
        let response = if status == 200 {
            ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-token",
                "token_type": "bearer",
                "expires_in": 14400
            }))
        } else {
            ResponseTemplate::new(status).set_body_string("invalid_grant")
        };
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(response)
            .mount(&self.server)
            .await;
    }

    async fn move_calls(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == "/2/files/move_v2")
            .count()
    }
}

fn moved() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "metadata": {
            ".tag": "file",
            "name": "a.jpg",
            "id": "id:a",
            "path_lower": "/sorted/a.jpg"
        }
    }))
}

fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
}

#[tokio::test]
async fn expired_token_is_refreshed_and_the_move_retried() {
    let fixture = Fixture::logged_in("old-token").await;
    Mock::given(method("POST"))
        .and(path("/2/files/move_v2"))
        .and(header("authorization", "Bearer old-token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired_access_token"))
        .mount(&fixture.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/move_v2"))
        .and(header("authorization", "Bearer new-token"))
        .and(body_json(json!({ "from_path": "/a.jpg", "to_path": "/sorted/a.jpg" })))
        .respond_with(moved())
        .mount(&fixture.server)
        .await;
    fixture.mount_refresh(200).await;
    let runtime = fixture.runtime();

    let reports = runtime.move_all(&pairs(&[("/a.jpg", "/sorted/a.jpg")])).await;

    let result = reports[0].outcome.as_ref().unwrap();
    assert_eq!(
        result.metadata.as_ref().unwrap().path_lower.as_deref(),
        Some("/sorted/a.jpg")
    );
    assert_eq!(fixture.move_calls().await, 2);
    let saved = StateFile::new(&fixture.state_file).load().unwrap().unwrap();
    assert_eq!(saved.access_token(), Some("new-token"));
}

#[tokio::test]
async fn rejected_session_logs_out_without_retrying_the_move() {
    let fixture = Fixture::logged_in("revoked-token").await;
    Mock::given(method("POST"))
        .and(path("/2/files/move_v2"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_access_token"))
        .mount(&fixture.server)
        .await;
    fixture.mount_refresh(400).await;
    let runtime = fixture.runtime();

    let reports = runtime.move_all(&pairs(&[("/a.jpg", "/b.jpg")])).await;

    assert!(matches!(
        reports[0].outcome,
        Err(MoveError::Failed(FilesError::SessionEnded))
    ));
    assert_eq!(fixture.move_calls().await, 1);
    assert!(!runtime.tokens().is_logged_in());
    assert!(StateFile::new(&fixture.state_file).load().unwrap().is_none());
}

#[tokio::test]
async fn throttled_move_is_retried_until_it_succeeds() {
    let fixture = Fixture::logged_in("token").await;
    Mock::given(method("POST"))
        .and(path("/2/files/move_v2"))
        .respond_with(ResponseTemplate::new(429).set_body_string("too_many_requests"))
        .up_to_n_times(2)
        .mount(&fixture.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/move_v2"))
        .respond_with(moved())
        .mount(&fixture.server)
        .await;
    let runtime = fixture.runtime();

    let reports = runtime.move_all(&pairs(&[("/a.jpg", "/sorted/a.jpg")])).await;

    assert!(reports[0].outcome.is_ok());
    assert_eq!(fixture.move_calls().await, 3);
}

#[tokio::test]
async fn application_error_fails_one_move_and_not_the_others() {
    let fixture = Fixture::logged_in("token").await;
    Mock::given(method("POST"))
        .and(path("/2/files/move_v2"))
        .and(body_json(json!({ "from_path": "/missing.jpg", "to_path": "/x.jpg" })))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "from_lookup/not_found/..",
            "error": { ".tag": "from_lookup" }
        })))
        .mount(&fixture.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/move_v2"))
        .respond_with(moved())
        .mount(&fixture.server)
        .await;
    let runtime = fixture.runtime();

    let reports = runtime
        .move_all(&pairs(&[
            ("/missing.jpg", "/x.jpg"),
            ("relative.jpg", "/y.jpg"),
            ("/a.jpg", "/sorted/a.jpg"),
        ]))
        .await;

    assert!(matches!(
        reports[0].outcome,
        Err(MoveError::Failed(FilesError::Application { ref tag, .. })) if tag == "from_lookup"
    ));
    assert!(matches!(
        reports[1].outcome,
        Err(MoveError::InvalidPath { ref path }) if path == "relative.jpg"
    ));
    assert!(reports[2].outcome.is_ok());
    assert_eq!(fixture.move_calls().await, 2);
}

#[tokio::test]
async fn lists_photos_through_the_authenticated_client() {
    let fixture = Fixture::logged_in("token").await;
    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .and(header("authorization", "Bearer token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                {
                    ".tag": "file",
                    "name": "old.jpg",
                    "id": "id:old",
                    "path_lower": "/photos/old.jpg",
                    "client_modified": "2023-01-01T00:00:00Z"
                },
                {
                    ".tag": "file",
                    "name": "new.png",
                    "id": "id:new",
                    "path_lower": "/photos/new.png",
                    "client_modified": "2024-01-01T00:00:00Z"
                },
                { ".tag": "folder", "name": "nested", "path_lower": "/photos/nested" }
            ],
            "cursor": "c1",
            "has_more": false
        })))
        .mount(&fixture.server)
        .await;
    let runtime = fixture.runtime();

    let photos = runtime.list_photos("/Photos").await.unwrap();

    let names: Vec<_> = photos.iter().map(|photo| photo.name.as_str()).collect();
    assert_eq!(names, vec!["new.png", "old.jpg"]);
}
