use super::{CloudStorage, OBJECT_PREFIX, create_file, flush, write_chunk};
use crate::config::CloudProvider;
use crate::errors::CloudError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use url::Url;

const API_BASE: &str = "https://api.dropboxapi.com";
const CONTENT_BASE: &str = "https://content.dropboxapi.com";

/// Largest body `files/upload` accepts; bigger files go through an upload session.
const SINGLE_UPLOAD_LIMIT: u64 = 150 * 1024 * 1024;
const SESSION_CHUNK: usize = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct FileMetadata {
    path_display: Option<String>,
    path_lower: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct Account {
    email: Option<String>,
    name: Option<AccountName>,
}

#[derive(Debug, Deserialize)]
struct AccountName {
    display_name: Option<String>,
}

/// Dropbox HTTP API v2 with a long-lived access token.
#[derive(Clone)]
pub struct DropboxStorage {
    http: Client,
    access_token: String,
    api_base: String,
    content_base: String,
}

impl std::fmt::Debug for DropboxStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropboxStorage")
            .field("api_base", &self.api_base)
            .field("content_base", &self.content_base)
            .finish_non_exhaustive()
    }
}

impl DropboxStorage {
    pub fn new(access_token: &str) -> Self {
        Self::with_endpoints(access_token, API_BASE, CONTENT_BASE)
    }

    pub fn with_endpoints(access_token: &str, api_base: &str, content_base: &str) -> Self {
        Self {
            http: Client::new(),
            access_token: access_token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            content_base: content_base.trim_end_matches('/').to_string(),
        }
    }

    fn content_request(&self, endpoint: &str, arg: serde_json::Value) -> RequestBuilder {
        self.http
            .post(format!("{}/2/{endpoint}", self.content_base))
            .bearer_auth(&self.access_token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
    }

    async fn send(&self, action: &str, request: RequestBuilder) -> Result<Response, CloudError> {
        let response = request
            .send()
            .await
            .map_err(|e| CloudError::Transport(format!("{action}: {e}")))?;
        check_status(action, response).await
    }

    async fn upload_single(&self, local: &Path, path: &str) -> Result<FileMetadata, CloudError> {
        let body = tokio::fs::read(local)
            .await
            .map_err(|e| CloudError::LocalFile(format!("cannot read {}: {e}", local.display())))?;
        let request = self
            .content_request("files/upload", commit_info(path))
            .body(body);
        parse_json("files/upload", self.send("files/upload", request).await?).await
    }

    async fn upload_session(&self, local: &Path, path: &str) -> Result<FileMetadata, CloudError> {
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| CloudError::LocalFile(format!("cannot open {}: {e}", local.display())))?;

        let first = read_chunk(&mut file, local).await?;
        let mut offset = first.len() as u64;
        let request = self
            .content_request("files/upload_session/start", json!({ "close": false }))
            .body(first);
        let session: SessionStart = parse_json(
            "upload_session/start",
            self.send("upload_session/start", request).await?,
        )
        .await?;
        debug!(session = %session.session_id, "Dropbox upload session started");

        loop {
            let chunk = read_chunk(&mut file, local).await?;
            let cursor = json!({ "session_id": session.session_id, "offset": offset });
            if chunk.len() < SESSION_CHUNK {
                let request = self
                    .content_request(
                        "files/upload_session/finish",
                        json!({ "cursor": cursor, "commit": commit_info(path) }),
                    )
                    .body(chunk);
                return parse_json(
                    "upload_session/finish",
                    self.send("upload_session/finish", request).await?,
                )
                .await;
            }
            offset += chunk.len() as u64;
            let request = self
                .content_request(
                    "files/upload_session/append_v2",
                    json!({ "cursor": cursor, "close": false }),
                )
                .body(chunk);
            self.send("upload_session/append_v2", request).await?;
        }
    }
}

fn commit_info(path: &str) -> serde_json::Value {
    json!({ "path": path, "mode": "add", "autorename": true, "mute": false })
}

async fn read_chunk(file: &mut tokio::fs::File, local: &Path) -> Result<Vec<u8>, CloudError> {
    let mut buf = Vec::with_capacity(SESSION_CHUNK);
    file.take(SESSION_CHUNK as u64)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| CloudError::LocalFile(format!("cannot read {}: {e}", local.display())))?;
    Ok(buf)
}

async fn check_status(action: &str, response: Response) -> Result<Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(action, status, &body))
}

fn classify_status(action: &str, status: StatusCode, body: &str) -> CloudError {
    let detail = format!("{action} returned {status}: {}", body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Transport(detail),
        _ => CloudError::Provider(detail),
    }
}

async fn parse_json<T: for<'de> Deserialize<'de>>(
    action: &str,
    response: Response,
) -> Result<T, CloudError> {
    response
        .json::<T>()
        .await
        .map_err(|e| CloudError::Provider(format!("{action}: unexpected response: {e}")))
}

/// `dropbox:///backups/x.sql` → `/backups/x.sql`.
pub fn path_from_location(remote: &Url) -> Result<String, CloudError> {
    if remote.scheme() != "dropbox" {
        return Err(CloudError::Configuration(format!(
            "not a Dropbox location: {remote}"
        )));
    }
    let path = percent_encoding::percent_decode_str(remote.path())
        .decode_utf8_lossy()
        .into_owned();
    if path.trim_matches('/').is_empty() {
        return Err(CloudError::Configuration(format!(
            "Dropbox location {remote} has no file path"
        )));
    }
    Ok(path)
}

fn location_for(path: &str) -> Result<Url, CloudError> {
    let mut url = Url::parse("dropbox:///")
        .map_err(|e| CloudError::Configuration(format!("invalid Dropbox location: {e}")))?;
    url.set_path(path);
    Ok(url)
}

#[async_trait]
impl CloudStorage for DropboxStorage {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Dropbox
    }

    async fn upload(&self, local: &Path, filename: &str) -> Result<Url, CloudError> {
        let path = format!("/{OBJECT_PREFIX}/{filename}");
        let size = tokio::fs::metadata(local)
            .await
            .map_err(|e| CloudError::LocalFile(format!("cannot read {}: {e}", local.display())))?
            .len();

        let metadata = if size > SINGLE_UPLOAD_LIMIT {
            info!(size, "Large backup, using a Dropbox upload session");
            self.upload_session(local, &path).await?
        } else {
            self.upload_single(local, &path).await?
        };

        // autorename may have picked a different name.
        let stored = metadata
            .path_display
            .or(metadata.path_lower)
            .unwrap_or(path);
        location_for(&stored)
    }

    async fn test_connection(&self) -> Result<String, CloudError> {
        let request = self
            .http
            .post(format!("{}/2/users/get_current_account", self.api_base))
            .bearer_auth(&self.access_token);
        let response = self.send("users/get_current_account", request).await?;
        let account: Account = parse_json("users/get_current_account", response).await?;
        let who = account
            .name
            .and_then(|n| n.display_name)
            .or(account.email)
            .unwrap_or_else(|| "unknown account".to_string());
        Ok(format!("Connected to Dropbox as {who}"))
    }

    async fn download(&self, remote: &Url, dest: &Path) -> Result<u64, CloudError> {
        let path = path_from_location(remote)?;
        let request = self.content_request("files/download", json!({ "path": path }));
        let mut response = self.send("files/download", request).await?;

        let mut file = create_file(dest).await?;
        let mut total = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CloudError::Transport(format!("files/download: {e}")))?
        {
            write_chunk(&mut file, dest, &chunk).await?;
            total += chunk.len() as u64;
        }
        flush(&mut file, dest).await?;
        Ok(total)
    }

    async fn delete(&self, remote: &Url) -> Result<(), CloudError> {
        let path = path_from_location(remote)?;
        let request = self
            .http
            .post(format!("{}/2/files/delete_v2", self.api_base))
            .bearer_auth(&self.access_token)
            .json(&json!({ "path": path }));
        self.send("files/delete_v2", request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Answers one HTTP request with a canned response and returns the raw request.
    async fn one_shot_server(status_line: &str, body: &str) -> anyhow::Result<(String, tokio::task::JoinHandle<String>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return String::new();
            };
            let mut buf = vec![0u8; 64 * 1024];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });
        Ok((base, handle))
    }

    #[test]
    fn test_location_round_trip() -> anyhow::Result<()> {
        let url = location_for("/backups/backup-2026.sql")?;
        assert_eq!(url.as_str(), "dropbox:///backups/backup-2026.sql");
        assert_eq!(path_from_location(&url)?, "/backups/backup-2026.sql");
        assert!(path_from_location(&Url::parse("dropbox:///")?).is_err());
        assert!(path_from_location(&Url::parse("s3://b/k")?).is_err());
        Ok(())
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status("x", StatusCode::UNAUTHORIZED, "expired"),
            CloudError::Transport(_)
        ));
        assert!(matches!(
            classify_status("x", StatusCode::CONFLICT, "path/conflict"),
            CloudError::Provider(_)
        ));
        assert!(matches!(
            classify_status("x", StatusCode::INTERNAL_SERVER_ERROR, ""),
            CloudError::Provider(_)
        ));
    }

    #[tokio::test]
    async fn test_connection_reports_account_name() -> anyhow::Result<()> {
        let (base, server) = one_shot_server(
            "200 OK",
            r#"{"email":"me@example.com","name":{"display_name":"Media Owner"}}"#,
        )
        .await?;
        let storage = DropboxStorage::with_endpoints("token-abc", &base, &base);
        let message = storage.test_connection().await?;
        assert!(message.contains("Media Owner"));

        let request = server.await?;
        assert!(request.starts_with("POST /2/users/get_current_account"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer token-abc"));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_token_is_transport_error() -> anyhow::Result<()> {
        let (base, _server) =
            one_shot_server("401 Unauthorized", r#"{"error_summary":"invalid_access_token/"}"#).await?;
        let storage = DropboxStorage::with_endpoints("bad", &base, &base);
        let err = storage.test_connection().await.unwrap_err();
        assert!(matches!(err, CloudError::Transport(ref m) if m.contains("invalid_access_token")));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_posts_path() -> anyhow::Result<()> {
        let (base, server) = one_shot_server(
            "200 OK",
            r#"{"metadata":{".tag":"file","name":"backup-x.sql"}}"#,
        )
        .await?;
        let storage = DropboxStorage::with_endpoints("token", &base, &base);
        storage
            .delete(&Url::parse("dropbox:///backups/backup-x.sql")?)
            .await?;

        let request = server.await?;
        assert!(request.starts_with("POST /2/files/delete_v2"));
        assert!(request.contains(r#"{"path":"/backups/backup-x.sql"}"#));
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_sends_commit_arg_and_returns_location() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let local = dir.path().join("backup-x.sql");
        tokio::fs::write(&local, b"-- dump\n").await?;

        let (base, server) = one_shot_server(
            "200 OK",
            r#"{"name":"backup-x.sql","path_display":"/backups/backup-x.sql","path_lower":"/backups/backup-x.sql"}"#,
        )
        .await?;
        let storage = DropboxStorage::with_endpoints("token", &base, &base);
        let url = storage.upload(&local, "backup-x.sql").await?;
        assert_eq!(url.as_str(), "dropbox:///backups/backup-x.sql");

        let request = server.await?;
        assert!(request.starts_with("POST /2/files/upload"));
        assert!(request.contains(r#""path":"/backups/backup-x.sql""#));
        assert!(request.ends_with("-- dump\n"));
        Ok(())
    }
}
