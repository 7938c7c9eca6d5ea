//! Google Drive API client.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use lexisync_common::{Error, Result};

use super::auth::Transport;
use crate::provider::{DriveApi, ListQuery, Media, NewFile, RemoteFile, FILE_FIELDS};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Characters escaped in a file ID path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    #[serde(default)]
    files: Vec<RemoteFile>,
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    /// Create a client against the public Drive v3 endpoints.
    pub fn new() -> Result<Self> {
        Self::with_base_urls(DRIVE_API_BASE, DRIVE_UPLOAD_BASE)
    }

    /// Create a client against custom endpoints.
    pub fn with_base_urls(api_base: impl Into<String>, upload_base: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("LexiSync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            upload_base: upload_base.into().trim_end_matches('/').to_string(),
        })
    }

    fn file_url(&self, file_id: &str) -> String {
        format!(
            "{}/files/{}",
            self.api_base,
            utf8_percent_encode(file_id, PATH_SEGMENT)
        )
    }

    /// Create a metadata-only object (folders).
    async fn create_metadata(&self, transport: &Transport, file: &NewFile) -> Result<RemoteFile> {
        let url = format!("{}/files", self.api_base);

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, transport.authorization_header())
            .query(&[("fields", FILE_FIELDS)])
            .json(file)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to create file: {}", e)))?;

        self.handle_response(response).await
    }

    /// Create an object with content in one multipart request.
    async fn create_multipart(
        &self,
        transport: &Transport,
        file: &NewFile,
        media: Media,
    ) -> Result<RemoteFile> {
        let url = format!("{}/files", self.upload_base);
        let metadata_json = serde_json::to_string(file)?;

        let boundary = format!("lexisync-{}", Uuid::new_v4().simple());
        let mut body = Vec::with_capacity(media.data.len() + metadata_json.len() + 256);

        // Metadata part
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata_json.as_bytes());
        body.extend_from_slice(b"\r\n");

        // Data part
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", media.mime_type).as_bytes());
        body.extend_from_slice(&media.data);
        body.extend_from_slice(b"\r\n");

        // End boundary
        body.extend_from_slice(format!("--{}--", boundary).as_bytes());

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, transport.authorization_header())
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload file: {}", e)))?;

        self.handle_response(response).await
    }

    /// Map an error status to the common error type.
    async fn error_for_status(response: reqwest::Response) -> Error {
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            Error::NotFound("Resource not found".to_string())
        } else if status == StatusCode::UNAUTHORIZED {
            Error::NotAuthenticated
        } else if status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            Error::PermissionDenied(format!("Access denied: {}", body))
        } else {
            let body = response.text().await.unwrap_or_default();
            Error::Network(format!("API error: {} - {}", status, body))
        }
    }

    /// Handle API response with error checking.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
        } else {
            Err(Self::error_for_status(response).await)
        }
    }
}

#[async_trait]
impl DriveApi for DriveClient {
    fn name(&self) -> &str {
        "gdrive"
    }

    async fn list(&self, transport: &Transport, query: &ListQuery) -> Result<Vec<RemoteFile>> {
        let url = format!("{}/files", self.api_base);
        let fields = format!("files({})", FILE_FIELDS);
        let page_size = query.page_size.to_string();

        debug!(q = %query.q, page_size = query.page_size, "files.list");

        let mut request = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, transport.authorization_header())
            .query(&[
                ("q", query.q.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", page_size.as_str()),
                ("spaces", "drive"),
            ]);

        if let Some(order_by) = &query.order_by {
            request = request.query(&[("orderBy", order_by.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to list files: {}", e)))?;

        let list_response: FileListResponse = self.handle_response(response).await?;
        Ok(list_response.files)
    }

    async fn create(
        &self,
        transport: &Transport,
        file: &NewFile,
        media: Option<Media>,
    ) -> Result<RemoteFile> {
        debug!(name = %file.name, "files.create");

        match media {
            Some(media) => self.create_multipart(transport, file, media).await,
            None => self.create_metadata(transport, file).await,
        }
    }

    async fn get_metadata(&self, transport: &Transport, file_id: &str) -> Result<RemoteFile> {
        debug!(file_id, "files.get");

        let response = self
            .http
            .get(self.file_url(file_id))
            .header(header::AUTHORIZATION, transport.authorization_header())
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to get file: {}", e)))?;

        self.handle_response(response).await
    }

    async fn get_media(&self, transport: &Transport, file_id: &str) -> Result<Vec<u8>> {
        debug!(file_id, "files.get media");

        let response = self
            .http
            .get(self.file_url(file_id))
            .header(header::AUTHORIZATION, transport.authorization_header())
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to download file: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Network(format!("Failed to read download response: {}", e)))
    }

    async fn delete(&self, transport: &Transport, file_id: &str) -> Result<()> {
        debug!(file_id, "files.delete");

        let response = self
            .http
            .delete(self.file_url(file_id))
            .header(header::AUTHORIZATION, transport.authorization_header())
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to delete file: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_for_status(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdrive::auth::TokenSet;
    use chrono::{Duration, Utc};
    use lexisync_common::SecretString;
    use wiremock::matchers::{body_string_contains, header as header_is, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> Transport {
        Transport::from_tokens(&TokenSet {
            access_token: SecretString::new("T1"),
            refresh_token: None,
            expiry_date: Utc::now() + Duration::hours(1),
            token_type: "Bearer".to_string(),
        })
    }

    fn client_for(server: &MockServer) -> DriveClient {
        DriveClient::with_base_urls(
            format!("{}/drive/v3", server.uri()),
            format!("{}/upload/drive/v3", server.uri()),
        )
        .unwrap()
    }

    fn file_json(id: &str, name: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": name,
            "mimeType": "application/octet-stream",
            "modifiedTime": "2024-05-01T10:00:00Z",
            "size": "5",
            "webViewLink": format!("https://drive.google.com/file/d/{}/view", id)
        })
    }

    #[tokio::test]
    async fn test_list_sends_query_and_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(header_is("authorization", "Bearer T1"))
            .and(query_param("q", "trashed=false"))
            .and(query_param("pageSize", "100"))
            .and(query_param("orderBy", "modifiedTime desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [file_json("a", "one.bin"), file_json("b", "two.bin")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let query = ListQuery::new("trashed=false", 100).ordered_by("modifiedTime desc");
        let files = client_for(&server).list(&transport(), &query).await.unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].id, "a");
        assert_eq!(files[1].name, "two.bin");
    }

    #[tokio::test]
    async fn test_create_multipart_upload() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .and(query_param("uploadType", "multipart"))
            .and(body_string_contains("\"name\":\"profile.json\""))
            .and(body_string_contains("Content-Type: application/json\r\n\r\n{\"words\":[]}"))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_json("new1", "profile.json")))
            .expect(1)
            .mount(&server)
            .await;

        let file = NewFile {
            name: "profile.json".to_string(),
            mime_type: Some("application/json".to_string()),
            ..NewFile::default()
        };
        let media = Media {
            mime_type: "application/json".to_string(),
            data: br#"{"words":[]}"#.to_vec(),
        };

        let created = client_for(&server)
            .create(&transport(), &file, Some(media))
            .await
            .unwrap();
        assert_eq!(created.id, "new1");
    }

    #[tokio::test]
    async fn test_create_folder_uses_metadata_endpoint() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/drive/v3/files"))
            .and(body_string_contains("application/vnd.google-apps.folder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "folder1",
                "name": "Backups",
                "mimeType": "application/vnd.google-apps.folder"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let folder = client_for(&server)
            .create(&transport(), &NewFile::folder("Backups", None), None)
            .await
            .unwrap();
        assert!(folder.is_folder());
    }

    #[tokio::test]
    async fn test_get_media() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/drive/v3/files/abc"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;

        let data = client_for(&server)
            .get_media(&transport(), "abc")
            .await
            .unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/drive/v3/files/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/secret"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/locked"))
            .respond_with(ResponseTemplate::new(403).set_body_string("quota"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(matches!(
            client.delete(&transport(), "missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            client.get_metadata(&transport(), "secret").await,
            Err(Error::NotAuthenticated)
        ));
        assert!(matches!(
            client.get_media(&transport(), "locked").await,
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_provider_name() {
        let base = "http://127.0.0.1:1";
        let client = DriveClient::with_base_urls(base, base).unwrap();
        assert_eq!(client.name(), "gdrive");
        assert_eq!(crate::MemoryDrive::new().name(), "memory");
    }

    #[test]
    fn test_file_url_escapes_id() {
        let client = DriveClient::new().unwrap();
        assert_eq!(
            client.file_url("a/b c"),
            "https://www.googleapis.com/drive/v3/files/a%2Fb%20c"
        );
        assert_eq!(
            client.file_url("1A-b_c.d"),
            "https://www.googleapis.com/drive/v3/files/1A-b_c.d"
        );
    }
}
