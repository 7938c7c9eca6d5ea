//! File operations against the user's drive.
//!
//! Every operation passes the session's authentication gate first and
//! never reaches the provider without a valid token. Write operations
//! report failures through result objects, read operations through
//! absent values, so callers can render a message without matching on
//! errors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use lexisync_common::{Error, Result};

use super::auth::Transport;
use super::session::AuthSessionManager;
use crate::provider::{DriveApi, ListQuery, Media, NewFile, RemoteFile, FOLDER_MIME_TYPE};

/// App property key marking files created by this application.
pub const APP_PROPERTY_KEY: &str = "app";

const BINARY_MIME_TYPE: &str = "application/octet-stream";
const TEXT_MIME_TYPE: &str = "application/json";

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Value of the app property tagged on uploads and used by default listings.
    pub app_tag: String,
    /// Default page size for listings.
    pub page_size: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            app_tag: "lexisync".to_string(),
            page_size: 100,
        }
    }
}

/// Content of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadContent {
    Binary(Vec<u8>),
    Text(String),
}

impl UploadContent {
    /// MIME type used when the caller does not supply one.
    pub fn inferred_mime_type(&self) -> &'static str {
        match self {
            UploadContent::Binary(_) => BINARY_MIME_TYPE,
            UploadContent::Text(_) => TEXT_MIME_TYPE,
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            UploadContent::Binary(data) => data,
            UploadContent::Text(text) => text.into_bytes(),
        }
    }
}

impl From<Vec<u8>> for UploadContent {
    fn from(data: Vec<u8>) -> Self {
        UploadContent::Binary(data)
    }
}

impl From<String> for UploadContent {
    fn from(text: String) -> Self {
        UploadContent::Text(text)
    }
}

impl From<&str> for UploadContent {
    fn from(text: &str) -> Self {
        UploadContent::Text(text.to_string())
    }
}

/// Outcome of an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub success: bool,
    pub file_id: Option<String>,
    pub name: Option<String>,
    /// Browser link to the uploaded file.
    pub url: Option<String>,
    pub size: Option<u64>,
    pub message: Option<String>,
}

impl UploadResult {
    fn uploaded(file: RemoteFile, fallback_size: u64) -> Self {
        let url = file
            .web_view_link
            .clone()
            .unwrap_or_else(|| format!("https://drive.google.com/file/d/{}/view", file.id));

        Self {
            success: true,
            size: Some(file.size_bytes().unwrap_or(fallback_size)),
            file_id: Some(file.id),
            name: Some(file.name),
            url: Some(url),
            message: None,
        }
    }

    fn failed(error: &Error) -> Self {
        Self {
            success: false,
            message: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Outcome of a download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadResult {
    pub success: bool,
    pub content: Option<String>,
    pub message: Option<String>,
}

/// Remote file gateway.
pub struct DriveFileGateway {
    session: Arc<AuthSessionManager>,
    api: Arc<dyn DriveApi>,
    config: GatewayConfig,
}

impl DriveFileGateway {
    /// Create a gateway with the default configuration.
    pub fn new(session: Arc<AuthSessionManager>, api: Arc<dyn DriveApi>) -> Self {
        Self::with_config(session, api, GatewayConfig::default())
    }

    /// Create a gateway with a custom configuration.
    pub fn with_config(
        session: Arc<AuthSessionManager>,
        api: Arc<dyn DriveApi>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            session,
            api,
            config,
        }
    }

    /// Default listing filter: this app's non-trashed binary files.
    pub fn default_query(&self) -> String {
        format!(
            "mimeType='{}' and trashed=false and appProperties has {{ key='{}' and value='{}' }}",
            BINARY_MIME_TYPE,
            APP_PROPERTY_KEY,
            escape_query_value(&self.config.app_tag)
        )
    }

    /// Filter for the non-trashed children of a folder.
    pub fn folder_query(folder_id: &str) -> String {
        format!(
            "'{}' in parents and trashed=false",
            escape_query_value(folder_id)
        )
    }

    /// Gate, then run `operation` with a fresh transport.
    async fn execute<T, F, Fut>(&self, message: &str, operation: F) -> Result<T>
    where
        F: FnOnce(Transport) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.session.is_authenticated().await {
            return Err(Error::NotAuthenticated);
        }
        let transport = self
            .session
            .transport()
            .await
            .ok_or(Error::NotAuthenticated)?;

        operation(transport)
            .await
            .map_err(|e| Error::remote(message, e))
    }

    /// List files, most recently modified first.
    ///
    /// `query` overrides the default filter with a provider-native
    /// expression (see [`DriveFileGateway::folder_query`]).
    ///
    /// # Errors
    /// - `NotAuthenticated` without a valid session
    /// - `RemoteOperationFailed` on provider failures
    pub async fn list_files(
        &self,
        query: Option<&str>,
        page_size: Option<u32>,
    ) -> Result<Vec<RemoteFile>> {
        let query = ListQuery::new(
            query
                .map(str::to_string)
                .unwrap_or_else(|| self.default_query()),
            page_size.unwrap_or(self.config.page_size),
        )
        .ordered_by("modifiedTime desc");

        let api = &self.api;
        let files = self
            .execute("Failed to list files", |transport| async move {
                api.list(&transport, &query).await
            })
            .await?;

        debug!(provider = self.api.name(), "Listed {} files", files.len());
        Ok(files)
    }

    /// Upload content as a new file.
    ///
    /// Always creates a new object; an existing file with the same name
    /// is left alone.
    pub async fn upload_file(
        &self,
        name: &str,
        content: impl Into<UploadContent>,
        folder_id: Option<&str>,
        mime_type: Option<&str>,
    ) -> UploadResult {
        let content = content.into();
        let mime_type = mime_type
            .map(str::to_string)
            .unwrap_or_else(|| content.inferred_mime_type().to_string());
        let data = content.into_bytes();
        let size = data.len() as u64;

        let file = NewFile {
            name: name.to_string(),
            mime_type: Some(mime_type.clone()),
            parents: folder_id.map(|id| vec![id.to_string()]).unwrap_or_default(),
            app_properties: HashMap::from([(
                APP_PROPERTY_KEY.to_string(),
                self.config.app_tag.clone(),
            )]),
        };
        let media = Media { mime_type, data };

        let api = &self.api;
        let result = self
            .execute("Failed to upload file", |transport| async move {
                api.create(&transport, &file, Some(media)).await
            })
            .await;

        match result {
            Ok(remote) => {
                info!(
                    provider = self.api.name(),
                    "Uploaded {} ({} bytes) as {}", remote.name, size, remote.id
                );
                UploadResult::uploaded(remote, size)
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", name, e);
                UploadResult::failed(&e)
            }
        }
    }

    /// Download a file's content as text.
    pub async fn download_file(&self, file_id: &str) -> DownloadResult {
        let api = &self.api;
        let result = self
            .execute("Failed to download file", |transport| async move {
                api.get_media(&transport, file_id).await
            })
            .await;

        match result {
            Ok(data) => {
                debug!("Downloaded {} ({} bytes)", file_id, data.len());
                DownloadResult {
                    success: true,
                    content: Some(String::from_utf8_lossy(&data).into_owned()),
                    message: None,
                }
            }
            Err(e) => {
                warn!("Download of {} failed: {}", file_id, e);
                DownloadResult {
                    success: false,
                    content: None,
                    message: Some(e.to_string()),
                }
            }
        }
    }

    /// Find a folder by exact name under `parent_id`, creating it if absent.
    ///
    /// Not atomic: two concurrent callers may both create the folder.
    ///
    /// # Errors
    /// - `NotAuthenticated` without a valid session
    /// - `RemoteOperationFailed` on provider failures
    pub async fn get_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
        let mut q = format!(
            "mimeType='{}' and name='{}' and trashed=false",
            FOLDER_MIME_TYPE,
            escape_query_value(name)
        );
        if let Some(parent) = parent_id {
            q.push_str(&format!(" and '{}' in parents", escape_query_value(parent)));
        }
        let query = ListQuery::new(q, 1);

        let api = &self.api;
        self.execute("Failed to get folder", |transport| async move {
            if let Some(existing) = api.list(&transport, &query).await?.into_iter().next() {
                debug!("Found folder {} as {}", name, existing.id);
                return Ok(existing.id);
            }

            let folder = api
                .create(&transport, &NewFile::folder(name, parent_id), None)
                .await?;
            info!("Created folder {} as {}", name, folder.id);
            Ok(folder.id)
        })
        .await
    }

    /// Delete a file. Failures are logged and reported as `false`.
    pub async fn delete_file(&self, file_id: &str) -> bool {
        let api = &self.api;
        let result = self
            .execute("Failed to delete file", |transport| async move {
                api.delete(&transport, file_id).await
            })
            .await;

        match result {
            Ok(()) => {
                info!("Deleted {}", file_id);
                true
            }
            Err(e) => {
                warn!("Delete of {} failed: {}", file_id, e);
                false
            }
        }
    }

    /// Metadata of a file, or `None` on any failure.
    pub async fn get_file_metadata(&self, file_id: &str) -> Option<RemoteFile> {
        let api = &self.api;
        self.execute("Failed to get file metadata", |transport| async move {
            api.get_metadata(&transport, file_id).await
        })
        .await
        .map_err(|e| debug!("Metadata lookup for {} failed: {}", file_id, e))
        .ok()
    }
}

/// Escape a literal for use inside single quotes in a query.
fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
