//! Remote drive API trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use lexisync_common::Result;

use crate::gdrive::auth::Transport;

/// MIME type the provider uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Metadata fields requested for every file.
pub const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,size,parents,webViewLink";

/// Remote file metadata as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    /// File ID.
    pub id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Last modification time.
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    /// File size in bytes, as a decimal string (absent for folders).
    #[serde(default)]
    pub size: Option<String>,
    /// Parent folder IDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    /// Browser link to the file.
    #[serde(default)]
    pub web_view_link: Option<String>,
}

impl RemoteFile {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

/// Parameters of a `files.list` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Provider-native filter expression.
    pub q: String,
    pub page_size: u32,
    pub order_by: Option<String>,
}

impl ListQuery {
    pub fn new(q: impl Into<String>, page_size: u32) -> Self {
        Self {
            q: q.into(),
            page_size,
            order_by: None,
        }
    }

    pub fn ordered_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }
}

/// Metadata of a file to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFile {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub app_properties: HashMap<String, String>,
}

impl NewFile {
    /// Metadata for a folder.
    pub fn folder(name: impl Into<String>, parent_id: Option<&str>) -> Self {
        Self {
            name: name.into(),
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            parents: parent_id.map(|p| vec![p.to_string()]).unwrap_or_default(),
            app_properties: HashMap::new(),
        }
    }
}

/// File content uploaded with a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Document-storage operations of the remote provider.
///
/// Every call receives the transport of the current session; implementations
/// must not keep it between calls.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Get the provider name (e.g., "gdrive", "memory").
    fn name(&self) -> &str;

    /// `files.list`: one page of files matching the query.
    async fn list(&self, transport: &Transport, query: &ListQuery) -> Result<Vec<RemoteFile>>;

    /// `files.create`: a new object, with media body when `media` is given.
    async fn create(
        &self,
        transport: &Transport,
        file: &NewFile,
        media: Option<Media>,
    ) -> Result<RemoteFile>;

    /// `files.get`: metadata of one file.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    async fn get_metadata(&self, transport: &Transport, file_id: &str) -> Result<RemoteFile>;

    /// `files.get` with `alt=media`: raw file content.
    async fn get_media(&self, transport: &Transport, file_id: &str) -> Result<Vec<u8>>;

    /// `files.delete`.
    async fn delete(&self, transport: &Transport, file_id: &str) -> Result<()>;
}
