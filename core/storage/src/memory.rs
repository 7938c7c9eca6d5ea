//! In-memory drive for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use lexisync_common::{Error, Result};

use crate::gdrive::auth::Transport;
use crate::provider::{DriveApi, ListQuery, Media, NewFile, RemoteFile};

/// In-memory drive entry.
#[derive(Debug, Clone)]
struct Entry {
    file: RemoteFile,
    app_properties: HashMap<String, String>,
    trashed: bool,
    data: Vec<u8>,
}

/// In-memory drive.
///
/// Understands the subset of the provider query language the gateway
/// emits (`and`-joined equality clauses, `in parents`, `appProperties
/// has`). Records every call with the access token it was made with.
#[derive(Default)]
pub struct MemoryDrive {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    calls: Arc<RwLock<Vec<(String, String)>>>,
}

impl MemoryDrive {
    /// Create an empty drive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation names in call order (`list`, `create`, `get`, `media`, `delete`).
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .read()
            .map(|calls| calls.iter().map(|(op, _)| op.clone()).collect())
            .unwrap_or_default()
    }

    /// Access token used by the most recent call.
    pub fn last_access_token(&self) -> Option<String> {
        self.calls
            .read()
            .ok()
            .and_then(|calls| calls.last().map(|(_, token)| token.clone()))
    }

    /// Move a file to the trash.
    pub fn trash(&self, file_id: &str) -> Result<()> {
        let mut entries = self.write()?;
        let entry = entries
            .get_mut(file_id)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", file_id)))?;
        entry.trashed = true;
        Ok(())
    }

    /// Number of stored objects, trashed ones included.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Check if the drive holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, op: &str, transport: &Transport) -> Result<()> {
        if transport.access_token().is_empty() {
            return Err(Error::NotAuthenticated);
        }
        self.calls
            .write()
            .map_err(|_| Error::Storage("Call log lock poisoned".to_string()))?
            .push((op.to_string(), transport.access_token().to_string()));
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .read()
            .map_err(|_| Error::Storage("Drive lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .write()
            .map_err(|_| Error::Storage("Drive lock poisoned".to_string()))
    }
}

#[async_trait]
impl DriveApi for MemoryDrive {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self, transport: &Transport, query: &ListQuery) -> Result<Vec<RemoteFile>> {
        self.record("list", transport)?;
        let clauses = parse_query(&query.q)?;

        let entries = self.read()?;
        let mut matches: Vec<RemoteFile> = entries
            .values()
            .filter(|entry| clauses.iter().all(|clause| clause.matches(entry)))
            .map(|entry| entry.file.clone())
            .collect();

        match query.order_by.as_deref() {
            Some("modifiedTime desc") => {
                matches.sort_by(|a, b| b.modified_time.cmp(&a.modified_time))
            }
            Some("modifiedTime") => matches.sort_by(|a, b| a.modified_time.cmp(&b.modified_time)),
            Some("name") => matches.sort_by(|a, b| a.name.cmp(&b.name)),
            Some(other) => {
                return Err(Error::InvalidInput(format!("Unsupported orderBy: {}", other)))
            }
            None => {}
        }

        matches.truncate(query.page_size as usize);
        Ok(matches)
    }

    async fn create(
        &self,
        transport: &Transport,
        file: &NewFile,
        media: Option<Media>,
    ) -> Result<RemoteFile> {
        self.record("create", transport)?;

        let id = Uuid::new_v4().simple().to_string();
        let mime_type = file
            .mime_type
            .clone()
            .or_else(|| media.as_ref().map(|m| m.mime_type.clone()))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let data = media.map(|m| m.data).unwrap_or_default();

        let remote = RemoteFile {
            id: id.clone(),
            name: file.name.clone(),
            size: (mime_type != crate::provider::FOLDER_MIME_TYPE)
                .then(|| data.len().to_string()),
            mime_type,
            modified_time: Some(Utc::now()),
            parents: file.parents.clone(),
            web_view_link: Some(format!("https://drive.google.com/file/d/{}/view", id)),
        };

        self.write()?.insert(
            id,
            Entry {
                file: remote.clone(),
                app_properties: file.app_properties.clone(),
                trashed: false,
                data,
            },
        );

        Ok(remote)
    }

    async fn get_metadata(&self, transport: &Transport, file_id: &str) -> Result<RemoteFile> {
        self.record("get", transport)?;
        self.read()?
            .get(file_id)
            .map(|entry| entry.file.clone())
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", file_id)))
    }

    async fn get_media(&self, transport: &Transport, file_id: &str) -> Result<Vec<u8>> {
        self.record("media", transport)?;
        match self.read()?.get(file_id) {
            Some(entry) if entry.file.is_folder() => Err(Error::InvalidInput(
                "Cannot download a folder".to_string(),
            )),
            Some(entry) => Ok(entry.data.clone()),
            None => Err(Error::NotFound(format!("File not found: {}", file_id))),
        }
    }

    async fn delete(&self, transport: &Transport, file_id: &str) -> Result<()> {
        self.record("delete", transport)?;
        self.write()?
            .remove(file_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", file_id)))
    }
}

/// One `and`-joined term of a list query.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    Trashed(bool),
    MimeType(String),
    Name(String),
    InParents(String),
    AppProperty { key: String, value: String },
}

impl Clause {
    fn matches(&self, entry: &Entry) -> bool {
        match self {
            Clause::Trashed(trashed) => entry.trashed == *trashed,
            Clause::MimeType(mime) => &entry.file.mime_type == mime,
            Clause::Name(name) => &entry.file.name == name,
            Clause::InParents(parent) => entry.file.parents.iter().any(|p| p == parent),
            Clause::AppProperty { key, value } => {
                entry.app_properties.get(key).is_some_and(|v| v == value)
            }
        }
    }
}

fn parse_query(q: &str) -> Result<Vec<Clause>> {
    split_top_level(q)
        .into_iter()
        .filter(|clause| !clause.is_empty())
        .map(|clause| parse_clause(&clause))
        .collect()
}

/// Split on ` and ` outside quotes and braces.
fn split_top_level(q: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut escaped = false;
    let mut depth = 0usize;
    let mut rest = q;

    while let Some(c) = rest.chars().next() {
        if !in_quote && depth == 0 && rest.starts_with(" and ") {
            clauses.push(current.trim().to_string());
            current.clear();
            rest = &rest[" and ".len()..];
            continue;
        }

        match c {
            _ if escaped => escaped = false,
            '\\' if in_quote => escaped = true,
            '\'' => in_quote = !in_quote,
            '{' if !in_quote => depth += 1,
            '}' if !in_quote => depth = depth.saturating_sub(1),
            _ => {}
        }

        current.push(c);
        rest = &rest[c.len_utf8()..];
    }

    clauses.push(current.trim().to_string());
    clauses
}

/// Parse `'value'` with backslash escapes.
fn parse_quoted(s: &str) -> Option<String> {
    let inner = s.trim().strip_prefix('\'')?.strip_suffix('\'')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

fn parse_clause(clause: &str) -> Result<Clause> {
    let unsupported = || Error::InvalidInput(format!("Unsupported query clause: {}", clause));

    if let Some(inner) = clause
        .strip_prefix("appProperties has {")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        let mut key = None;
        let mut value = None;
        for part in split_top_level(inner.trim()) {
            let (field, literal) = part.split_once('=').ok_or_else(unsupported)?;
            match field.trim() {
                "key" => key = parse_quoted(literal),
                "value" => value = parse_quoted(literal),
                _ => return Err(unsupported()),
            }
        }
        return match (key, value) {
            (Some(key), Some(value)) => Ok(Clause::AppProperty { key, value }),
            _ => Err(unsupported()),
        };
    }

    if let Some(parent) = clause.strip_suffix(" in parents") {
        return parse_quoted(parent)
            .map(Clause::InParents)
            .ok_or_else(unsupported);
    }

    let (field, literal) = clause.split_once('=').ok_or_else(unsupported)?;
    match field.trim() {
        "trashed" => match literal.trim() {
            "true" => Ok(Clause::Trashed(true)),
            "false" => Ok(Clause::Trashed(false)),
            _ => Err(unsupported()),
        },
        "mimeType" => parse_quoted(literal)
            .map(Clause::MimeType)
            .ok_or_else(unsupported),
        "name" => parse_quoted(literal).map(Clause::Name).ok_or_else(unsupported),
        _ => Err(unsupported()),
    }
}
