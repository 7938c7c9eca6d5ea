//! Credential persistence for the OAuth2 session.
//!
//! The session manager only needs a last-write-wins key-value contract:
//! load the client credentials, load/save/clear the token blob.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use tracing::debug;

use lexisync_common::{Error, Result};

use crate::gdrive::auth::{Credentials, TokenSet};

const CREDENTIALS_FILE: &str = "credentials.json";
const TOKENS_FILE: &str = "tokens.json";

/// Persistent store for client credentials and tokens.
pub trait CredentialStore: Send + Sync {
    /// Load the client credentials, if configured.
    fn load_credentials(&self) -> Result<Option<Credentials>>;

    /// Load the last persisted tokens, if any.
    fn load_tokens(&self) -> Result<Option<TokenSet>>;

    /// Persist tokens, replacing any previous value.
    fn save_tokens(&self, tokens: &TokenSet) -> Result<()>;

    /// Remove persisted tokens. Succeeds when nothing is stored.
    fn clear_tokens(&self) -> Result<()>;
}

/// In-memory credential store.
///
/// Useful for tests and for embedding hosts that persist elsewhere.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: Option<Credentials>,
    tokens: Mutex<Option<TokenSet>>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Seed persisted tokens.
    pub fn with_tokens(self, tokens: TokenSet) -> Self {
        if let Ok(mut slot) = self.tokens.lock() {
            *slot = Some(tokens);
        }
        self
    }

    /// Current persisted tokens.
    pub fn snapshot(&self) -> Option<TokenSet> {
        self.tokens.lock().ok().and_then(|slot| slot.clone())
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<TokenSet>>> {
        self.tokens
            .lock()
            .map_err(|_| Error::Storage("Token store lock poisoned".to_string()))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_credentials(&self) -> Result<Option<Credentials>> {
        Ok(self.credentials.clone())
    }

    fn load_tokens(&self) -> Result<Option<TokenSet>> {
        Ok(self.slot()?.clone())
    }

    fn save_tokens(&self, tokens: &TokenSet) -> Result<()> {
        *self.slot()? = Some(tokens.clone());
        Ok(())
    }

    fn clear_tokens(&self) -> Result<()> {
        *self.slot()? = None;
        Ok(())
    }
}

/// JSON file credential store.
///
/// Keeps `credentials.json` and `tokens.json` in one directory. Token
/// writes go through a temporary file and a rename so a crash never
/// leaves a truncated token blob behind.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under the platform configuration directory.
    ///
    /// # Errors
    /// - `Configuration` if the platform has no configuration directory
    pub fn default_location() -> Result<Self> {
        let base = dirs::config_dir().ok_or_else(|| {
            Error::Configuration("No configuration directory on this platform".to_string())
        })?;
        Ok(Self::new(base.join("lexisync")))
    }

    /// Directory holding the store files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist client credentials.
    pub fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        self.write_json(CREDENTIALS_FILE, credentials)
    }

    fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        let path = self.dir.join(file);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn write_json<T: serde::Serialize>(&self, file: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let json = serde_json::to_vec_pretty(value)?;
        let target = self.dir.join(file);
        let tmp = self.dir.join(format!(".{}.tmp", file));

        {
            let mut out = fs::File::create(&tmp)?;
            restrict_permissions(&out)?;
            out.write_all(&json)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &target)?;

        debug!("Wrote {}", target.display());
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> Result<()> {
    Ok(())
}

impl CredentialStore for FileCredentialStore {
    fn load_credentials(&self) -> Result<Option<Credentials>> {
        self.read_json(CREDENTIALS_FILE)
    }

    fn load_tokens(&self) -> Result<Option<TokenSet>> {
        self.read_json(TOKENS_FILE)
    }

    fn save_tokens(&self, tokens: &TokenSet) -> Result<()> {
        self.write_json(TOKENS_FILE, tokens)
    }

    fn clear_tokens(&self) -> Result<()> {
        match fs::remove_file(self.dir.join(TOKENS_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
