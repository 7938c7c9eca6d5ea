//! Google Drive session and file gateway for LexiSync.
//!
//! The crate keeps an OAuth2 session alive (consent, persistence,
//! refresh) and exposes a small set of file operations on top of it.
//! The remote API and the consent surface are traits so both can be
//! replaced in tests.

pub mod gdrive;
pub mod memory;
pub mod provider;
pub mod store;
pub mod surface;

pub use gdrive::{
    AuthSessionManager, AuthState, Credentials, DownloadResult, DriveClient, DriveFileGateway,
    GatewayConfig, GoogleOAuthProvider, TokenSet, Transport, UploadContent, UploadResult,
};
pub use memory::MemoryDrive;
pub use provider::{DriveApi, RemoteFile};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use surface::{ChannelSurface, InteractiveSurface, SurfaceEvent, SurfaceHandle, SurfaceOptions};
