//! Google Drive backend.
//!
//! - `auth`: credentials, token set and the OAuth2 endpoint client
//! - `session`: token lifecycle, consent flow and refresh coordination
//! - `client`: REST client for the Drive v3 file endpoints
//! - `gateway`: authenticated file operations used by the application

pub mod auth;
pub mod client;
pub mod gateway;
pub mod session;

pub use auth::{
    ConsentRequest, Credentials, GoogleOAuthProvider, OAuthProvider, ProviderEndpoints, TokenSet,
    Transport, DRIVE_FILE_SCOPE, DRIVE_METADATA_READONLY_SCOPE, OOB_REDIRECT_URI,
    REFRESH_SKEW_SECS,
};
pub use client::DriveClient;
pub use gateway::{DownloadResult, DriveFileGateway, GatewayConfig, UploadContent, UploadResult};
pub use session::{AuthSessionManager, AuthState};
