//! LexiSync CLI - Command line access to the Google Drive session.
//!
//! Signs in through the browser, keeps the session in the config
//! directory and runs the file gateway operations against Drive.

mod surface;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lexisync_storage::gdrive::{OAuthProvider, OOB_REDIRECT_URI};
use lexisync_storage::{
    AuthSessionManager, AuthState, CredentialStore, Credentials, DriveClient, DriveFileGateway,
    FileCredentialStore, GoogleOAuthProvider, RemoteFile, UploadContent,
};

#[derive(Parser)]
#[command(name = "lexisync")]
#[command(about = "LexiSync - Google Drive sync for vocabulary profiles")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding credentials.json and tokens.json.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with Google.
    Login {
        /// OAuth client ID; stored for later runs together with the secret.
        #[arg(long, requires = "client_secret")]
        client_id: Option<String>,

        /// OAuth client secret.
        #[arg(long, requires = "client_id")]
        client_secret: Option<String>,

        /// Redirect URI, e.g. http://127.0.0.1:8765 for a loopback redirect.
        #[arg(long, requires = "client_id")]
        redirect_uri: Option<String>,
    },

    /// Forget the stored session.
    Logout,

    /// Show the session state.
    Status,

    /// List files.
    List {
        /// Drive query expression (default: this app's files).
        #[arg(short, long)]
        query: Option<String>,

        /// Restrict the listing to a folder ID.
        #[arg(short, long, conflicts_with = "query")]
        folder: Option<String>,

        /// Maximum number of results.
        #[arg(short, long)]
        page_size: Option<u32>,
    },

    /// Upload a local file as a new Drive file.
    Upload {
        /// Local file to upload.
        file: PathBuf,

        /// Name on Drive (default: local file name).
        #[arg(short, long)]
        name: Option<String>,

        /// Folder name to upload into; created if missing.
        #[arg(short, long)]
        folder: Option<String>,

        /// MIME type (default: inferred from the content kind).
        #[arg(short, long)]
        mime: Option<String>,
    },

    /// Download a file's content.
    Download {
        /// Drive file ID.
        id: String,

        /// Write to this path instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Delete a file.
    Delete {
        /// Drive file ID.
        id: String,
    },

    /// Find or create a folder and print its ID.
    Folder {
        /// Folder name.
        name: String,

        /// Parent folder ID.
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Show file metadata.
    Info {
        /// Drive file ID.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store = match cli.config_dir {
        Some(dir) => FileCredentialStore::new(dir),
        None => FileCredentialStore::default_location()
            .context("Failed to locate the config directory")?,
    };

    match cli.command {
        Commands::Login {
            client_id,
            client_secret,
            redirect_uri,
        } => {
            if let (Some(id), Some(secret)) = (client_id, client_secret) {
                let mut credentials = Credentials::new(id, secret);
                if let Some(redirect_uri) = redirect_uri {
                    credentials = credentials.with_redirect_uri(redirect_uri);
                }
                store
                    .save_credentials(&credentials)
                    .context("Failed to store client credentials")?;
                info!("Stored client credentials in {}", store.dir().display());
            }
            cmd_login(store).await
        }

        Commands::Logout => cmd_logout(store).await,

        Commands::Status => cmd_status(store).await,

        Commands::List {
            query,
            folder,
            page_size,
        } => cmd_list(store, query, folder, page_size).await,

        Commands::Upload {
            file,
            name,
            folder,
            mime,
        } => cmd_upload(store, &file, name, folder, mime).await,

        Commands::Download { id, out } => cmd_download(store, &id, out.as_deref()).await,

        Commands::Delete { id } => cmd_delete(store, &id).await,

        Commands::Folder { name, parent } => cmd_folder(store, &name, parent.as_deref()).await,

        Commands::Info { id } => cmd_info(store, &id).await,
    }
}

/// Build the session from stored or environment credentials.
fn open_session(store: FileCredentialStore) -> Result<Arc<AuthSessionManager>> {
    let credentials = match store
        .load_credentials()
        .context("Failed to read stored credentials")?
    {
        Some(credentials) => credentials,
        None => Credentials::from_env().context(
            "No client credentials: run `lexisync login --client-id .. --client-secret ..` \
             or set LEXISYNC_CLIENT_ID and LEXISYNC_CLIENT_SECRET",
        )?,
    };

    let provider = GoogleOAuthProvider::new(credentials)
        .context("Failed to create the OAuth client")?;
    let consent = surface::for_redirect(provider.redirect_uri());

    Ok(Arc::new(AuthSessionManager::new(
        Arc::new(provider),
        Arc::new(store),
        Arc::from(consent),
    )))
}

/// Build the gateway, failing early without a usable session.
async fn open_gateway(store: FileCredentialStore) -> Result<DriveFileGateway> {
    let session = open_session(store)?;
    if !session.is_authenticated().await {
        bail!("Not signed in: run `lexisync login` first");
    }

    let client = DriveClient::new().context("Failed to create the Drive client")?;
    Ok(DriveFileGateway::new(session, Arc::new(client)))
}

/// Sign in.
async fn cmd_login(store: FileCredentialStore) -> Result<()> {
    let session = open_session(store)?;

    if session.is_authenticated().await {
        println!("Already signed in.");
        return Ok(());
    }

    if session.authenticate().await.context("Sign-in failed")? {
        println!("Signed in successfully!");
    } else {
        println!("Sign-in cancelled.");
        // A pasted-code read may still be blocked on stdin.
        std::process::exit(130);
    }
    Ok(())
}

/// Sign out.
async fn cmd_logout(store: FileCredentialStore) -> Result<()> {
    let session = open_session(store)?;
    session.logout().await;

    println!("Signed out.");
    Ok(())
}

/// Show session state.
async fn cmd_status(store: FileCredentialStore) -> Result<()> {
    let location = store.dir().to_path_buf();
    let session = open_session(store)?;

    let signed_in = session.is_authenticated().await;
    let state = session.state().await;

    println!("Session:");
    println!("  Config: {}", location.display());
    println!("  State: {}", describe_state(state));
    if let Some(tokens) = session.tokens().await {
        println!("  Token expires: {}", tokens.expiry_date);
        println!(
            "  Refresh token: {}",
            if tokens.refresh_token.is_some() {
                "present"
            } else {
                "absent"
            }
        );
    }
    if !signed_in {
        println!("\nRun `lexisync login` to sign in.");
    }
    Ok(())
}

fn describe_state(state: AuthState) -> &'static str {
    match state {
        AuthState::Unauthenticated => "signed out",
        AuthState::AuthenticatingInteractive => "signing in",
        AuthState::Authenticated => "signed in",
        AuthState::NearExpiry => "signed in (token expiring)",
        AuthState::Refreshing => "refreshing",
    }
}

/// List files.
async fn cmd_list(
    store: FileCredentialStore,
    query: Option<String>,
    folder: Option<String>,
    page_size: Option<u32>,
) -> Result<()> {
    let gateway = open_gateway(store).await?;

    let query = query.or_else(|| folder.as_deref().map(DriveFileGateway::folder_query));
    let files = gateway
        .list_files(query.as_deref(), page_size)
        .await
        .map_err(|e| with_login_hint(e, "Failed to list files"))?;

    if files.is_empty() {
        println!("No files found.");
        return Ok(());
    }

    for file in &files {
        print_entry(file);
    }
    Ok(())
}

fn print_entry(file: &RemoteFile) {
    let modified = file
        .modified_time
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();

    if file.is_folder() {
        println!("  [DIR]  {}  {}/  {}", file.id, file.name, modified);
    } else {
        let size = file
            .size_bytes()
            .map(|s| format!("{} bytes", s))
            .unwrap_or_else(|| "-".to_string());
        println!("  [FILE] {}  {} ({})  {}", file.id, file.name, size, modified);
    }
}

/// Upload a local file.
async fn cmd_upload(
    store: FileCredentialStore,
    file: &Path,
    name: Option<String>,
    folder: Option<String>,
    mime: Option<String>,
) -> Result<()> {
    let gateway = open_gateway(store).await?;

    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Cannot derive a file name from {}", file.display()))?,
    };

    let folder_id = match folder {
        Some(folder) => Some(
            gateway
                .get_folder(&folder, None)
                .await
                .map_err(|e| with_login_hint(e, &format!("Failed to resolve folder {}", folder)))?,
        ),
        None => None,
    };

    let content = if is_json(file) {
        match String::from_utf8(data) {
            Ok(text) => UploadContent::Text(text),
            Err(e) => UploadContent::Binary(e.into_bytes()),
        }
    } else {
        UploadContent::Binary(data)
    };

    let result = gateway
        .upload_file(&name, content, folder_id.as_deref(), mime.as_deref())
        .await;
    if !result.success {
        bail!(
            "Upload failed: {}",
            result.message.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    println!("File uploaded successfully!");
    println!("  ID: {}", result.file_id.unwrap_or_default());
    println!("  Name: {}", result.name.unwrap_or_default());
    println!("  Size: {} bytes", result.size.unwrap_or_default());
    println!("  URL: {}", result.url.unwrap_or_default());
    Ok(())
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Download a file.
async fn cmd_download(store: FileCredentialStore, id: &str, out: Option<&Path>) -> Result<()> {
    let gateway = open_gateway(store).await?;

    let result = gateway.download_file(id).await;
    let content = match (result.success, result.content) {
        (true, Some(content)) => content,
        _ => bail!(
            "Download failed: {}",
            result.message.unwrap_or_else(|| "unknown error".to_string())
        ),
    };

    match out {
        Some(path) => {
            tokio::fs::write(path, content.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Downloaded {} to {}", id, path.display());
        }
        None => print!("{}", content),
    }
    Ok(())
}

/// Delete a file.
async fn cmd_delete(store: FileCredentialStore, id: &str) -> Result<()> {
    let gateway = open_gateway(store).await?;

    if !gateway.delete_file(id).await {
        bail!("Failed to delete {}", id);
    }

    println!("File deleted: {}", id);
    Ok(())
}

/// Find or create a folder.
async fn cmd_folder(store: FileCredentialStore, name: &str, parent: Option<&str>) -> Result<()> {
    let gateway = open_gateway(store).await?;

    let id = gateway
        .get_folder(name, parent)
        .await
        .map_err(|e| with_login_hint(e, &format!("Failed to resolve folder {}", name)))?;

    println!("{}", id);
    Ok(())
}

/// Wrap a gateway error, pointing at `login` when the session needs a new consent.
fn with_login_hint(error: lexisync_common::Error, action: &str) -> anyhow::Error {
    if error.requires_reauthentication() {
        anyhow!("{}: {}. Run `lexisync login` to sign in again.", action, error)
    } else {
        anyhow::Error::new(error).context(action.to_string())
    }
}

/// Show file metadata.
async fn cmd_info(store: FileCredentialStore, id: &str) -> Result<()> {
    let gateway = open_gateway(store).await?;

    let file = gateway
        .get_file_metadata(id)
        .await
        .ok_or_else(|| anyhow!("File not found or not accessible: {}", id))?;

    println!("File Information:");
    println!("  ID: {}", file.id);
    println!("  Name: {}", file.name);
    println!("  MIME type: {}", file.mime_type);
    if let Some(size) = file.size_bytes() {
        println!("  Size: {} bytes", size);
    }
    if let Some(modified) = file.modified_time {
        println!("  Modified: {}", modified);
    }
    if !file.parents.is_empty() {
        println!("  Parents: {}", file.parents.join(", "));
    }
    if let Some(link) = file.web_view_link {
        println!("  Link: {}", link);
    }
    Ok(())
}
