//! OAuth2 authentication and token types for Google Drive.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet,
    EndpointSet, HttpRequest, HttpResponse, RedirectUrl, RefreshToken, RequestTokenError, Scope,
    TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};

use lexisync_common::{Error, Result, SecretString};

/// OAuth2 authorization endpoint.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Out-of-band redirect URI for installed applications.
pub const OOB_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Per-file write access to files created by the application.
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
/// Read-only access to file metadata.
pub const DRIVE_METADATA_READONLY_SCOPE: &str =
    "https://www.googleapis.com/auth/drive.metadata.readonly";

/// Lead time before expiry at which an access token is renewed.
pub const REFRESH_SKEW_SECS: i64 = 60;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

const CLIENT_ID_ENV: &str = "LEXISYNC_CLIENT_ID";
const CLIENT_SECRET_ENV: &str = "LEXISYNC_CLIENT_SECRET";
const REDIRECT_URI_ENV: &str = "LEXISYNC_REDIRECT_URI";

fn default_redirect_uri() -> String {
    OOB_REDIRECT_URI.to_string()
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// OAuth2 client credentials of the installed application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Client identifier issued by the provider.
    pub client_id: String,
    /// Client secret issued by the provider.
    pub client_secret: SecretString,
    /// Redirect target registered for the client.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
}

impl Credentials {
    /// Create credentials with the out-of-band redirect.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<SecretString>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: default_redirect_uri(),
        }
    }

    /// Override the redirect target.
    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    /// Read credentials from the environment.
    ///
    /// # Errors
    /// - `Configuration` if the client id or secret variable is missing
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var(CLIENT_ID_ENV)
            .map_err(|_| Error::Configuration(format!("{} is not set", CLIENT_ID_ENV)))?;
        let client_secret = std::env::var(CLIENT_SECRET_ENV)
            .map_err(|_| Error::Configuration(format!("{} is not set", CLIENT_SECRET_ENV)))?;
        let redirect_uri =
            std::env::var(REDIRECT_URI_ENV).unwrap_or_else(|_| default_redirect_uri());

        Ok(Self::new(client_id, client_secret).with_redirect_uri(redirect_uri))
    }
}

/// The currently held OAuth2 grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Access token for API requests.
    pub access_token: SecretString,
    /// Refresh token, absent when the provider did not issue one.
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    /// When the access token expires.
    pub expiry_date: DateTime<Utc>,
    /// Token type reported by the provider.
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

impl TokenSet {
    /// Check if the access token is within the refresh skew of its expiry.
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(Utc::now())
    }

    /// Same as [`TokenSet::needs_refresh`] against an explicit clock.
    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_date - Duration::seconds(REFRESH_SKEW_SECS)
    }

    /// Check if the access token is past its expiry.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expiry_date
    }

    /// Keep a previously issued refresh token when the refresh response omits one.
    pub fn inherit_refresh_token(mut self, previous: &TokenSet) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.refresh_token.clone();
        }
        self
    }
}

/// Authenticated handle handed to remote calls.
///
/// Built fresh from the session on every operation; do not keep it
/// beyond one call since the token may rotate between calls.
#[derive(Debug, Clone)]
pub struct Transport {
    access_token: SecretString,
    token_type: String,
}

impl Transport {
    pub(crate) fn from_tokens(tokens: &TokenSet) -> Self {
        let token_type = if tokens.token_type.eq_ignore_ascii_case("bearer") {
            "Bearer".to_string()
        } else {
            tokens.token_type.clone()
        };

        Self {
            access_token: tokens.access_token.clone(),
            token_type,
        }
    }

    /// Value for the `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token.expose())
    }

    /// The raw access token.
    pub fn access_token(&self) -> &str {
        self.access_token.expose()
    }
}

/// Endpoints and scopes of the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            scopes: vec![
                DRIVE_FILE_SCOPE.to_string(),
                DRIVE_METADATA_READONLY_SCOPE.to_string(),
            ],
        }
    }
}

/// A consent URL together with the CSRF state it carries.
#[derive(Debug, Clone)]
pub struct ConsentRequest {
    pub url: String,
    pub csrf_state: String,
}

/// Identity provider operations used by the session manager.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Redirect target the provider sends the authorization result to.
    fn redirect_uri(&self) -> &str;

    /// Build a consent URL requesting offline access with a forced consent prompt.
    fn consent_request(&self) -> ConsentRequest;

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    /// - `AuthenticationFailed` on provider rejection or network errors
    async fn exchange_code(&self, code: &str) -> Result<TokenSet>;

    /// Obtain a new access token from a refresh token.
    ///
    /// # Errors
    /// - `RefreshRejected` when the provider refuses the grant
    /// - `Network` on transport failures
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet>;
}

type GoogleClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Google OAuth2 provider backed by the `oauth2` crate.
pub struct GoogleOAuthProvider {
    client: GoogleClient,
    http: reqwest::Client,
    credentials: Credentials,
    scopes: Vec<String>,
}

impl GoogleOAuthProvider {
    /// Create a provider against the Google endpoints.
    pub fn new(credentials: Credentials) -> Result<Self> {
        Self::with_endpoints(credentials, ProviderEndpoints::default())
    }

    /// Create a provider against custom endpoints.
    ///
    /// # Errors
    /// - `InvalidInput` if any endpoint or the redirect is not a valid URL
    pub fn with_endpoints(credentials: Credentials, endpoints: ProviderEndpoints) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(credentials.client_id.clone()))
            .set_client_secret(ClientSecret::new(
                credentials.client_secret.expose().to_string(),
            ))
            .set_auth_type(AuthType::RequestBody)
            .set_auth_uri(
                AuthUrl::new(endpoints.auth_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(endpoints.token_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(credentials.redirect_uri.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            );

        // Token endpoints must not be followed through redirects.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            http,
            credentials,
            scopes: endpoints.scopes,
        })
    }

    fn tokens_from_response(token: &oauth2::basic::BasicTokenResponse) -> TokenSet {
        let expires_in = token
            .expires_in()
            .unwrap_or_else(|| std::time::Duration::from_secs(DEFAULT_TOKEN_LIFETIME_SECS));
        let expiry_date =
            Utc::now() + Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1));

        TokenSet {
            access_token: SecretString::new(token.access_token().secret().clone()),
            refresh_token: token
                .refresh_token()
                .map(|t| SecretString::new(t.secret().clone())),
            expiry_date,
            token_type: token.token_type().as_ref().to_string(),
        }
    }
}

/// Run an `oauth2` HTTP request through the shared reqwest client.
async fn send_oauth_request(
    http: reqwest::Client,
    request: HttpRequest,
) -> std::result::Result<HttpResponse, reqwest::Error> {
    let request = reqwest::Request::try_from(request)?;
    let response = http.execute(request).await?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();

    let mut http_response = HttpResponse::new(body);
    *http_response.status_mut() = status;
    *http_response.headers_mut() = headers;
    Ok(http_response)
}

#[async_trait]
impl OAuthProvider for GoogleOAuthProvider {
    fn redirect_uri(&self) -> &str {
        &self.credentials.redirect_uri
    }

    fn consent_request(&self) -> ConsentRequest {
        let (url, csrf) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(self.scopes.iter().cloned().map(Scope::new))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();

        ConsentRequest {
            url: url.to_string(),
            csrf_state: csrf.secret().clone(),
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet> {
        let http = self.http.clone();
        let send = move |request: HttpRequest| send_oauth_request(http.clone(), request);

        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&send)
            .await
            .map_err(|e| Error::AuthenticationFailed(format!("Token exchange failed: {}", e)))?;

        Ok(Self::tokens_from_response(&token))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet> {
        let http = self.http.clone();
        let send = move |request: HttpRequest| send_oauth_request(http.clone(), request);

        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&send)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(response) => {
                    Error::RefreshRejected(response.to_string())
                }
                other => Error::Network(format!("Token refresh failed: {}", other)),
            })?;

        Ok(Self::tokens_from_response(&token))
    }
}
