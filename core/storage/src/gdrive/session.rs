//! OAuth2 session lifecycle for Google Drive.
//!
//! `AuthSessionManager` owns the token set: it runs the interactive
//! consent flow, refreshes tokens ahead of expiry and hands out a
//! transport built from the current token. Every token mutation is
//! written to the credential store before the in-memory copy changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use lexisync_common::{Error, Result};

use super::auth::{OAuthProvider, TokenSet, Transport};
use crate::store::CredentialStore;
use crate::surface::{InteractiveSurface, SurfaceEvent, SurfaceOptions};

/// Logical session state, derived from the token set and in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No access token held.
    Unauthenticated,
    /// A consent surface is open.
    AuthenticatingInteractive,
    /// Access token held and outside the refresh window.
    Authenticated,
    /// Access token held but within the refresh window.
    NearExpiry,
    /// A refresh is in flight.
    Refreshing,
}

/// OAuth2 session manager.
pub struct AuthSessionManager {
    provider: Arc<dyn OAuthProvider>,
    store: Arc<dyn CredentialStore>,
    surface: Arc<dyn InteractiveSurface>,
    surface_options: SurfaceOptions,
    tokens: RwLock<Option<TokenSet>>,
    /// Held for the duration of a refresh; keeps the latest outcome.
    refresh_gate: Mutex<RefreshSlot>,
    /// Completed refresh attempts. Read before queueing on `refresh_gate`.
    refresh_generation: AtomicU64,
    /// Held while a consent surface is open.
    consent_gate: Mutex<()>,
    refreshing: AtomicBool,
    interactive: AtomicBool,
}

/// Outcome of the latest refresh attempt, handed to callers that queued
/// behind it.
#[derive(Default)]
struct RefreshSlot {
    last: Option<Result<TokenSet>>,
}

impl RefreshSlot {
    fn replay(&self) -> Result<TokenSet> {
        match &self.last {
            Some(Ok(tokens)) => Ok(tokens.clone()),
            Some(Err(e)) => Err(replay_error(e)),
            None => Err(Error::NotAuthenticated),
        }
    }
}

fn replay_error(error: &Error) -> Error {
    match error {
        Error::NoRefreshToken => Error::NoRefreshToken,
        Error::NotAuthenticated => Error::NotAuthenticated,
        Error::RefreshRejected(reason) => Error::RefreshRejected(reason.clone()),
        Error::Network(message) => Error::Network(message.clone()),
        other => Error::Network(other.to_string()),
    }
}

/// Raises a phase flag for as long as it lives.
struct PhaseGuard<'a>(&'a AtomicBool);

impl<'a> PhaseGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AuthSessionManager {
    /// Create a session manager, restoring persisted tokens.
    ///
    /// A store that fails to load is treated as empty.
    pub fn new(
        provider: Arc<dyn OAuthProvider>,
        store: Arc<dyn CredentialStore>,
        surface: Arc<dyn InteractiveSurface>,
    ) -> Self {
        let tokens = match store.load_tokens() {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Ignoring unreadable persisted tokens: {}", e);
                None
            }
        };

        if tokens.is_some() {
            debug!("Restored persisted session tokens");
        }

        Self {
            provider,
            store,
            surface,
            surface_options: SurfaceOptions::default(),
            tokens: RwLock::new(tokens),
            refresh_gate: Mutex::new(RefreshSlot::default()),
            refresh_generation: AtomicU64::new(0),
            consent_gate: Mutex::new(()),
            refreshing: AtomicBool::new(false),
            interactive: AtomicBool::new(false),
        }
    }

    /// Set how the consent surface is presented (owner window, modality).
    pub fn with_surface_options(mut self, options: SurfaceOptions) -> Self {
        self.surface_options = options;
        self
    }

    /// Current logical state.
    pub async fn state(&self) -> AuthState {
        if self.interactive.load(Ordering::SeqCst) {
            return AuthState::AuthenticatingInteractive;
        }
        if self.refreshing.load(Ordering::SeqCst) {
            return AuthState::Refreshing;
        }

        match self.tokens.read().await.as_ref() {
            None => AuthState::Unauthenticated,
            Some(tokens) if tokens.needs_refresh() => AuthState::NearExpiry,
            Some(_) => AuthState::Authenticated,
        }
    }

    /// Consent URL with offline access and a forced consent prompt.
    ///
    /// For hosts that present the consent page themselves; `authenticate`
    /// builds its own request.
    pub fn consent_url(&self) -> String {
        self.provider.consent_request().url
    }

    /// Ensure an authenticated session, running the consent flow if needed.
    ///
    /// # Returns
    /// - `Ok(true)` when a valid session exists afterwards
    /// - `Ok(false)` when the user closed the consent surface
    ///
    /// # Errors
    /// - `AuthenticationFailed` if the surface could not be opened, the
    ///   redirect carried an error, or the code exchange failed
    pub async fn authenticate(&self) -> Result<bool> {
        if self.is_authenticated().await {
            return Ok(true);
        }

        let _flow = match self.consent_gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Consent flow already in progress, waiting for its outcome");
                let _pending = self.consent_gate.lock().await;
                return Ok(self.is_authenticated().await);
            }
        };

        let _phase = PhaseGuard::enter(&self.interactive);
        info!("Starting interactive consent flow");

        match self.run_consent_flow().await {
            Ok(tokens) => {
                self.commit_tokens(tokens).await;
                info!("Authentication completed");
                Ok(true)
            }
            Err(Error::AuthenticationCancelled) => {
                info!("Consent surface closed before authorization");
                Ok(false)
            }
            Err(e) => {
                warn!("Authentication failed: {}", e);
                Err(e)
            }
        }
    }

    /// Check for a usable session, refreshing a token that is near expiry.
    ///
    /// Never fails: refresh errors are logged and reported as `false`.
    pub async fn is_authenticated(&self) -> bool {
        match self.tokens.read().await.as_ref() {
            None => return false,
            Some(tokens) if !tokens.needs_refresh() => return true,
            Some(_) => {}
        }

        debug!("Access token near expiry, refreshing");

        match self.refresh_if_stale().await {
            Ok(_) => true,
            Err(Error::NoRefreshToken) => {
                // An expiring token without a refresh token can never recover.
                warn!("Access token expiring and no refresh token held");
                self.clear_tokens().await;
                false
            }
            Err(e) => {
                warn!("Session refresh failed: {}", e);
                false
            }
        }
    }

    /// Refresh the access token.
    ///
    /// Concurrent callers share one token-endpoint call: whoever waits on
    /// an in-flight refresh receives its outcome, success or failure,
    /// instead of issuing another.
    ///
    /// # Errors
    /// - `NoRefreshToken` if no refresh token is held (tokens untouched)
    /// - `RefreshRejected` if the provider refused the grant (tokens cleared)
    /// - `Network` on transport failures (tokens kept)
    pub async fn refresh(&self) -> Result<TokenSet> {
        let seen = self.refresh_generation.load(Ordering::SeqCst);
        let mut slot = self.refresh_gate.lock().await;

        if self.refresh_generation.load(Ordering::SeqCst) != seen {
            debug!("Joined a concurrent refresh");
            return slot.replay();
        }

        self.run_refresh(&mut slot).await
    }

    /// Clear persisted and cached tokens.
    pub async fn logout(&self) {
        self.clear_tokens().await;
        info!("Logged out");
    }

    /// Transport for the current access token.
    ///
    /// Returns `None` when no unexpired token is held. Call
    /// [`AuthSessionManager::is_authenticated`] first to refresh a token
    /// close to expiry.
    pub async fn transport(&self) -> Option<Transport> {
        self.tokens
            .read()
            .await
            .as_ref()
            .filter(|tokens| !tokens.is_expired())
            .map(Transport::from_tokens)
    }

    /// Snapshot of the current token set.
    pub async fn tokens(&self) -> Option<TokenSet> {
        self.tokens.read().await.clone()
    }

    /// Refresh unless a concurrent caller already did.
    async fn refresh_if_stale(&self) -> Result<TokenSet> {
        let seen = self.refresh_generation.load(Ordering::SeqCst);
        let mut slot = self.refresh_gate.lock().await;

        if self.refresh_generation.load(Ordering::SeqCst) != seen {
            debug!("Joined a concurrent refresh");
            return slot.replay();
        }

        let current = self.tokens.read().await.clone();
        match current {
            None => return Err(Error::NotAuthenticated),
            Some(tokens) if !tokens.needs_refresh() => return Ok(tokens),
            Some(_) => {}
        }

        self.run_refresh(&mut slot).await
    }

    /// Run one refresh attempt and publish its outcome to queued callers.
    async fn run_refresh(&self, slot: &mut RefreshSlot) -> Result<TokenSet> {
        let _phase = PhaseGuard::enter(&self.refreshing);

        let outcome = self.refresh_locked().await;
        slot.last = Some(match &outcome {
            Ok(tokens) => Ok(tokens.clone()),
            Err(e) => Err(replay_error(e)),
        });
        self.refresh_generation.fetch_add(1, Ordering::SeqCst);

        outcome
    }

    /// Perform the refresh. Caller holds `refresh_gate`.
    async fn refresh_locked(&self) -> Result<TokenSet> {
        let current = self.tokens.read().await.clone();
        let (current, refresh_token) = match current {
            Some(tokens) => match tokens.refresh_token.clone() {
                Some(refresh_token) => (tokens, refresh_token),
                None => return Err(Error::NoRefreshToken),
            },
            None => return Err(Error::NoRefreshToken),
        };

        info!("Refreshing access token");

        match self.provider.refresh_token(refresh_token.expose()).await {
            Ok(refreshed) => {
                let refreshed = refreshed.inherit_refresh_token(&current);
                self.commit_tokens(refreshed.clone()).await;
                Ok(refreshed)
            }
            Err(Error::RefreshRejected(reason)) => {
                warn!("Refresh token rejected, session cleared: {}", reason);
                self.clear_tokens().await;
                Err(Error::RefreshRejected(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Persist, then cache.
    async fn commit_tokens(&self, tokens: TokenSet) {
        if let Err(e) = self.store.save_tokens(&tokens) {
            warn!("Failed to persist tokens: {}", e);
        }
        *self.tokens.write().await = Some(tokens);
    }

    async fn clear_tokens(&self) {
        if let Err(e) = self.store.clear_tokens() {
            warn!("Failed to clear persisted tokens: {}", e);
        }
        *self.tokens.write().await = None;
    }

    async fn run_consent_flow(&self) -> Result<TokenSet> {
        let request = self.provider.consent_request();

        let mut window = self
            .surface
            .open(&request.url, &self.surface_options)
            .await
            .map_err(|e| {
                Error::AuthenticationFailed(format!("Failed to open consent surface: {}", e))
            })?;

        let code = loop {
            match window.next_event().await {
                SurfaceEvent::Navigating(target) => {
                    let outcome = match parse_redirect(
                        &target,
                        self.provider.redirect_uri(),
                        &request.csrf_state,
                    ) {
                        Some(outcome) => outcome,
                        None => continue,
                    };
                    window.close().await;
                    break outcome?;
                }
                SurfaceEvent::Closed => return Err(Error::AuthenticationCancelled),
            }
        };

        debug!("Authorization code captured, exchanging");
        self.provider.exchange_code(&code).await
    }
}

/// Inspect a navigation target.
///
/// Returns `None` for URLs other than the redirect, otherwise the
/// authorization code or the reason the redirect is unusable.
fn parse_redirect(target: &str, redirect_uri: &str, csrf_state: &str) -> Option<Result<String>> {
    let base = target.split(['?', '#']).next().unwrap_or(target);
    if base.trim_end_matches('/') != redirect_uri.trim_end_matches('/') {
        return None;
    }

    let url = match Url::parse(target) {
        Ok(url) => url,
        Err(e) => {
            return Some(Err(Error::AuthenticationFailed(format!(
                "Malformed redirect: {}",
                e
            ))))
        }
    };

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Some(Err(Error::AuthenticationFailed(format!(
            "Provider returned error: {}",
            error
        ))));
    }
    if state.is_some_and(|state| state != csrf_state) {
        return Some(Err(Error::AuthenticationFailed(
            "State mismatch in redirect".to_string(),
        )));
    }

    Some(code.filter(|code| !code.is_empty()).ok_or_else(|| {
        Error::AuthenticationFailed("Redirect carried no authorization code".to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdrive::auth::{ConsentRequest, OOB_REDIRECT_URI};
    use crate::store::MemoryCredentialStore;
    use crate::surface::ChannelSurface;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use lexisync_common::SecretString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted provider counting token-endpoint calls.
    struct FakeProvider {
        exchange_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        reject_refresh: bool,
        unreachable: bool,
        refresh_delay: std::time::Duration,
    }

    impl FakeProvider {
        fn new() -> Self {
            Self {
                exchange_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
                reject_refresh: false,
                unreachable: false,
                refresh_delay: std::time::Duration::from_millis(0),
            }
        }

        fn rejecting() -> Self {
            Self {
                reject_refresh: true,
                ..Self::new()
            }
        }

        fn slow() -> Self {
            Self {
                refresh_delay: std::time::Duration::from_millis(50),
                ..Self::new()
            }
        }

        /// Token endpoint that cannot be reached.
        fn unreachable() -> Self {
            Self {
                unreachable: true,
                ..Self::new()
            }
        }

        fn slow_unreachable() -> Self {
            Self {
                unreachable: true,
                ..Self::slow()
            }
        }

        fn refreshes(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OAuthProvider for FakeProvider {
        fn redirect_uri(&self) -> &str {
            OOB_REDIRECT_URI
        }

        fn consent_request(&self) -> ConsentRequest {
            ConsentRequest {
                url: "https://accounts.example.com/auth?access_type=offline".to_string(),
                csrf_state: "state-1".to_string(),
            }
        }

        async fn exchange_code(&self, code: &str) -> Result<TokenSet> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            if code != "abc123" {
                return Err(Error::AuthenticationFailed("invalid_grant".to_string()));
            }
            Ok(tokens("T1", Some("R1"), 3600))
        }

        async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.refresh_delay).await;
            if self.reject_refresh {
                return Err(Error::RefreshRejected("invalid_grant".to_string()));
            }
            if self.unreachable {
                return Err(Error::Network("connection refused".to_string()));
            }
            assert_eq!(refresh_token, "R1");
            Ok(tokens("T2", None, 3600))
        }
    }

    fn tokens(access: &str, refresh: Option<&str>, expires_in_secs: i64) -> TokenSet {
        TokenSet {
            access_token: SecretString::new(access),
            refresh_token: refresh.map(SecretString::new),
            expiry_date: Utc::now() + Duration::seconds(expires_in_secs),
            token_type: "Bearer".to_string(),
        }
    }

    struct Harness {
        manager: Arc<AuthSessionManager>,
        provider: Arc<FakeProvider>,
        store: Arc<MemoryCredentialStore>,
        windows: tokio::sync::mpsc::UnboundedReceiver<crate::surface::OpenedSurface>,
    }

    fn harness(provider: FakeProvider, persisted: Option<TokenSet>) -> Harness {
        let provider = Arc::new(provider);
        let store = match persisted {
            Some(tokens) => MemoryCredentialStore::new().with_tokens(tokens),
            None => MemoryCredentialStore::new(),
        };
        let store = Arc::new(store);
        let (surface, windows) = ChannelSurface::new();

        let manager = Arc::new(AuthSessionManager::new(
            provider.clone(),
            store.clone(),
            Arc::new(surface),
        ));

        Harness {
            manager,
            provider,
            store,
            windows,
        }
    }

    #[tokio::test]
    async fn test_initial_state_from_store() {
        let empty = harness(FakeProvider::new(), None);
        assert_eq!(empty.manager.state().await, AuthState::Unauthenticated);
        assert!(!empty.manager.is_authenticated().await);

        let restored = harness(FakeProvider::new(), Some(tokens("T1", Some("R1"), 3600)));
        assert_eq!(restored.manager.state().await, AuthState::Authenticated);

        let expiring = harness(FakeProvider::new(), Some(tokens("T1", Some("R1"), 30)));
        assert_eq!(expiring.manager.state().await, AuthState::NearExpiry);
    }

    #[tokio::test]
    async fn test_fresh_token_skips_refresh() {
        let h = harness(FakeProvider::new(), Some(tokens("T1", Some("R1"), 3600)));

        assert!(h.manager.is_authenticated().await);
        assert!(h.manager.authenticate().await.unwrap());
        assert_eq!(h.provider.refreshes(), 0);
        assert_eq!(h.manager.transport().await.unwrap().access_token(), "T1");
    }

    #[tokio::test]
    async fn test_consent_flow_then_refresh() {
        let mut h = harness(FakeProvider::new(), None);

        let manager = h.manager.clone();
        let flow = tokio::spawn(async move { manager.authenticate().await });

        let window = h.windows.recv().await.unwrap();
        assert!(window.url.contains("access_type=offline"));
        assert!(window.options.modal);

        window.navigate("https://accounts.example.com/signin");
        window.navigate(format!("{}?code=abc123&state=state-1", OOB_REDIRECT_URI));

        assert!(flow.await.unwrap().unwrap());
        assert!(window.is_closed());

        let persisted = h.store.snapshot().unwrap();
        assert_eq!(persisted.access_token.expose(), "T1");
        assert_eq!(persisted.refresh_token.as_ref().unwrap().expose(), "R1");

        // Simulate the token drifting into the refresh window.
        let mut expiring = persisted.clone();
        expiring.expiry_date = Utc::now() + Duration::seconds(30);
        *h.manager.tokens.write().await = Some(expiring);

        assert!(h.manager.is_authenticated().await);
        assert_eq!(h.provider.refreshes(), 1);
        assert!(h.manager.is_authenticated().await);
        assert_eq!(h.provider.refreshes(), 1);

        let transport = h.manager.transport().await.unwrap();
        assert_eq!(transport.access_token(), "T2");

        let persisted = h.store.snapshot().unwrap();
        assert_eq!(persisted.access_token.expose(), "T2");
        assert_eq!(persisted.refresh_token.unwrap().expose(), "R1");
    }

    #[tokio::test]
    async fn test_user_cancellation() {
        let mut h = harness(FakeProvider::new(), None);

        let manager = h.manager.clone();
        let flow = tokio::spawn(async move { manager.authenticate().await });

        let window = h.windows.recv().await.unwrap();
        window.dismiss();

        assert!(!flow.await.unwrap().unwrap());
        assert_eq!(h.manager.state().await, AuthState::Unauthenticated);
        assert_eq!(h.provider.exchange_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redirect_error_fails() {
        let mut h = harness(FakeProvider::new(), None);

        let manager = h.manager.clone();
        let flow = tokio::spawn(async move { manager.authenticate().await });

        let window = h.windows.recv().await.unwrap();
        window.navigate(format!("{}?error=access_denied", OOB_REDIRECT_URI));

        let result = flow.await.unwrap();
        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
        assert!(window.is_closed());
        assert!(h.store.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_rejected_code_exchange() {
        let mut h = harness(FakeProvider::new(), None);

        let manager = h.manager.clone();
        let flow = tokio::spawn(async move { manager.authenticate().await });

        let window = h.windows.recv().await.unwrap();
        window.navigate(format!("{}?code=wrong", OOB_REDIRECT_URI));

        assert!(matches!(
            flow.await.unwrap(),
            Err(Error::AuthenticationFailed(_))
        ));
        assert!(!h.manager.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_single_interactive_flow() {
        let mut h = harness(FakeProvider::new(), None);

        let first = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.authenticate().await })
        };
        let window = h.windows.recv().await.unwrap();
        assert_eq!(
            h.manager.state().await,
            AuthState::AuthenticatingInteractive
        );

        let second = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.authenticate().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(h.windows.try_recv().is_err());

        window.navigate(format!("{}?code=abc123", OOB_REDIRECT_URI));

        assert!(first.await.unwrap().unwrap());
        assert!(second.await.unwrap().unwrap());
        assert_eq!(h.provider.exchange_calls.load(Ordering::SeqCst), 1);
        assert!(h.windows.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_flight() {
        let h = harness(FakeProvider::slow(), Some(tokens("T1", Some("R1"), 30)));

        let checks: Vec<_> = (0..8)
            .map(|_| {
                let manager = h.manager.clone();
                tokio::spawn(async move { manager.is_authenticated().await })
            })
            .collect();

        for check in checks {
            assert!(check.await.unwrap());
        }

        assert_eq!(h.provider.refreshes(), 1);
        assert_eq!(h.manager.transport().await.unwrap().access_token(), "T2");
    }

    #[tokio::test]
    async fn test_concurrent_explicit_refresh_single_flight() {
        let h = harness(FakeProvider::slow(), Some(tokens("T1", Some("R1"), 3600)));

        let refreshes: Vec<_> = (0..4)
            .map(|_| {
                let manager = h.manager.clone();
                tokio::spawn(async move { manager.refresh().await })
            })
            .collect();

        for refresh in refreshes {
            assert_eq!(refresh.await.unwrap().unwrap().access_token.expose(), "T2");
        }
        assert_eq!(h.provider.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_refresh_network_failure_keeps_tokens() {
        let original = tokens("T1", Some("R1"), 30);
        let h = harness(FakeProvider::unreachable(), Some(original.clone()));

        assert!(!h.manager.is_authenticated().await);
        assert_eq!(h.manager.tokens().await, Some(original.clone()));
        assert_eq!(h.store.snapshot(), Some(original.clone()));

        assert!(matches!(h.manager.refresh().await, Err(Error::Network(_))));
        assert_eq!(h.manager.tokens().await, Some(original));
        assert_eq!(h.manager.state().await, AuthState::NearExpiry);

        // Sequential callers retry once the previous attempt has finished.
        assert_eq!(h.provider.refreshes(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_failure_single_flight() {
        let original = tokens("T1", Some("R1"), 30);
        let h = harness(FakeProvider::slow_unreachable(), Some(original.clone()));

        let checks: Vec<_> = (0..8)
            .map(|_| {
                let manager = h.manager.clone();
                tokio::spawn(async move { manager.is_authenticated().await })
            })
            .collect();

        for check in checks {
            assert!(!check.await.unwrap());
        }

        assert_eq!(h.provider.refreshes(), 1);
        assert_eq!(h.manager.tokens().await, Some(original));
    }

    #[tokio::test]
    async fn test_concurrent_explicit_refresh_failure_single_flight() {
        let h = harness(
            FakeProvider::slow_unreachable(),
            Some(tokens("T1", Some("R1"), 3600)),
        );

        let refreshes: Vec<_> = (0..4)
            .map(|_| {
                let manager = h.manager.clone();
                tokio::spawn(async move { manager.refresh().await })
            })
            .collect();

        for refresh in refreshes {
            assert!(matches!(refresh.await.unwrap(), Err(Error::Network(_))));
        }
        assert_eq!(h.provider.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_state_reports_refreshing() {
        let h = harness(FakeProvider::slow(), Some(tokens("T1", Some("R1"), 30)));

        let check = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.is_authenticated().await })
        };
        while h.provider.refreshes() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.manager.state().await, AuthState::Refreshing);
        // Reading the state never holds the gates.
        assert!(h.manager.consent_gate.try_lock().is_ok());

        assert!(check.await.unwrap());
        assert_eq!(h.manager.state().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let original = tokens("T1", None, 30);
        let h = harness(FakeProvider::new(), Some(original.clone()));

        let result = h.manager.refresh().await;
        assert!(matches!(result, Err(Error::NoRefreshToken)));
        assert_eq!(h.manager.tokens().await, Some(original));
        assert_eq!(h.provider.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_expiring_without_refresh_token_is_unauthenticated() {
        let h = harness(FakeProvider::new(), Some(tokens("T1", None, 30)));

        assert!(!h.manager.is_authenticated().await);
        assert!(h.manager.tokens().await.is_none());
        assert!(h.store.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_session() {
        let h = harness(FakeProvider::rejecting(), Some(tokens("T1", Some("R1"), 30)));

        assert!(!h.manager.is_authenticated().await);
        assert_eq!(h.provider.refreshes(), 1);
        assert!(h.manager.tokens().await.is_none());
        assert!(h.store.snapshot().is_none());

        assert!(!h.manager.is_authenticated().await);
        assert_eq!(h.provider.refreshes(), 1);
        assert_eq!(h.manager.state().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_explicit_refresh_rejected() {
        let h = harness(FakeProvider::rejecting(), Some(tokens("T1", Some("R1"), 3600)));

        assert!(matches!(
            h.manager.refresh().await,
            Err(Error::RefreshRejected(_))
        ));
        assert!(h.store.snapshot().is_none());
        assert!(h.manager.transport().await.is_none());
    }

    #[tokio::test]
    async fn test_logout() {
        let h = harness(FakeProvider::new(), Some(tokens("T1", Some("R1"), 3600)));

        h.manager.logout().await;
        assert!(!h.manager.is_authenticated().await);
        assert!(h.store.snapshot().is_none());

        // Logging out twice is harmless.
        h.manager.logout().await;
    }

    #[tokio::test]
    async fn test_transport_never_exposes_expired_token() {
        let h = harness(FakeProvider::new(), Some(tokens("T1", Some("R1"), -10)));
        assert!(h.manager.transport().await.is_none());

        assert!(h.manager.is_authenticated().await);
        assert_eq!(h.manager.transport().await.unwrap().access_token(), "T2");
    }

    #[tokio::test]
    async fn test_consent_url() {
        let h = harness(FakeProvider::new(), None);
        assert_eq!(
            h.manager.consent_url(),
            "https://accounts.example.com/auth?access_type=offline"
        );
    }

    #[tokio::test]
    async fn test_surface_options_reach_surface() {
        let (surface, mut windows) = ChannelSurface::new();
        let manager = Arc::new(
            AuthSessionManager::new(
                Arc::new(FakeProvider::new()),
                Arc::new(MemoryCredentialStore::new()),
                Arc::new(surface),
            )
            .with_surface_options(SurfaceOptions {
                parent: Some("main-window".to_string()),
                modal: false,
            }),
        );

        let flow = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.authenticate().await })
        };

        let window = windows.recv().await.unwrap();
        assert_eq!(window.options.parent.as_deref(), Some("main-window"));
        assert!(!window.options.modal);

        window.dismiss();
        assert!(!flow.await.unwrap().unwrap());
    }

    #[test]
    fn test_parse_redirect() {
        let redirect = "http://127.0.0.1:8417/callback";

        assert!(parse_redirect("https://accounts.google.com/signin", redirect, "s").is_none());
        assert_eq!(
            parse_redirect("http://127.0.0.1:8417/callback?code=xyz&state=s", redirect, "s")
                .unwrap()
                .unwrap(),
            "xyz"
        );
        assert!(parse_redirect("http://127.0.0.1:8417/callback?code=xyz&state=other", redirect, "s")
            .unwrap()
            .is_err());
        assert!(parse_redirect("http://127.0.0.1:8417/callback", redirect, "s")
            .unwrap()
            .is_err());
        assert_eq!(
            parse_redirect("urn:ietf:wg:oauth:2.0:oob?code=abc123", OOB_REDIRECT_URI, "s")
                .unwrap()
                .unwrap(),
            "abc123"
        );
    }
}
