//! Access-token lifecycle: authorization-code grant, refresh, rotation

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt, Shared};
use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::url::Url;
use oauth2::{
    AccessToken, AuthType, AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret, CsrfToken,
    HttpRequest, HttpResponse, RedirectUrl, RefreshToken, RequestTokenError, Scope,
    StandardRevocableToken, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};

use super::tokens::{expires_at_from, ClientCredentials, Credential, CredentialStore, TokenState};
use super::{AuthConfig, AuthError};
use crate::api::client::{FetchError, FetchRequest, Fetcher};
use crate::clock::Clock;

const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Authorize URLs whose `state` is still accepted on the callback
const MAX_PENDING_AUTHORIZATIONS: usize = 4;

type RefreshFuture = Shared<BoxFuture<'static, Result<String, AuthError>>>;

type GrantClient = Client<
    BasicErrorResponse,
    GrantResponse,
    BasicTokenType,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
>;

/// Token endpoint reply. Spotify's contract only promises `access_token`,
/// so `token_type` defaults to bearer when omitted.
#[derive(Debug, Serialize, Deserialize)]
struct GrantResponse {
    access_token: AccessToken,
    #[serde(default = "bearer")]
    token_type: BasicTokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
}

fn bearer() -> BasicTokenType {
    BasicTokenType::Bearer
}

impl TokenResponse<BasicTokenType> for GrantResponse {
    fn access_token(&self) -> &AccessToken {
        &self.access_token
    }

    fn token_type(&self) -> &BasicTokenType {
        &self.token_type
    }

    fn expires_in(&self) -> Option<Duration> {
        self.expires_in.map(Duration::from_secs)
    }

    fn refresh_token(&self) -> Option<&RefreshToken> {
        self.refresh_token.as_ref()
    }

    fn scopes(&self) -> Option<&Vec<Scope>> {
        None
    }
}

/// Produces valid access tokens, refreshing transparently.
///
/// The credential is loaded once and then kept in memory; every change is
/// written back through the [`CredentialStore`]. A refresh re-reads the
/// store first, so edits made by another process (e.g. `logout`) win.
/// Concurrent callers that find the token expired share a single
/// in-flight refresh.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    endpoints: AuthConfig,
    store: Arc<dyn CredentialStore>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    credential: Mutex<Credential>,
    in_flight: Mutex<Option<RefreshFuture>>,
    /// `state` values of the most recent authorize URLs, oldest first
    pending_states: Mutex<VecDeque<String>>,
    /// Set while the in-memory credential has changes the store rejected
    unsaved: AtomicBool,
}

/// Credential summary for status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStatus {
    pub connected: bool,
    pub access_token: TokenState,
    pub client_id: String,
    pub redirect_uri: String,
}

impl TokenManager {
    pub fn new(
        endpoints: AuthConfig,
        store: Arc<dyn CredentialStore>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let credential = store.load().context("Failed to load credential")?;
        Ok(Self {
            inner: Arc::new(Inner {
                endpoints,
                store,
                fetcher,
                clock,
                credential: Mutex::new(credential),
                in_flight: Mutex::new(None),
                pending_states: Mutex::new(VecDeque::new()),
                unsaved: AtomicBool::new(false),
            }),
        })
    }

    /// Return a valid access token, refreshing it if expired or absent.
    ///
    /// An unexpired token is returned without any I/O. Errors mean "no
    /// token available right now" and are never fatal to the caller.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.inner.fresh_token() {
            return Ok(token);
        }

        let refresh = {
            let mut slot = lock(&self.inner.in_flight);
            // A refresh may have completed while we waited for the slot
            if let Some(token) = self.inner.fresh_token() {
                return Ok(token);
            }
            match slot.as_ref() {
                Some(refresh) => refresh.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let refresh = async move {
                        let outcome = inner.refresh().await;
                        lock(&inner.in_flight).take();
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await
    }

    /// Build the provider consent URL and remember its `state`.
    pub fn authorize_url(&self) -> Result<Url, AuthError> {
        let credential = self.inner.snapshot();
        let client = self.inner.oauth_client(&credential)?;

        let (url, state) = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(
                self.inner
                    .endpoints
                    .scopes
                    .iter()
                    .map(|s| Scope::new(s.to_string())),
            )
            .add_extra_param("show_dialog", "true")
            .url();

        let mut pending = lock(&self.inner.pending_states);
        pending.push_back(state.secret().clone());
        while pending.len() > MAX_PENDING_AUTHORIZATIONS {
            pending.pop_front();
        }
        Ok(url)
    }

    /// Complete the consent flow by exchanging an authorization code.
    ///
    /// This is the one path that reports failure to its caller.
    pub async fn exchange_code(
        &self,
        code: Option<&str>,
        state: Option<&str>,
    ) -> Result<(), AuthError> {
        let code = code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::AuthorizationRequired("missing authorization code".into()))?;

        {
            let mut pending = lock(&self.inner.pending_states);
            if pending.is_empty() {
                return Err(AuthError::AuthorizationRequired(
                    "no authorization in progress".into(),
                ));
            }
            let position = state.and_then(|state| pending.iter().position(|p| p == state));
            match position {
                Some(index) => {
                    pending.remove(index);
                }
                None => {
                    return Err(AuthError::AuthorizationRequired(
                        "state does not match a pending authorization".into(),
                    ))
                }
            }
        }

        let credential = self.inner.snapshot();
        let client = self.inner.oauth_client(&credential)?;

        tracing::info!("Exchanging authorization code...");
        let response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(|request| self.inner.send(request))
            .await
            .map_err(|e| {
                AuthError::AuthorizationRequired(format!("code exchange failed: {}", classify(e)))
            })?;

        let now = self.inner.clock.now();
        {
            let mut current = self.inner.lock_credential();
            current.access_token = response.access_token().secret().clone();
            current.refresh_token = response
                .refresh_token()
                .map(|t| t.secret().clone())
                .unwrap_or_default();
            current.expires_at = expires_at_from(now, response.expires_in().map(|d| d.as_secs()));
            self.inner.persist(&current)?;
        }

        tracing::info!("Authorization complete");
        Ok(())
    }

    /// Replace the client registration. Any change invalidates the tokens.
    ///
    /// Returns whether anything changed.
    pub fn reconfigure(&self, client: ClientCredentials) -> Result<bool, AuthError> {
        let mut current = self.inner.lock_credential();
        if current.client_id == client.client_id
            && current.client_secret == client.client_secret
            && current.redirect_uri == client.redirect_uri
        {
            return Ok(false);
        }
        current.client_id = client.client_id;
        current.client_secret = client.client_secret;
        current.redirect_uri = client.redirect_uri;
        current.clear_tokens();

        tracing::info!("Client credentials changed, stored tokens cleared");
        self.inner.persist(&current)?;
        Ok(true)
    }

    /// Forget the access and refresh tokens.
    pub fn logout(&self) -> Result<(), AuthError> {
        let mut current = self.inner.lock_credential();
        current.clear_tokens();
        self.inner.persist(&current)
    }

    pub fn status(&self) -> AuthStatus {
        let credential = self.inner.snapshot();
        AuthStatus {
            connected: credential.has_refresh_token(),
            access_token: credential.token_state(self.inner.clock.now()),
            client_id: credential.client_id,
            redirect_uri: credential.redirect_uri,
        }
    }

    pub fn credential(&self) -> Credential {
        self.inner.snapshot()
    }
}

impl Inner {
    fn lock_credential(&self) -> MutexGuard<'_, Credential> {
        lock(&self.credential)
    }

    fn snapshot(&self) -> Credential {
        self.lock_credential().clone()
    }

    fn fresh_token(&self) -> Option<String> {
        let now = self.clock.now();
        self.lock_credential().fresh_token(now).map(String::from)
    }

    /// Write the credential back. Callers hold the credential lock so the
    /// store and memory change together.
    fn persist(&self, credential: &Credential) -> Result<(), AuthError> {
        let saved = self.store.save(credential);
        self.unsaved.store(saved.is_err(), Ordering::Release);
        saved.map_err(|e| AuthError::Storage(format!("{:#}", e)))
    }

    /// Adopt the stored credential when another writer changed it.
    ///
    /// Skipped while memory holds changes the store rejected, so a stale
    /// file never replaces them.
    fn reload(&self) -> Credential {
        let mut current = self.lock_credential();
        if self.unsaved.load(Ordering::Acquire) {
            return current.clone();
        }
        match self.store.load() {
            Ok(stored) => {
                if *current != stored {
                    tracing::info!("Stored credential changed, reloading");
                    *current = stored;
                }
            }
            Err(e) => tracing::warn!("Could not reload credential: {:#}", e),
        }
        current.clone()
    }

    fn oauth_client(&self, credential: &Credential) -> Result<GrantClient, AuthError> {
        if credential.client_id.is_empty() {
            return Err(AuthError::NotConfigured("client id is not set"));
        }

        let mut client = GrantClient::new(
            ClientId::new(credential.client_id.clone()),
            Some(ClientSecret::new(credential.client_secret.clone())),
            AuthUrl::new(self.endpoints.authorize_url.to_string())?,
            Some(TokenUrl::new(self.endpoints.token_url.to_string())?),
        )
        .set_auth_type(AuthType::RequestBody);

        if !credential.redirect_uri.is_empty() {
            client = client.set_redirect_uri(RedirectUrl::new(credential.redirect_uri.clone())?);
        }
        Ok(client)
    }

    /// Exchange the stored refresh token for a new access token.
    async fn refresh(&self) -> Result<String, AuthError> {
        let used = self.reload();
        if let Some(token) = used.fresh_token(self.clock.now()) {
            return Ok(token.to_string());
        }
        if !used.has_refresh_token() {
            return Err(AuthError::CredentialMissing);
        }
        let client = self.oauth_client(&used)?;

        tracing::info!("Access token expired or absent, refreshing...");
        let refresh_token = RefreshToken::new(used.refresh_token.clone());
        let result = client
            .exchange_refresh_token(&refresh_token)
            .request_async(|request| self.send(request))
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let err = classify(e);
                tracing::warn!("Token refresh failed: {}", err);
                return Err(err);
            }
        };

        let now = self.clock.now();
        let mut current = self.lock_credential();
        if current.refresh_token != used.refresh_token || current.client_id != used.client_id {
            tracing::info!("Credential replaced during refresh, discarding result");
            return Err(AuthError::UpstreamUnavailable(
                "credential replaced during refresh".into(),
            ));
        }
        apply_refresh(&mut current, &response, now);

        if let Err(e) = self.persist(&current) {
            tracing::error!("Refreshed token not persisted: {}", e);
        }
        tracing::info!("Access token refreshed");
        Ok(current.access_token.clone())
    }

    /// Route an oauth2 grant request through the configured [`Fetcher`].
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let url = request.url.to_string();
        let mut fetch = if request.method == oauth2::http::Method::GET {
            FetchRequest::get(url.clone())
        } else {
            FetchRequest::post(url.clone())
        };
        for (name, value) in request.headers.iter() {
            if let Ok(value) = value.to_str() {
                fetch = fetch.header(name.as_str(), value);
            }
        }
        let fetch = fetch.body(request.body).timeout(TOKEN_TIMEOUT);

        let response = self.fetcher.fetch(fetch).await?;
        let status_code = oauth2::http::StatusCode::from_u16(response.status).map_err(|e| {
            FetchError::Transport {
                url,
                message: e.to_string(),
            }
        })?;

        Ok(HttpResponse {
            status_code,
            headers: oauth2::http::HeaderMap::new(),
            body: response.body,
        })
    }
}

/// Store a refresh-grant response, rotating the refresh token when one is issued.
fn apply_refresh(credential: &mut Credential, response: &GrantResponse, now: i64) {
    credential.access_token = response.access_token().secret().clone();
    credential.expires_at = expires_at_from(now, response.expires_in().map(|d| d.as_secs()));
    if let Some(rotated) = response.refresh_token() {
        credential.refresh_token = rotated.secret().clone();
    }
}

fn classify(err: RequestTokenError<FetchError, BasicErrorResponse>) -> AuthError {
    match err {
        RequestTokenError::ServerResponse(resp) => {
            AuthError::UpstreamUnavailable(format!("grant rejected: {}", resp))
        }
        RequestTokenError::Request(e) => AuthError::UpstreamUnavailable(e.to_string()),
        RequestTokenError::Parse(e, _) => AuthError::MalformedResponse(e.to_string()),
        RequestTokenError::Other(msg) => AuthError::UpstreamUnavailable(msg),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        test_endpoints, token_body, ManualClock, MemoryCredentialStore, MockFetcher, TOKEN_URL,
    };

    struct Harness {
        manager: TokenManager,
        store: Arc<MemoryCredentialStore>,
        fetcher: Arc<MockFetcher>,
        clock: Arc<ManualClock>,
    }

    fn harness(credential: Credential, fetcher: MockFetcher) -> Harness {
        let store = Arc::new(MemoryCredentialStore::new(credential));
        let fetcher = Arc::new(fetcher);
        let clock = Arc::new(ManualClock::new(10_000));
        let manager = TokenManager::new(
            test_endpoints(),
            store.clone(),
            fetcher.clone(),
            clock.clone(),
        )
        .unwrap();
        Harness {
            manager,
            store,
            fetcher,
            clock,
        }
    }

    fn registered() -> Credential {
        Credential {
            client_id: "cid".into(),
            client_secret: "shh".into(),
            redirect_uri: "http://127.0.0.1:5000/callback".into(),
            ..Credential::default()
        }
    }

    fn expired() -> Credential {
        Credential {
            access_token: "old-access".into(),
            refresh_token: "r1".into(),
            expires_at: 9_000,
            ..registered()
        }
    }

    #[tokio::test]
    async fn test_fresh_token_needs_no_network() {
        let h = harness(
            Credential {
                access_token: "live".into(),
                refresh_token: "r1".into(),
                expires_at: 20_000,
                ..registered()
            },
            MockFetcher::new(),
        );

        for _ in 0..5 {
            assert_eq!(h.manager.access_token().await.unwrap(), "live");
            h.clock.advance(100);
        }
        assert_eq!(h.fetcher.total_calls(), 0);
        assert_eq!(h.store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, token_body("new-access", Some(3600), None));
        let h = harness(expired(), fetcher);

        assert_eq!(h.manager.access_token().await.unwrap(), "new-access");
        assert_eq!(h.fetcher.calls_to(TOKEN_URL), 1);

        let body = h.fetcher.last_body(TOKEN_URL);
        assert!(body.contains("grant_type=refresh_token"), "{}", body);
        assert!(body.contains("refresh_token=r1"), "{}", body);
        assert!(body.contains("client_id=cid"), "{}", body);
        assert!(body.contains("client_secret=shh"), "{}", body);

        let saved = h.store.current();
        assert_eq!(saved.access_token, "new-access");
        assert_eq!(saved.expires_at, 10_000 + 3570);
        assert_eq!(saved.refresh_token, "r1");

        // Second call is served from memory
        assert_eq!(h.manager.access_token().await.unwrap(), "new-access");
        assert_eq!(h.fetcher.calls_to(TOKEN_URL), 1);
    }

    #[tokio::test]
    async fn test_absent_token_triggers_refresh() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, token_body("first", Some(3600), None));
        let h = harness(
            Credential {
                refresh_token: "r1".into(),
                expires_at: 50_000,
                ..registered()
            },
            fetcher,
        );

        assert_eq!(h.manager.access_token().await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_refresh_rotates_refresh_token_when_issued() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, token_body("a2", Some(3600), Some("r2")));
        let h = harness(expired(), fetcher);

        h.manager.access_token().await.unwrap();
        assert_eq!(h.store.current().refresh_token, "r2");
        assert_eq!(h.manager.credential().refresh_token, "r2");
    }

    #[tokio::test]
    async fn test_zero_lifetime_is_floored() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, token_body("short", Some(0), None));
        let h = harness(expired(), fetcher);

        h.manager.access_token().await.unwrap();
        assert_eq!(h.manager.credential().expires_at, 10_060);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_unavailable() {
        let h = harness(registered(), MockFetcher::new());

        let err = h.manager.access_token().await.unwrap_err();
        assert_eq!(err, AuthError::CredentialMissing);
        assert_eq!(h.fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_leaves_credential_unchanged() {
        let fetcher = MockFetcher::new();
        fetcher.reply(
            TOKEN_URL,
            400,
            r#"{"error":"invalid_grant","error_description":"Refresh token revoked"}"#,
        );
        let h = harness(expired(), fetcher);

        let err = h.manager.access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::UpstreamUnavailable(_)), "{:?}", err);
        assert_eq!(h.manager.credential(), expired());
        assert_eq!(h.store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_unavailable() {
        let fetcher = MockFetcher::new();
        fetcher.fail(TOKEN_URL);
        let h = harness(expired(), fetcher);

        tokio_test::assert_err!(h.manager.access_token().await);

        // The failed refresh does not stick; the next call tries again
        h.fetcher
            .reply(TOKEN_URL, 200, token_body("recovered", Some(3600), None));
        assert_eq!(h.manager.access_token().await.unwrap(), "recovered");
        assert_eq!(h.fetcher.calls_to(TOKEN_URL), 2);
    }

    #[tokio::test]
    async fn test_malformed_refresh_response() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, "<html>oops</html>");
        let h = harness(expired(), fetcher);

        let err = h.manager.access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let fetcher = MockFetcher::with_delay(Duration::from_millis(50));
        fetcher.reply(TOKEN_URL, 200, token_body("shared", Some(3600), Some("r2")));
        let h = harness(expired(), fetcher);

        let calls = (0..8).map(|_| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.access_token().await })
        });
        let results = futures::future::join_all(calls).await;

        for result in results {
            assert_eq!(result.unwrap().unwrap(), "shared");
        }
        assert_eq!(h.fetcher.calls_to(TOKEN_URL), 1);
        assert_eq!(h.store.current().refresh_token, "r2");
    }

    #[tokio::test]
    async fn test_refresh_response_without_token_type() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, r#"{"access_token":"new","expires_in":3600}"#);
        let h = harness(expired(), fetcher);

        assert_eq!(h.manager.access_token().await.unwrap(), "new");
        assert_eq!(h.store.current().expires_at, 10_000 + 3570);
        assert_eq!(h.store.current().refresh_token, "r1");
    }

    #[tokio::test]
    async fn test_refresh_sees_logout_from_another_process() {
        let h = harness(expired(), MockFetcher::new());

        let mut cleared = expired();
        cleared.clear_tokens();
        h.store.save(&cleared).unwrap();

        let err = h.manager.access_token().await.unwrap_err();
        assert_eq!(err, AuthError::CredentialMissing);
        assert_eq!(h.fetcher.total_calls(), 0);
        assert!(!h.manager.status().connected);
    }

    #[tokio::test]
    async fn test_refresh_uses_refresh_token_rotated_elsewhere() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, token_body("a9", Some(3600), None));
        let h = harness(expired(), fetcher);

        h.store
            .save(&Credential {
                refresh_token: "r9".into(),
                ..expired()
            })
            .unwrap();

        assert_eq!(h.manager.access_token().await.unwrap(), "a9");
        let body = h.fetcher.last_body(TOKEN_URL);
        assert!(body.contains("refresh_token=r9"), "{}", body);
        assert_eq!(h.store.current().refresh_token, "r9");
    }

    #[tokio::test]
    async fn test_refresh_adopts_token_refreshed_elsewhere() {
        let h = harness(expired(), MockFetcher::new());

        h.store
            .save(&Credential {
                access_token: "theirs".into(),
                expires_at: 20_000,
                ..expired()
            })
            .unwrap();

        assert_eq!(h.manager.access_token().await.unwrap(), "theirs");
        assert_eq!(h.fetcher.total_calls(), 0);
    }

    /// Serves a fixed credential and refuses every write.
    struct ReadOnlyStore(Credential);

    impl CredentialStore for ReadOnlyStore {
        fn load(&self) -> anyhow::Result<Credential> {
            Ok(self.0.clone())
        }

        fn save(&self, _credential: &Credential) -> anyhow::Result<()> {
            anyhow::bail!("read-only filesystem")
        }
    }

    #[tokio::test]
    async fn test_unsaved_changes_are_not_replaced_by_stale_store() {
        let fetcher = Arc::new(MockFetcher::new());
        let manager = TokenManager::new(
            test_endpoints(),
            Arc::new(ReadOnlyStore(expired())),
            fetcher.clone(),
            Arc::new(ManualClock::new(10_000)),
        )
        .unwrap();

        let err = manager.logout().unwrap_err();
        assert!(matches!(err, AuthError::Storage(_)), "{:?}", err);

        let err = manager.access_token().await.unwrap_err();
        assert_eq!(err, AuthError::CredentialMissing);
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_authorize_url_parameters() {
        let h = harness(registered(), MockFetcher::new());

        let url = h.manager.authorize_url().unwrap();
        assert!(url.as_str().starts_with("https://accounts.test/authorize?"));

        let params: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "cid");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "http://127.0.0.1:5000/callback");
        assert_eq!(
            params["scope"],
            "user-read-playback-state user-read-currently-playing"
        );
        assert_eq!(params["show_dialog"], "true");
        assert!(!params["state"].is_empty());
    }

    #[tokio::test]
    async fn test_authorize_url_requires_client_id() {
        let h = harness(Credential::default(), MockFetcher::new());
        assert!(matches!(
            h.manager.authorize_url(),
            Err(AuthError::NotConfigured(_))
        ));
    }

    fn state_of(url: &Url) -> String {
        url.query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[tokio::test]
    async fn test_code_exchange_sets_both_tokens() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, token_body("a1", Some(3600), Some("r-new")));
        let h = harness(expired(), fetcher);

        let state = state_of(&h.manager.authorize_url().unwrap());
        h.manager
            .exchange_code(Some("the-code"), Some(&state))
            .await
            .unwrap();

        let body = h.fetcher.last_body(TOKEN_URL);
        assert!(body.contains("grant_type=authorization_code"), "{}", body);
        assert!(body.contains("code=the-code"), "{}", body);
        assert!(body.contains("redirect_uri="), "{}", body);

        let saved = h.store.current();
        assert_eq!(saved.access_token, "a1");
        assert_eq!(saved.refresh_token, "r-new");
        assert_eq!(saved.expires_at, 10_000 + 3570);
        assert!(h.manager.status().connected);
    }

    #[tokio::test]
    async fn test_code_exchange_without_refresh_token_clears_it() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, token_body("a1", Some(3600), None));
        let h = harness(expired(), fetcher);

        let state = state_of(&h.manager.authorize_url().unwrap());
        h.manager
            .exchange_code(Some("c"), Some(&state))
            .await
            .unwrap();
        assert_eq!(h.store.current().refresh_token, "");
    }

    #[tokio::test]
    async fn test_code_exchange_rejects_bad_state() {
        let h = harness(registered(), MockFetcher::new());
        h.manager.authorize_url().unwrap();

        let err = h
            .manager
            .exchange_code(Some("c"), Some("forged"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationRequired(_)));
        assert_eq!(h.fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_code_exchange_without_token_type() {
        let fetcher = MockFetcher::new();
        fetcher.reply(
            TOKEN_URL,
            200,
            r#"{"access_token":"a1","refresh_token":"r-new","expires_in":3600}"#,
        );
        let h = harness(registered(), fetcher);

        let state = state_of(&h.manager.authorize_url().unwrap());
        h.manager
            .exchange_code(Some("c"), Some(&state))
            .await
            .unwrap();

        let saved = h.store.current();
        assert_eq!(saved.access_token, "a1");
        assert_eq!(saved.refresh_token, "r-new");
    }

    #[tokio::test]
    async fn test_earlier_authorize_url_still_completes() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, token_body("a1", Some(3600), Some("r1")));
        let h = harness(registered(), fetcher);

        let first = state_of(&h.manager.authorize_url().unwrap());
        let second = state_of(&h.manager.authorize_url().unwrap());
        assert_ne!(first, second);

        h.manager
            .exchange_code(Some("c"), Some(&first))
            .await
            .unwrap();
        assert!(h.manager.status().connected);

        // Each state completes at most once
        let err = h
            .manager
            .exchange_code(Some("c"), Some(&first))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationRequired(_)));
        assert_eq!(h.fetcher.calls_to(TOKEN_URL), 1);
    }

    #[tokio::test]
    async fn test_oldest_pending_state_is_evicted() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 200, token_body("a1", Some(3600), Some("r1")));
        let h = harness(registered(), fetcher);

        let states: Vec<String> = (0..=MAX_PENDING_AUTHORIZATIONS)
            .map(|_| state_of(&h.manager.authorize_url().unwrap()))
            .collect();

        let err = h
            .manager
            .exchange_code(Some("c"), Some(&states[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationRequired(_)));
        assert_eq!(h.fetcher.total_calls(), 0);

        h.manager
            .exchange_code(Some("c"), Some(&states[1]))
            .await
            .unwrap();
        assert_eq!(h.fetcher.calls_to(TOKEN_URL), 1);
    }

    #[tokio::test]
    async fn test_code_exchange_requires_pending_authorization() {
        let h = harness(registered(), MockFetcher::new());
        let err = h
            .manager
            .exchange_code(Some("c"), Some("anything"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationRequired(_)));
    }

    #[tokio::test]
    async fn test_code_exchange_requires_code() {
        let h = harness(registered(), MockFetcher::new());
        let state = state_of(&h.manager.authorize_url().unwrap());

        for code in [None, Some("")] {
            let err = h
                .manager
                .exchange_code(code, Some(&state))
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::AuthorizationRequired(_)));
        }
    }

    #[tokio::test]
    async fn test_failed_code_exchange_is_reported() {
        let fetcher = MockFetcher::new();
        fetcher.reply(TOKEN_URL, 400, r#"{"error":"invalid_grant"}"#);
        let h = harness(registered(), fetcher);

        let state = state_of(&h.manager.authorize_url().unwrap());
        let err = h
            .manager
            .exchange_code(Some("c"), Some(&state))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationRequired(_)));
        assert!(!h.manager.status().connected);
    }

    #[tokio::test]
    async fn test_reconfigure_clears_tokens_on_change() {
        let h = harness(expired(), MockFetcher::new());

        let unchanged = ClientCredentials {
            client_id: "cid".into(),
            client_secret: "shh".into(),
            redirect_uri: "http://127.0.0.1:5000/callback".into(),
        };
        assert!(!h.manager.reconfigure(unchanged.clone()).unwrap());
        assert_eq!(h.store.save_count(), 0);
        assert_eq!(h.manager.credential().refresh_token, "r1");

        let changed = ClientCredentials {
            client_id: "other".into(),
            ..unchanged
        };
        assert!(h.manager.reconfigure(changed).unwrap());
        let saved = h.store.current();
        assert_eq!(saved.client_id, "other");
        assert_eq!(saved.refresh_token, "");
        assert_eq!(saved.access_token, "");
        assert_eq!(saved.expires_at, 0);
    }

    #[tokio::test]
    async fn test_logout_and_status() {
        let h = harness(
            Credential {
                access_token: "live".into(),
                refresh_token: "r1".into(),
                expires_at: 20_000,
                ..registered()
            },
            MockFetcher::new(),
        );
        let status = h.manager.status();
        assert!(status.connected);
        assert_eq!(
            status.access_token,
            TokenState::Valid { expires_at: 20_000 }
        );

        h.manager.logout().unwrap();
        let status = h.manager.status();
        assert!(!status.connected);
        assert_eq!(status.access_token, TokenState::Absent);
        assert_eq!(h.store.current().client_id, "cid");
    }
}
