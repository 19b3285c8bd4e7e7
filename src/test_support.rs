//! Scripted collaborators shared by unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::api::client::{FetchError, FetchRequest, FetchResponse, Fetcher};
use crate::auth::{AuthConfig, Credential, CredentialStore};
use crate::clock::Clock;

pub const TOKEN_URL: &str = "https://accounts.test/api/token";
pub const NOW_PLAYING_URL: &str = "https://api.test/v1/me/player/currently-playing";
pub const FEED_URL: &str = "https://news.test/feed.xml";

pub fn test_endpoints() -> AuthConfig {
    AuthConfig {
        authorize_url: "https://accounts.test/authorize",
        token_url: TOKEN_URL,
        now_playing_url: NOW_PLAYING_URL,
        ..AuthConfig::spotify()
    }
}

/// JSON body of a successful token response.
pub fn token_body(access: &str, expires_in: Option<u64>, refresh: Option<&str>) -> String {
    let mut body = serde_json::json!({
        "access_token": access,
        "token_type": "Bearer",
        "scope": "user-read-playback-state user-read-currently-playing",
    });
    if let Some(expires_in) = expires_in {
        body["expires_in"] = expires_in.into();
    }
    if let Some(refresh) = refresh {
        body["refresh_token"] = refresh.into();
    }
    body.to_string()
}

/// Fetcher that replays queued replies per URL and records every request.
///
/// A URL with no queued reply fails with a transport error.
#[derive(Default)]
pub struct MockFetcher {
    replies: Mutex<HashMap<String, VecDeque<Result<FetchResponse, FetchError>>>>,
    requests: Mutex<Vec<FetchRequest>>,
    delay: Option<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn push(&self, url: &str, reply: Result<FetchResponse, FetchError>) {
        self.replies
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn reply(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.push(url, Ok(FetchResponse::new(status, body)));
    }

    pub fn fail(&self, url: &str) {
        self.push(
            url,
            Err(FetchError::Transport {
                url: url.to_string(),
                message: "connection refused".into(),
            }),
        );
    }

    pub fn time_out(&self, url: &str) {
        self.push(
            url,
            Err(FetchError::Timeout {
                url: url.to_string(),
            }),
        );
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self, url: &str) -> FetchRequest {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.url == url)
            .cloned()
            .expect("no request recorded for url")
    }

    pub fn last_body(&self, url: &str) -> String {
        String::from_utf8(self.last_request(url).body).unwrap()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(|queue| queue.pop_front());
        reply.unwrap_or_else(|| {
            Err(FetchError::Transport {
                url: request.url.clone(),
                message: "no scripted reply".into(),
            })
        })
    }
}

/// Clock that only moves when told to.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-memory credential store that counts saves.
pub struct MemoryCredentialStore {
    credential: Mutex<Credential>,
    saves: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: Mutex::new(credential),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> Credential {
        self.credential.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> anyhow::Result<Credential> {
        Ok(self.current())
    }

    fn save(&self, credential: &Credential) -> anyhow::Result<()> {
        *self.credential.lock().unwrap() = credential.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
