//! Now-playing cache with stale-on-failure fallback

use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::client::{FetchError, FetchRequest, Fetcher};
use crate::auth::{AuthError, TokenManager};
use crate::clock::Clock;
use crate::models::{CurrentlyPlaying, PlaybackSnapshot};

const PLAYBACK_TIMEOUT: Duration = Duration::from_secs(8);

/// Why a fetch produced no new snapshot.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("no access token: {0}")]
    NoToken(#[from] AuthError),
    #[error(transparent)]
    Upstream(#[from] FetchError),
    #[error("now-playing endpoint returned HTTP {0}")]
    Status(u16),
    #[error("malformed now-playing response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("nothing is playing")]
    NothingPlaying,
}

/// Latest known playback state.
///
/// Every call attempts a live fetch; when that fails for any reason the last
/// successfully observed snapshot is returned instead.
pub struct PlaybackCache {
    tokens: TokenManager,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    url: String,
    retained: RwLock<Option<PlaybackSnapshot>>,
}

impl PlaybackCache {
    pub fn new(
        tokens: TokenManager,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            fetcher,
            clock,
            url: url.into(),
            retained: RwLock::new(None),
        }
    }

    /// Current snapshot, or the retained one if upstream has nothing new.
    pub async fn current(&self) -> Option<PlaybackSnapshot> {
        match self.fetch().await {
            Ok(snapshot) => Some(self.swap(snapshot)),
            Err(e) => {
                match &e {
                    PlaybackError::NothingPlaying | PlaybackError::NoToken(_) => {
                        tracing::debug!("Serving retained playback: {}", e)
                    }
                    _ => tracing::warn!("Serving retained playback: {}", e),
                }
                self.retained()
            }
        }
    }

    pub fn retained(&self) -> Option<PlaybackSnapshot> {
        self.retained
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One upstream round trip; no shared state is touched.
    pub async fn fetch(&self) -> Result<PlaybackSnapshot, PlaybackError> {
        let token = self.tokens.access_token().await?;

        let resp = self
            .fetcher
            .fetch(
                FetchRequest::get(self.url.as_str())
                    .bearer_auth(&token)
                    .timeout(PLAYBACK_TIMEOUT),
            )
            .await?;

        if !resp.is_success() {
            return Err(PlaybackError::Status(resp.status));
        }
        if resp.body.iter().all(u8::is_ascii_whitespace) {
            return Err(PlaybackError::NothingPlaying);
        }

        let body: CurrentlyPlaying = serde_json::from_slice(&resp.body)?;
        PlaybackSnapshot::from_response(body, self.clock.now()).ok_or(PlaybackError::NothingPlaying)
    }

    /// Install `snapshot` unless a newer one landed while it was in flight.
    fn swap(&self, snapshot: PlaybackSnapshot) -> PlaybackSnapshot {
        let mut retained = self.retained.write().unwrap_or_else(|e| e.into_inner());
        match retained.as_ref() {
            Some(newer) if newer.observed_at > snapshot.observed_at => newer.clone(),
            _ => {
                *retained = Some(snapshot.clone());
                snapshot
            }
        }
    }
}
