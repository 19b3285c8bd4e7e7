//! Feed-title cache for the scrolling ticker

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use xml::reader::{EventReader, XmlEvent};

use super::client::{FetchError, FetchRequest, Fetcher};
use crate::clock::Clock;
use crate::config::TickerMode;
use crate::models::{TickerSnapshot, MAX_TICKER_ITEMS};

const FEED_TIMEOUT: Duration = Duration::from_secs(8);

/// Why a feed refresh failed. Either way the previous titles are kept.
#[derive(Debug, thiserror::Error)]
pub enum TickerError {
    #[error("feed fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("feed returned HTTP {0}")]
    Status(u16),
    #[error("feed is not well-formed XML: {0}")]
    Parse(#[from] xml::reader::Error),
}

#[derive(Debug, Default)]
struct Failures {
    consecutive: u32,
    retry_at: i64,
}

/// Bounded list of feed titles, refetched once its interval has elapsed.
pub struct TickerCache {
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    retained: RwLock<TickerSnapshot>,
    refreshing: AtomicBool,
    /// Base delay for exponential backoff after failures; 0 retries immediately
    backoff_base_secs: u64,
    failures: Mutex<Failures>,
}

impl TickerCache {
    pub fn new(fetcher: Arc<dyn Fetcher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            fetcher,
            clock,
            retained: RwLock::new(TickerSnapshot::default()),
            refreshing: AtomicBool::new(false),
            backoff_base_secs: 0,
            failures: Mutex::new(Failures::default()),
        }
    }

    pub fn with_failure_backoff(mut self, base_secs: u64) -> Self {
        self.backoff_base_secs = base_secs;
        self
    }

    pub fn snapshot(&self) -> TickerSnapshot {
        self.retained
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Current titles, refreshing from `feed_url` when the interval has passed.
    ///
    /// Only `rss` and `mixed` modes read the feed. Never fails: on any error
    /// the previous titles are returned and the next call may retry.
    pub async fn items(&self, mode: TickerMode, feed_url: &str, interval_secs: u64) -> Vec<String> {
        let feed_url = feed_url.trim();
        if !mode.consumes_feed() || feed_url.is_empty() {
            return self.snapshot().items;
        }

        let now = self.clock.now();
        let interval = i64::try_from(interval_secs).unwrap_or(i64::MAX);
        let is_due = |snapshot: &TickerSnapshot| now.saturating_sub(snapshot.fetched_at) > interval;

        let snapshot = self.snapshot();
        if !is_due(&snapshot) || now < self.lock_failures().retry_at {
            return snapshot.items;
        }

        // Someone else is already fetching; serve what we have
        let Some(_claim) = RefreshClaim::acquire(&self.refreshing) else {
            return snapshot.items;
        };
        let snapshot = self.snapshot();
        if !is_due(&snapshot) {
            return snapshot.items;
        }

        match self.fetch(feed_url).await {
            Ok(items) => {
                tracing::debug!("Ticker feed refreshed: {} items", items.len());
                let fresh = TickerSnapshot {
                    items,
                    fetched_at: now,
                };
                *self.retained.write().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
                *self.lock_failures() = Failures::default();
                fresh.items
            }
            Err(e) => {
                tracing::warn!("Ticker feed refresh failed, keeping previous items: {}", e);
                self.record_failure(now, interval_secs);
                snapshot.items
            }
        }
    }

    /// Fetch and parse the feed without touching the cache.
    pub async fn fetch(&self, feed_url: &str) -> Result<Vec<String>, TickerError> {
        let resp = self
            .fetcher
            .fetch(FetchRequest::get(feed_url).timeout(FEED_TIMEOUT))
            .await?;
        if !resp.is_success() {
            return Err(TickerError::Status(resp.status));
        }
        Ok(parse_titles(&resp.body)?)
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, Failures> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_failure(&self, now: i64, interval_secs: u64) {
        let mut failures = self.lock_failures();
        failures.consecutive = failures.consecutive.saturating_add(1);
        if self.backoff_base_secs == 0 {
            return;
        }
        let factor = 1u64
            .checked_shl(failures.consecutive - 1)
            .unwrap_or(u64::MAX);
        let delay = self
            .backoff_base_secs
            .saturating_mul(factor)
            .min(interval_secs);
        failures.retry_at = now.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));
        tracing::debug!(
            "Ticker feed failed {} times in a row, next attempt in {}s",
            failures.consecutive,
            delay
        );
    }
}

/// Exclusive right to refresh the feed, released on drop.
struct RefreshClaim<'a>(&'a AtomicBool);

impl<'a> RefreshClaim<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RefreshClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Frame {
    /// Item-like element; `titled` once one of its children supplied a title
    Item { titled: bool },
    /// Title-like child of an untitled item; `open` until its first child element
    Title { text: String, open: bool },
    Other,
}

/// Extract item titles from an RSS/Atom/RDF document, in document order.
///
/// An element whose local name ends with "item" (ASCII case-insensitive,
/// namespace prefix ignored) contributes the trimmed text of its first
/// direct child whose local name ends with "title" and whose text is not
/// blank. At most [`MAX_TICKER_ITEMS`] titles are returned, but the whole
/// document must be well-formed.
pub fn parse_titles(body: &[u8]) -> Result<Vec<String>, xml::reader::Error> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut titles = Vec::new();

    for event in EventReader::new(body) {
        match event? {
            XmlEvent::StartElement { name, .. } => {
                let local = name.local_name.to_ascii_lowercase();
                let wants_title = matches!(stack.last(), Some(Frame::Item { titled: false }));
                if let Some(Frame::Title { open, .. }) = stack.last_mut() {
                    *open = false;
                }

                let frame = if wants_title
                    && local.ends_with("title")
                    && titles.len() < MAX_TICKER_ITEMS
                {
                    Frame::Title {
                        text: String::new(),
                        open: true,
                    }
                } else if local.ends_with("item") {
                    Frame::Item { titled: false }
                } else {
                    Frame::Other
                };
                stack.push(frame);
            }
            XmlEvent::Characters(s) | XmlEvent::CData(s) | XmlEvent::Whitespace(s) => {
                if let Some(Frame::Title { text, open: true }) = stack.last_mut() {
                    text.push_str(&s);
                }
            }
            XmlEvent::EndElement { .. } => {
                if let Some(Frame::Title { text, .. }) = stack.pop() {
                    let title = text.trim();
                    // A blank title leaves the item open for its next title-like child
                    if !title.is_empty() {
                        titles.push(title.to_string());
                        if let Some(Frame::Item { titled }) = stack.last_mut() {
                            *titled = true;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    titles.truncate(MAX_TICKER_ITEMS);
    Ok(titles)
}
