//! Upstream data sources: now-playing and the feed ticker

pub mod client;
mod playback;
mod ticker;

pub use client::HttpFetcher;
pub use playback::PlaybackCache;
pub use ticker::TickerCache;
