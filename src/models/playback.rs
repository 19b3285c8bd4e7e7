//! Playback-related models

use serde::{Deserialize, Serialize, Serializer};

/// Now-playing state as shown on the kiosk.
///
/// Replaced wholesale on every successful fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackSnapshot {
    pub track_id: String,
    pub track_name: String,
    /// Display names in credit order; sent to clients joined by ", "
    #[serde(serialize_with = "join_artists")]
    pub artists: Vec<String>,
    pub album_name: String,
    pub album_art: String,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
    pub observed_at: i64,
}

impl PlaybackSnapshot {
    /// Build a snapshot from a currently-playing response, if it has an item.
    pub fn from_response(resp: CurrentlyPlaying, observed_at: i64) -> Option<Self> {
        let item = resp.item?;
        let album = item.album.unwrap_or_default();
        let album_art = album
            .images
            .into_iter()
            .next()
            .map(|image| image.url)
            .unwrap_or_default();

        Some(Self {
            track_id: item.id.unwrap_or_default(),
            track_name: item.name.unwrap_or_default(),
            artists: item.artists.into_iter().map(|a| a.name).collect(),
            album_name: album.name.unwrap_or_default(),
            album_art,
            progress_ms: resp.progress_ms.unwrap_or(0),
            duration_ms: item.duration_ms.unwrap_or(0),
            is_playing: resp.is_playing.unwrap_or(false),
            observed_at,
        })
    }
}

fn join_artists<S: Serializer>(artists: &[String], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&artists.join(", "))
}

/// Body of `GET /v1/me/player/currently-playing`
#[derive(Debug, Deserialize)]
pub struct CurrentlyPlaying {
    #[serde(default)]
    pub item: Option<PlayingItem>,
    #[serde(default)]
    pub progress_ms: Option<u64>,
    #[serde(default)]
    pub is_playing: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PlayingItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub album: Option<Album>,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Album {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
pub struct Image {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct Artist {
    pub name: String,
}
