//! Kiosk display settings

use serde::{Deserialize, Deserializer, Serialize};

use crate::auth::{ClientCredentials, Credential};

/// Where the ticker text comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TickerMode {
    Off,
    #[default]
    Text,
    Rss,
    Mixed,
}

impl TickerMode {
    /// Parse a mode name. Anything unrecognized falls back to `text`.
    pub fn parse(value: &str) -> Self {
        match value {
            "off" => Self::Off,
            "text" => Self::Text,
            "rss" => Self::Rss,
            "mixed" => Self::Mixed,
            _ => Self::Text,
        }
    }

    /// Whether this mode shows feed titles.
    pub fn consumes_feed(self) -> bool {
        matches!(self, Self::Rss | Self::Mixed)
    }
}

impl<'de> Deserialize<'de> for TickerMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.as_deref().map(Self::parse).unwrap_or_default())
    }
}

/// Display settings, stored under `[settings]` in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub theme: String,
    pub layout: String,
    pub text_scale: f64,
    pub logo_url: String,
    pub fallback_logo: String,
    pub show_ticker: bool,
    pub ticker_mode: TickerMode,
    pub ticker_text: String,
    pub ticker_font_size: u32,
    pub ticker_speed: u32,
    pub ticker_rss_url: String,
    /// Seconds between feed refreshes
    pub ticker_rss_interval: u64,
    /// Bumped on every change so open kiosk pages know to reload
    pub kiosk_force_reload_version: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: "dark".to_string(),
            layout: "horizontal".to_string(),
            text_scale: 1.0,
            logo_url: String::new(),
            fallback_logo: String::new(),
            show_ticker: true,
            ticker_mode: TickerMode::Text,
            ticker_text: String::new(),
            ticker_font_size: 22,
            ticker_speed: 50,
            ticker_rss_url: String::new(),
            ticker_rss_interval: 300,
            kiosk_force_reload_version: 0,
        }
    }
}

/// Body of `POST /api/settings`. Absent or null fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdate {
    pub theme: Option<String>,
    pub layout: Option<String>,
    pub text_scale: Option<f64>,
    pub logo_url: Option<String>,
    pub fallback_logo: Option<String>,
    pub show_ticker: Option<bool>,
    pub ticker_mode: Option<String>,
    pub ticker_text: Option<String>,
    pub ticker_font_size: Option<u32>,
    pub ticker_speed: Option<u32>,
    pub ticker_rss_url: Option<String>,
    pub ticker_rss_interval: Option<u64>,

    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
    pub spotify_redirect_uri: Option<String>,
}

impl SettingsUpdate {
    /// Copy every provided display field into `settings`.
    pub fn apply_to(&self, settings: &mut Settings) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }

        set(&mut settings.theme, &self.theme);
        set(&mut settings.layout, &self.layout);
        set(&mut settings.text_scale, &self.text_scale);
        set(&mut settings.logo_url, &self.logo_url);
        set(&mut settings.fallback_logo, &self.fallback_logo);
        set(&mut settings.show_ticker, &self.show_ticker);
        set(&mut settings.ticker_text, &self.ticker_text);
        set(&mut settings.ticker_font_size, &self.ticker_font_size);
        set(&mut settings.ticker_speed, &self.ticker_speed);
        set(&mut settings.ticker_rss_url, &self.ticker_rss_url);
        set(&mut settings.ticker_rss_interval, &self.ticker_rss_interval);
        if let Some(mode) = &self.ticker_mode {
            settings.ticker_mode = TickerMode::parse(mode);
        }
    }

    /// Client registration after this update, or `None` if it changes nothing.
    ///
    /// Empty values never overwrite what is on file.
    pub fn client_credentials(&self, current: &Credential) -> Option<ClientCredentials> {
        let pick = |update: &Option<String>, existing: &str| match update.as_deref() {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => existing.to_string(),
        };

        let client = ClientCredentials {
            client_id: pick(&self.spotify_client_id, &current.client_id),
            client_secret: pick(&self.spotify_client_secret, &current.client_secret),
            redirect_uri: pick(&self.spotify_redirect_uri, &current.redirect_uri),
        };

        let unchanged = client.client_id == current.client_id
            && client.client_secret == current.client_secret
            && client.redirect_uri == current.redirect_uri;
        (!unchanged).then_some(client)
    }
}
