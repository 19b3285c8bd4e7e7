//! Configuration and credential storage

mod settings;

pub use settings::{Settings, SettingsUpdate, TickerMode};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::auth::{Credential, CredentialStore};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server binds to
    pub host: String,
    pub port: u16,
    /// Spotify app registration
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub spotify_redirect_uri: String,
    /// Stored Spotify access token; empty when absent
    pub access_token: String,
    /// Stored Spotify refresh token; empty until first authorization
    pub refresh_token: String,
    /// Epoch seconds after which `access_token` is invalid
    pub token_expires_at: i64,
    /// Hex SHA-256 of the settings password; unset until first login
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_password_hash: Option<String>,
    /// Base delay for backing off a failing ticker feed; 0 disables
    pub ticker_failure_backoff_secs: u64,
    pub settings: Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            spotify_client_id: String::new(),
            spotify_client_secret: String::new(),
            spotify_redirect_uri: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            token_expires_at: 0,
            settings_password_hash: None,
            ticker_failure_backoff_secs: 0,
            settings: Settings::default(),
        }
    }
}

impl Config {
    pub fn credential(&self) -> Credential {
        Credential {
            client_id: self.spotify_client_id.clone(),
            client_secret: self.spotify_client_secret.clone(),
            redirect_uri: self.spotify_redirect_uri.clone(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.token_expires_at,
        }
    }

    pub fn apply_credential(&mut self, credential: &Credential) {
        self.spotify_client_id = credential.client_id.clone();
        self.spotify_client_secret = credential.client_secret.clone();
        self.spotify_redirect_uri = credential.redirect_uri.clone();
        self.access_token = credential.access_token.clone();
        self.refresh_token = credential.refresh_token.clone();
        self.token_expires_at = credential.expires_at;
    }
}

/// The config file on disk.
///
/// Every write is a load-modify-save of the whole file under one lock, so
/// credential and settings updates never overwrite each other.
pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Config file in the platform config directory
    pub fn default_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "nowplaying-kiosk", "nowplaying-kiosk")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load configuration from disk; a missing file yields defaults.
    pub fn load(&self) -> Result<Config> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read()
    }

    /// Apply `change` to the stored configuration and write it back.
    pub fn update<R>(&self, change: impl FnOnce(&mut Config) -> R) -> Result<R> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut config = self.read()?;
        let result = change(&mut config);
        self.write(&config)?;
        Ok(result)
    }

    fn read(&self) -> Result<Config> {
        if !self.path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&self.path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    fn write(&self, config: &Config) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }
}

impl CredentialStore for ConfigStore {
    fn load(&self) -> Result<Credential> {
        Ok(ConfigStore::load(self)?.credential())
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        self.update(|config| config.apply_credential(credential))
    }
}
