//! Authentication module for the Spotify Web API
//!
//! Implements the OAuth2 authorization-code grant for initial consent and
//! the refresh-token grant for keeping the access token alive.

pub mod oauth;
pub mod tokens;

pub use oauth::TokenManager;
pub use tokens::{ClientCredentials, Credential, CredentialStore, TokenState};

/// OAuth provider endpoints
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Authorization endpoint the browser is redirected to
    pub authorize_url: &'static str,
    /// Token endpoint for code and refresh grants
    pub token_url: &'static str,
    /// Currently-playing endpoint of the protected API
    pub now_playing_url: &'static str,
    /// Scopes requested on consent
    pub scopes: &'static [&'static str],
}

impl AuthConfig {
    pub fn spotify() -> Self {
        Self {
            authorize_url: "https://accounts.spotify.com/authorize",
            token_url: "https://accounts.spotify.com/api/token",
            now_playing_url: "https://api.spotify.com/v1/me/player/currently-playing",
            scopes: &["user-read-playback-state", "user-read-currently-playing"],
        }
    }
}

/// Why no access token could be produced.
///
/// `Clone` so one failed refresh can be handed to every caller sharing it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no refresh token on file")]
    CredentialMissing,
    #[error("client not configured: {0}")]
    NotConfigured(&'static str),
    #[error("invalid OAuth endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("token endpoint unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("malformed token response: {0}")]
    MalformedResponse(String),
    #[error("authorization required: {0}")]
    AuthorizationRequired(String),
    #[error("failed to persist credential: {0}")]
    Storage(String),
}

impl From<oauth2::url::ParseError> for AuthError {
    fn from(e: oauth2::url::ParseError) -> Self {
        Self::InvalidEndpoint(e.to_string())
    }
}
