//! Credential record and storage

use anyhow::Result;

/// Safety margin subtracted from the server-reported token lifetime.
const EXPIRY_MARGIN_SECS: i64 = 30;
/// Shortest lifetime ever assigned to a freshly issued token.
const MIN_LIFETIME_SECS: i64 = 60;
/// Lifetime assumed when the token response carries no `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// OAuth client registration plus the tokens issued to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// Empty when absent.
    pub access_token: String,
    /// Empty until the first successful authorization.
    pub refresh_token: String,
    /// Seconds since epoch after which `access_token` is invalid.
    pub expires_at: i64,
}

impl Credential {
    /// The access token, if present and not yet expired at `now`.
    pub fn fresh_token(&self, now: i64) -> Option<&str> {
        if !self.access_token.is_empty() && now < self.expires_at {
            Some(&self.access_token)
        } else {
            None
        }
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    pub fn clear_tokens(&mut self) {
        self.access_token.clear();
        self.refresh_token.clear();
        self.expires_at = 0;
    }

    /// Access-token state at `now`, for status reporting.
    pub fn token_state(&self, now: i64) -> TokenState {
        if self.access_token.is_empty() {
            TokenState::Absent
        } else if now < self.expires_at {
            TokenState::Valid {
                expires_at: self.expires_at,
            }
        } else {
            TokenState::Expired
        }
    }
}

/// Compute the expiry instant for a token issued at `now`.
///
/// `now + max(60, expires_in - 30)`, with a missing `expires_in` read as 3600.
pub fn expires_at_from(now: i64, expires_in_secs: Option<u64>) -> i64 {
    let expires_in = expires_in_secs.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    let expires_in = i64::try_from(expires_in).unwrap_or(i64::MAX);
    now.saturating_add((expires_in.saturating_sub(EXPIRY_MARGIN_SECS)).max(MIN_LIFETIME_SECS))
}

/// Access-token state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid { expires_at: i64 },
    Expired,
    Absent,
}

/// Client registration fields editable by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Persistence backend for the credential.
///
/// `save` must be atomic from the caller's perspective.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Credential>;
    fn save(&self, credential: &Credential) -> Result<()>;
}
