//! JSON API for the kiosk and settings pages

pub mod session;

use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{PlaybackCache, TickerCache};
use crate::auth::{AuthError, TokenManager};
use crate::clock::Clock;
use crate::config::{ConfigStore, Settings, SettingsUpdate};
use session::PasswordCheck;

/// Handles shared by every route
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub tokens: TokenManager,
    pub playback: Arc<PlaybackCache>,
    pub ticker: Arc<TickerCache>,
    pub clock: Arc<dyn Clock>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/now-playing", get(now_playing))
        .route("/api/ticker/rss", get(ticker_rss))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/settings/login", post(settings_login))
        .route("/api/settings/change-password", post(change_password))
        .route("/api/refresh-kiosk", post(refresh_kiosk))
        .route("/login", get(spotify_login))
        .route("/callback", get(spotify_callback))
        .with_state(state)
}

/// Bind `host:port` and serve until the process is stopped.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, router(state))
        .await
        .context("HTTP server failed")
}

/// Failure of an API request, rendered as `{ok: false, error}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid password")]
    InvalidPassword,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized | ApiError::InvalidPassword => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth(
                AuthError::AuthorizationRequired(_)
                | AuthError::NotConfigured(_)
                | AuthError::InvalidEndpoint(_)
                | AuthError::CredentialMissing,
            ) => StatusCode::BAD_REQUEST,
            ApiError::Auth(AuthError::UpstreamUnavailable(_) | AuthError::MalformedResponse(_)) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Auth(AuthError::Storage(_)) | ApiError::Internal(_) => {
                tracing::error!("Request failed: {:#}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "ok": false, "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn now_playing(State(state): State<AppState>) -> Json<Value> {
    let data = state.playback.current().await;
    Json(json!({ "ok": true, "data": data }))
}

/// Never fails: an unreadable config serves defaults and the retained items.
async fn ticker_rss(State(state): State<AppState>) -> Json<Value> {
    let settings = match state.store.load() {
        Ok(config) => config.settings,
        Err(e) => {
            tracing::warn!("Ticker settings unavailable: {:#}", e);
            let items = state.ticker.snapshot().items;
            return Json(json!({ "settings": Settings::default(), "items": items }));
        }
    };
    let items = state
        .ticker
        .items(
            settings.ticker_mode,
            &settings.ticker_rss_url,
            settings.ticker_rss_interval,
        )
        .await;
    Json(json!({ "settings": settings, "items": items }))
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let config = state.store.load()?;
    let status = state.tokens.status();
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "settings": config.settings,
        "spotify_connected": status.connected,
        "spotify_client_id": status.client_id,
        "spotify_redirect_uri": status.redirect_uri,
    })))
}

fn require_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let config = state.store.load()?;
    if session::is_authorized(headers, config.settings_password_hash.as_deref()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn bad_json(rejection: JsonRejection) -> ApiError {
    ApiError::BadRequest(rejection.body_text())
}

async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SettingsUpdate>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    require_auth(&state, &headers)?;
    let Json(update) = payload.map_err(bad_json)?;

    if let Some(client) = update.client_credentials(&state.tokens.credential()) {
        state.tokens.reconfigure(client)?;
    }

    let now = state.clock.now();
    let settings = state.store.update(|config| {
        update.apply_to(&mut config.settings);
        config.settings.kiosk_force_reload_version = now;
        config.settings.clone()
    })?;
    tracing::info!("Settings updated");

    Ok(Json(json!({ "ok": true, "settings": settings })))
}

async fn refresh_kiosk(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_auth(&state, &headers)?;
    let now = state.clock.now();
    state
        .store
        .update(|config| config.settings.kiosk_force_reload_version = now)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    password: String,
}

async fn settings_login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(login) = payload.map_err(bad_json)?;
    let config = state.store.load()?;

    let stored_hash = config.settings_password_hash.as_deref();
    let hash = match session::check_password(stored_hash, &login.password) {
        PasswordCheck::Accepted => stored_hash.unwrap_or_default().to_string(),
        PasswordCheck::Bootstrap(hash) => {
            tracing::warn!("Bootstrap settings password used; change it from the settings page");
            let stored = hash.clone();
            state
                .store
                .update(|config| config.settings_password_hash = Some(stored))?;
            hash
        }
        PasswordCheck::Rejected => return Err(ApiError::InvalidPassword),
    };

    Ok(with_session(&hash, json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    #[serde(default)]
    old_password: String,
    #[serde(default)]
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> ApiResult<Response> {
    require_auth(&state, &headers)?;
    let Json(change) = payload.map_err(bad_json)?;

    let config = state.store.load()?;
    if session::check_password(config.settings_password_hash.as_deref(), &change.old_password)
        == PasswordCheck::Rejected
    {
        return Err(ApiError::InvalidPassword);
    }
    if change.new_password.is_empty() {
        return Err(ApiError::BadRequest("New password must not be empty".into()));
    }

    let hash = session::hash_password(&change.new_password);
    let stored = hash.clone();
    state
        .store
        .update(|config| config.settings_password_hash = Some(stored))?;
    tracing::info!("Settings password changed");

    Ok(with_session(&hash, json!({ "ok": true })))
}

fn with_session(password_hash: &str, body: Value) -> Response {
    (
        [(SET_COOKIE, session::session_cookie(password_hash))],
        Json(body),
    )
        .into_response()
}

async fn spotify_login(State(state): State<AppState>) -> ApiResult<Redirect> {
    let url = state.tokens.authorize_url()?;
    Ok(Redirect::to(url.as_str()))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn spotify_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error.as_deref() {
        tracing::warn!("Authorization denied by provider: {}", error);
    }

    match state
        .tokens
        .exchange_code(params.code.as_deref(), params.state.as_deref())
        .await
    {
        Ok(()) => Redirect::to("/settings").into_response(),
        Err(AuthError::AuthorizationRequired(message)) => {
            tracing::warn!("Authorization callback rejected: {}", message);
            (StatusCode::BAD_REQUEST, message).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
