//! nowplaying-kiosk - backend for a Spotify "now playing" kiosk display
//!
//! Serves the current track and a scrolling feed ticker to the kiosk page.

mod api;
mod auth;
mod clock;
mod config;
mod models;
mod server;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{HttpFetcher, PlaybackCache, TickerCache};
use auth::{AuthConfig, TokenManager, TokenState};
use clock::SystemClock;
use config::ConfigStore;
use server::AppState;

#[derive(Parser)]
#[command(name = "nowplaying-kiosk")]
#[command(about = "Now-playing kiosk backend for Spotify", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the platform default
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve {
        /// Address to bind, overriding the config file
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, overriding the config file
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show Spotify connection status
    Status,

    /// Forget the stored Spotify tokens
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let store = Arc::new(match cli.config {
        Some(path) => ConfigStore::open(path),
        None => ConfigStore::open(ConfigStore::default_path()?),
    });
    tracing::debug!("Using config file {}", store.path().display());

    match cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    }) {
        Commands::Serve { host, port } => {
            let config = store.load()?;
            let host = host.unwrap_or(config.host);
            let port = port.unwrap_or(config.port);
            let state = app_state(store, config.ticker_failure_backoff_secs)?;
            server::serve(state, &host, port).await?;
        }
        Commands::Status => {
            let tokens = token_manager(store.clone())?;
            print_status(&tokens, &store);
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            token_manager(store)?.logout()?;
            println!("Logged out.");
        }
    }

    Ok(())
}

fn token_manager(store: Arc<ConfigStore>) -> Result<TokenManager> {
    TokenManager::new(
        AuthConfig::spotify(),
        store,
        Arc::new(HttpFetcher::new()?),
        Arc::new(SystemClock),
    )
}

fn app_state(store: Arc<ConfigStore>, ticker_backoff_secs: u64) -> Result<AppState> {
    let endpoints = AuthConfig::spotify();
    let fetcher = Arc::new(HttpFetcher::new()?);
    let clock = Arc::new(SystemClock);

    let tokens = TokenManager::new(
        endpoints.clone(),
        store.clone(),
        fetcher.clone(),
        clock.clone(),
    )?;
    let playback = PlaybackCache::new(
        tokens.clone(),
        fetcher.clone(),
        clock.clone(),
        endpoints.now_playing_url,
    );
    let ticker =
        TickerCache::new(fetcher, clock.clone()).with_failure_backoff(ticker_backoff_secs);

    Ok(AppState {
        store,
        tokens,
        playback: Arc::new(playback),
        ticker: Arc::new(ticker),
        clock,
    })
}

fn print_status(tokens: &TokenManager, store: &ConfigStore) {
    let status = tokens.status();

    println!("Config file: {}", store.path().display());
    if status.client_id.is_empty() {
        println!("Client:      not configured");
    } else {
        println!("Client:      {}", status.client_id);
        println!("  redirect:  {}", status.redirect_uri);
    }

    match status.access_token {
        TokenState::Valid { expires_at } => {
            println!("Access tok:  valid");
            match chrono::DateTime::from_timestamp(expires_at, 0) {
                Some(at) => println!("  expires_at: {}", at.to_rfc3339()),
                None => println!("  expires_at: {}", expires_at),
            }
        }
        TokenState::Expired => println!("Access tok:  expired"),
        TokenState::Absent => println!("Access tok:  none"),
    }

    if status.connected {
        println!("Refresh tok: present");
    } else {
        println!("Refresh tok: none (open /login on the kiosk to connect)");
    }
}
