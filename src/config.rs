use std::path::PathBuf;
use std::time;
use url::Url;
use crate::errors::SaverError;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 8000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

/// Constants for the sync loop cadence
pub const SYNC_WARMUP_SECS: u64 = 5;
pub const SYNC_INTERVAL_SECS: u64 = 45 * 60;
pub const SYNC_PAGE_LIMIT: u32 = 50;
pub const SYNC_MAX_RETRY: usize = 3;
pub const SYNC_BACKOFF_MS: u64 = 500;

/// Scope the history endpoint requires
pub const SPOTIFY_SCOPE: &str = "user-read-recently-played";

/// Wrapper over env::var to return an invalid environment var error
fn env_check(s: &str) -> Result<String, SaverError> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(SaverError::Config(format!("{s} was not set"))),
    }
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_host(url: &Url, expected_host: &str) -> Result<(), String> {
    match url.host_str() {
        Some(h) if h.eq_ignore_ascii_case(expected_host) => Ok(()),
        Some(h) => Err(
            format!("Unexpected host for {url} (got {h}, expected {expected_host})")
        ),
        None => Err(format!("URL missing host: {url}"))
    }
}

fn env_to_u64(s: &str, default: u64) -> u64 {
    match std::env::var(s) {
        Ok(v) => v.parse::<u64>().unwrap_or(default),
        Err(_) => default
    }
}

fn env_to_u32(s: &str, default: u32) -> u32 {
    match std::env::var(s) {
        Ok(v) => v.parse::<u32>().unwrap_or(default),
        Err(_) => default
    }
}

/// Configuration that Spotify expects when hitting endpoints
#[derive(Debug, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: Url,
    pub token_url: Url,
    pub api_base: Url,
    pub callback_uri: String,
}

fn build_spotify() -> Result<SpotifyConfig, SaverError> {
    let client_id     = env_check("SPOTIFY_CLIENT_ID")?;
    let client_secret = env_check("SPOTIFY_CLIENT_SECRET")?;

    // form urls
    let auth_url = std::env::var("SPOTIFY_AUTH_URL")
        .unwrap_or_else(|_| "https://accounts.spotify.com/authorize".to_string());

    let token_url = std::env::var("SPOTIFY_TOKEN_URL")
        .unwrap_or_else(|_| "https://accounts.spotify.com/api/token".to_string());

    let api_base  = std::env::var("SPOTIFY_API_BASE")
        .unwrap_or_else(|_| "https://api.spotify.com/v1/".to_string());

    let callback_uri = std::env::var("SPOTIFY_CALLBACK_URI")
        .unwrap_or_else(|_| "http://127.0.0.1:8080/callback".to_string());

    let auth_url = Url::parse(&auth_url)
        .map_err(|_| SaverError::Config("SPOTIFY_AUTH_URL invalid".to_string()))?;

    let token_url = Url::parse(&token_url)
        .map_err(|_| SaverError::Config("SPOTIFY_TOKEN_URL invalid".to_string()))?;

    let mut api_base = Url::parse(&api_base)
        .map_err(|_| SaverError::Config("SPOTIFY_API_BASE invalid".to_string()))?;

    // ensure valid https and hostname for the remote endpoints
    ensure_https(&auth_url).map_err(SaverError::Config)?;
    ensure_https(&token_url).map_err(SaverError::Config)?;
    ensure_https(&api_base).map_err(SaverError::Config)?;
    ensure_host(&auth_url, "accounts.spotify.com")
        .map_err(SaverError::Config)?;
    ensure_host(&token_url, "accounts.spotify.com")
        .map_err(SaverError::Config)?;
    ensure_host(&api_base, "api.spotify.com")
        .map_err(SaverError::Config)?;

    if !api_base.path().ends_with('/') {
        let mut path = api_base.path().to_string();
        path.push('/');
        api_base.set_path(&path);
    }

    Ok( SpotifyConfig {
        client_id, client_secret, auth_url, token_url, api_base, callback_uri
    })
}

///
/// Configuration for Http timeouts, retries, etc.
///
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
        }
    }
}

///
/// Configuration for the synchronizer cadence and fetch window
///

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub warmup: time::Duration,      // first cycle after startup
    pub interval: time::Duration,    // every later cycle
    pub page_limit: u32,             // history page size, api max is 50
    pub http_max_retry: usize,
    pub http_backoff_ms: u64
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            warmup: time::Duration::from_secs(SYNC_WARMUP_SECS),
            interval: time::Duration::from_secs(SYNC_INTERVAL_SECS),
            page_limit: SYNC_PAGE_LIMIT,
            http_max_retry: SYNC_MAX_RETRY,
            http_backoff_ms: SYNC_BACKOFF_MS
        }
    }
}

fn build_sync() -> SyncConfig {
    SyncConfig {
        warmup: time::Duration::from_secs(
            env_to_u64("SYNC_WARMUP_SECS", SYNC_WARMUP_SECS)),
        interval: time::Duration::from_secs(
            env_to_u64("SYNC_INTERVAL_SECS", SYNC_INTERVAL_SECS)),
        page_limit: env_to_u32("SYNC_PAGE_LIMIT", SYNC_PAGE_LIMIT).min(50),
        http_max_retry: SYNC_MAX_RETRY,
        http_backoff_ms: SYNC_BACKOFF_MS
    }
}

///
/// Configuration for persistent storage in the sqlite db
///
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub db_url: String
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:./data/history.db".to_string()
        }
    }
}

fn build_persistence() -> PersistenceConfig {
    PersistenceConfig {
        db_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| PersistenceConfig::default().db_url)
    }
}

///
/// Configuration for the durable credential slot
///
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub path: PathBuf
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("token.json") }
    }
}

fn build_token() -> TokenConfig {
    TokenConfig {
        path: std::env::var("TOKEN_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| TokenConfig::default().path)
    }
}

///
/// Configuration for Logger
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives:
                "info,rs_history_saver=debug,reqwest=warn,sqlx=warn".to_string(),
            format: LogFormat::Json,
            with_ansi: true,
            include_file_line: true,
            include_target: true,
        }
    }
}

fn build_logging() -> LoggingConfig {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("pretty") => LogFormat::Pretty,
        _ => LogFormat::Json
    };
    LoggingConfig { format, ..LoggingConfig::default() }
}

///
/// AppConfig which holds everything the saver needs at startup
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spotify: SpotifyConfig,
    pub http: HttpConfig,
    pub sync: SyncConfig,
    pub persistence: PersistenceConfig,
    pub token: TokenConfig,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, SaverError> {
    dotenvy::dotenv().ok();

    let spotify     = build_spotify()?;
    let http        = HttpConfig::default();
    let sync        = build_sync();
    let persistence = build_persistence();
    let token       = build_token();
    let logging     = build_logging();

    Ok( AppConfig { spotify, http, sync, persistence, token, logging } )
}
