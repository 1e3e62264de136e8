//!
//! src/fetch.rs  Andrew Belles  Sept 15th, 2025
//!
//! Defines methods for hitting the spotify history endpoint and
//! returning parsed play events, handling retries, token refresh, etc.
//!

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use reqwest::{header, redirect, Client, RequestBuilder};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{HttpConfig, SpotifyConfig, SyncConfig};
use crate::errors::SaverError;
use crate::token::Credential;

/// Seconds before expiry at which the access token gets renewed
pub const TOKEN_REFRESH_BUFFER_SECS: i64 = 60;

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

pub fn base_client(http: &HttpConfig) -> Result<Client, SaverError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_helper(http)
        .default_headers(h)
        .build()
        .map_err(|e| SaverError::Http(format!("build client: {e}")))
}

/// Simple function to generate random wait for http_with_retry
fn generate_backoff(ms: u64, attempt: usize, rng: &mut SmallRng) -> std::time::Duration {
    let exp = (1_u64 << attempt.min(6)) * ms;
    let jitter = rng.gen_range(50..=200) as u64;
    std::time::Duration::from_millis(exp + jitter)
}

/// Sends a request, retrying only 429s and server errors. Auth failures
/// come back immediately so a cycle never hammers a dead credential.
pub(crate) async fn http_with_retry(
    request: RequestBuilder,
    max_retries: usize,
    backoff_ms: u64
) -> Result<serde_json::Value, SaverError> {
    let mut rng = SmallRng::from_entropy();
    let mut attempt = 0_usize;
    loop {
        let response = request.try_clone()
            .ok_or_else(|| SaverError::Http("non-cloneable request".to_string()))?
            .send()
            .await;
        match response {
            Ok(resp) => {
                if resp.status().is_success() {
                    let v = resp.json::<serde_json::Value>().await?;
                    return Ok(v);
                }
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN {
                    return Err(SaverError::Auth(
                        format!("status {status}: {body}")
                    ));
                }
                let rate_limited = status.as_u16() == 429;
                let retryable = rate_limited || status.is_server_error();
                if !retryable || attempt >= max_retries {
                    if rate_limited {
                        return Err(SaverError::RateLimited(
                            format!("gave up after {attempt} retries")
                        ));
                    }
                    return Err(SaverError::Http(
                        format!("status {status} after {attempt} retries")
                    ));
                }
                let backoff = generate_backoff(backoff_ms, attempt, &mut rng);
                warn!(status = %status, backoff = ?backoff.as_millis(), "http.retry");
                sleep(backoff).await;
                attempt += 1;
            },
            Err(e) => {
                if attempt >= max_retries {
                    return Err(e.into());
                }
                let backoff = generate_backoff(backoff_ms, attempt, &mut rng);
                warn!(backoff = ?backoff.as_millis(), "http.retry.error");
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayArtist {
    pub id: String,
    pub name: String
}

/// One unit of playback history returned by the remote source
#[derive(Debug, Clone, PartialEq)]
pub struct PlayEvent {
    pub track_id: String,
    pub name: String,
    pub track_number: i64,
    pub disc_number: i64,
    pub explicit: bool,
    pub artists: Vec<PlayArtist>,
    pub played_at: DateTime<Utc>,
}

impl PlayEvent {
    /// Parses one item of the recently-played payload. Items without a
    /// track id or a readable timestamp are dropped by the caller.
    pub fn from_json(item: &serde_json::Value) -> Option<Self> {
        let track = item.get("track")?;
        let track_id = track.get("id")?.as_str()?.to_string();
        let played_at = item.get("played_at")?.as_str()?;
        let played_at = DateTime::parse_from_rfc3339(played_at)
            .ok()?
            .with_timezone(&Utc);

        let artists = track.get("artists")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|a| Some(PlayArtist {
                        id: a.get("id")?.as_str()?.to_string(),
                        name: a.get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                    }))
                    .collect()
            })
            .unwrap_or_default();

        Some( Self {
            track_id,
            name: track.get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            track_number: track.get("track_number").and_then(|v| v.as_i64()).unwrap_or(0),
            disc_number: track.get("disc_number").and_then(|v| v.as_i64()).unwrap_or(0),
            explicit: track.get("explicit").and_then(|v| v.as_bool()).unwrap_or(false),
            artists,
            played_at,
        })
    }
}

/// The remote history capability the synchronizer polls. The daemon holds
/// the real spotify client, tests hold a scripted fake.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Events strictly after `after`, at most `limit` of them, any order.
    async fn fetch_since(
        &self,
        after: DateTime<Utc>,
        limit: u32
    ) -> Result<Vec<PlayEvent>, SaverError>;

    /// Whatever token the transport currently holds, rotations included.
    async fn current_token(&self) -> Credential;
}

pub struct SpotifyClient {
    http: Client,
    cfg: SpotifyConfig,
    max_retry: usize,
    backoff_ms: u64,
    token: Mutex<Credential>,
}

impl SpotifyClient {
    pub fn new(
        http_cfg: &HttpConfig,
        cfg: &SpotifyConfig,
        sync: &SyncConfig,
        credential: Credential
    ) -> Result<Self, SaverError> {
        let http = base_client(http_cfg)?;
        Ok( Self {
            http,
            cfg: cfg.clone(),
            max_retry: sync.http_max_retry,
            backoff_ms: sync.http_backoff_ms,
            token: Mutex::new(credential),
        })
    }

    /// GET /v1/me/player/recently-played?after=<ms>&limit=<n>
    fn recently_played(&self, after_ms: i64, limit: u32, bearer: &str) -> RequestBuilder {
        let url = self.cfg.api_base.join("me/player/recently-played").unwrap();
        self.http.get(url)
            .bearer_auth(bearer)
            .query(&[
                ("after", after_ms.to_string()),
                ("limit", limit.to_string())
            ])
    }

    /// POST /api/token with the refresh grant
    fn refresh_request(&self, refresh_token: &str) -> RequestBuilder {
        self.http.post(self.cfg.token_url.clone())
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token)
            ])
    }

    /// Renews the held token when it is expired or about to expire and a
    /// refresh token exists. Spotify may omit the refresh token in the
    /// response; the previous one is carried over.
    async fn ensure_fresh(&self, token: &mut Credential) -> Result<(), SaverError> {
        if !token.expires_within(TOKEN_REFRESH_BUFFER_SECS) {
            return Ok(());
        }
        let Some(refresh_token) = token.refresh_token.clone()
            .filter(|t| !t.is_empty()) else {
            if token.is_expired() {
                return Err(SaverError::Auth(
                    "access token expired with no refresh token".to_string()
                ));
            }
            return Ok(());
        };

        let value = http_with_retry(
            self.refresh_request(&refresh_token),
            self.max_retry,
            self.backoff_ms
        ).await?;

        *token = Credential::from_token_response(&value, Some(refresh_token))?;
        debug!(expiry = %token.expiry, "spotify.token.refreshed");
        Ok(())
    }
}

#[async_trait]
impl HistorySource for SpotifyClient {
    async fn fetch_since(
        &self,
        after: DateTime<Utc>,
        limit: u32
    ) -> Result<Vec<PlayEvent>, SaverError> {
        let bearer = {
            let mut token = self.token.lock().await;
            self.ensure_fresh(&mut token).await?;
            token.access_token.clone()
        };

        // the `after` cursor is exclusive at millisecond precision
        let request = self.recently_played(after.timestamp_millis(), limit, &bearer);
        let value = http_with_retry(request, self.max_retry, self.backoff_ms).await?;

        let items = value.get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut events = Vec::with_capacity(items.len());
        for item in &items {
            match PlayEvent::from_json(item) {
                Some(event) => events.push(event),
                None => warn!("spotify.item.unparseable"),
            }
        }
        debug!(count = events.len(), "spotify.fetch.done");
        Ok(events)
    }

    async fn current_token(&self) -> Credential {
        self.token.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recently_played_item() -> serde_json::Value {
        serde_json::json!({
            "track": {
                "id": "6GtOsEzNUhJghrIf6UTbRV",
                "name": "Breathe Deeper",
                "track_number": 6,
                "disc_number": 1,
                "explicit": true,
                "artists": [
                    { "id": "5INjqkS1o8h1imAzPqGZBb", "name": "Tame Impala" },
                    { "id": "6icQOAFXDZKsumw3YXyusw", "name": "Lil Yachty" }
                ]
            },
            "played_at": "2024-01-01T12:30:45.123Z"
        })
    }

    #[test]
    fn play_event_parses_full_item() {
        let event = PlayEvent::from_json(&recently_played_item()).unwrap();
        assert_eq!(event.track_id, "6GtOsEzNUhJghrIf6UTbRV");
        assert_eq!(event.name, "Breathe Deeper");
        assert_eq!(event.track_number, 6);
        assert_eq!(event.disc_number, 1);
        assert!(event.explicit);
        assert_eq!(event.artists.len(), 2);
        assert_eq!(event.artists[0].name, "Tame Impala");
        assert_eq!(event.played_at.timestamp_millis(), 1_704_112_245_123);
    }

    #[test]
    fn play_event_without_track_id_is_dropped() {
        let mut item = recently_played_item();
        item["track"].as_object_mut().unwrap().remove("id");
        assert!(PlayEvent::from_json(&item).is_none());
    }

    #[test]
    fn play_event_with_bad_timestamp_is_dropped() {
        let mut item = recently_played_item();
        item["played_at"] = serde_json::json!("yesterday");
        assert!(PlayEvent::from_json(&item).is_none());
    }

    #[test]
    fn play_event_tolerates_missing_optionals() {
        let item = serde_json::json!({
            "track": { "id": "t1" },
            "played_at": "2024-01-01T00:00:00Z"
        });
        let event = PlayEvent::from_json(&item).unwrap();
        assert_eq!(event.track_id, "t1");
        assert_eq!(event.name, "");
        assert_eq!(event.track_number, 0);
        assert!(!event.explicit);
        assert!(event.artists.is_empty());
    }
}
