//!
//! src/login.rs  Andrew Belles  Sept 18th, 2025
//!
//! One-time interactive authorization: a PKCE code flow against the
//! spotify accounts service with a local callback listener. The daemon
//! never drives this; it only consumes the token.json the flow writes.
//!

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use reqwest::{Client, RequestBuilder};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use url::Url;

use crate::config::{HttpConfig, SpotifyConfig, SyncConfig, SPOTIFY_SCOPE};
use crate::errors::SaverError;
use crate::fetch::{base_client, http_with_retry};
use crate::token::Credential;

/// Creates a random base64url encoded value, no padding.
fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// S256 challenge for a code verifier: BASE64URL(SHA256(verifier))
fn challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Path of the request line, e.g. "/callback?code=..&state=.."
fn request_path(request: &str) -> Option<&str> {
    request.lines().next()?.split_whitespace().nth(1)
}

/// Pulls code and state out of the callback query.
fn parse_callback(path: &str) -> Result<(String, String), SaverError> {
    let url = Url::parse(&format!("http://localhost{path}"))
        .map_err(|e| SaverError::Parse(format!("callback path: {e}")))?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => return Err(SaverError::Auth(
                format!("authorization denied: {value}")
            )),
            _ => {}
        }
    }
    match (code, state) {
        (Some(code), Some(state)) => Ok((code, state)),
        _ => Err(SaverError::Auth("callback missing code or state".to_string())),
    }
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        _ => "Not Found",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

pub struct Login {
    http: Client,
    cfg: SpotifyConfig,
    max_retry: usize,
    backoff_ms: u64,
    state: String,
    verifier: String,
    challenge: String,
}

impl Login {
    pub fn new(
        http_cfg: &HttpConfig,
        cfg: &SpotifyConfig,
        sync: &SyncConfig
    ) -> Result<Self, SaverError> {
        let http = base_client(http_cfg)?;
        let verifier = random_urlsafe(96);
        let challenge = challenge_for(&verifier);
        Ok( Self {
            http,
            cfg: cfg.clone(),
            max_retry: sync.http_max_retry,
            backoff_ms: sync.http_backoff_ms,
            state: random_urlsafe(20),
            verifier,
            challenge,
        })
    }

    fn auth_url(&self) -> Url {
        let mut url = self.cfg.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("redirect_uri", &self.cfg.callback_uri)
            .append_pair("scope", SPOTIFY_SCOPE)
            .append_pair("state", &self.state)
            .append_pair("code_challenge_method", "S256")
            .append_pair("code_challenge", &self.challenge);
        url
    }

    /// POST /api/token with the authorization code grant
    fn exchange_request(&self, code: &str) -> RequestBuilder {
        self.http.post(self.cfg.token_url.clone())
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.cfg.callback_uri.as_str()),
                ("client_id", self.cfg.client_id.as_str()),
                ("code_verifier", self.verifier.as_str()),
            ])
    }

    /// Opens the local callback listener, prints the authorization page
    /// url, and blocks until the browser redirect lands. Returns the
    /// freshly exchanged credential.
    pub async fn login(&self) -> Result<Credential, SaverError> {
        let callback = Url::parse(&self.cfg.callback_uri)
            .map_err(|e| SaverError::Config(
                format!("callback uri invalid: {e}")
            ))?;
        let host = callback.host_str().unwrap_or("127.0.0.1").to_string();
        let port = callback.port().unwrap_or(8080);
        let listener = TcpListener::bind((host.as_str(), port)).await?;

        let auth_url = self.auth_url();
        println!("Please log in to Spotify by visiting the following page in your browser:\n{auth_url}");

        let (code, state) = self.wait_for_callback(&listener, callback.path()).await?;
        if state != self.state {
            return Err(SaverError::Auth("state mismatch in callback".to_string()));
        }

        let value = http_with_retry(
            self.exchange_request(&code),
            self.max_retry,
            self.backoff_ms
        ).await?;

        let credential = Credential::from_token_response(&value, None)?;
        info!("login.exchanged");
        Ok(credential)
    }

    async fn wait_for_callback(
        &self,
        listener: &TcpListener,
        expected_path: &str
    ) -> Result<(String, String), SaverError> {
        loop {
            let (mut stream, _) = listener.accept().await?;
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await?;
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();

            let Some(path) = request_path(&request) else {
                respond(&mut stream, 400, "Bad request").await;
                continue;
            };

            // browsers also ask for favicons and such
            if !path.starts_with(expected_path) {
                respond(&mut stream, 404, "Not found").await;
                continue;
            }

            match parse_callback(path) {
                Ok(pair) => {
                    respond(&mut stream, 200,
                        "Login completed! You can close this tab.").await;
                    return Ok(pair);
                }
                Err(e) => {
                    warn!(error = %e, "login.callback.rejected");
                    respond(&mut stream, 403, "Couldn't complete login").await;
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_matches_the_rfc7636_vector() {
        // appendix B of RFC 7636
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            challenge_for(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_is_long_enough_for_pkce() {
        // RFC 7636 wants 43..=128 characters
        let verifier = random_urlsafe(96);
        assert_eq!(verifier.len(), 128);
        assert_ne!(random_urlsafe(96), verifier);
    }

    #[test]
    fn request_path_reads_the_request_line() {
        let request = "GET /callback?code=abc&state=xyz HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(request_path(request), Some("/callback?code=abc&state=xyz"));
        assert_eq!(request_path(""), None);
    }

    #[test]
    fn callback_query_parses_code_and_state() {
        let (code, state) = parse_callback("/callback?code=abc&state=xyz").unwrap();
        assert_eq!(code, "abc");
        assert_eq!(state, "xyz");
    }

    #[test]
    fn callback_without_code_is_an_auth_error() {
        match parse_callback("/callback?state=xyz") {
            Err(SaverError::Auth(_)) => {}
            other => panic!("expected Auth, got {other:?}"),
        }
    }

    #[test]
    fn denied_authorization_is_an_auth_error() {
        match parse_callback("/callback?error=access_denied&state=xyz") {
            Err(SaverError::Auth(msg)) => assert!(msg.contains("access_denied")),
            other => panic!("expected Auth, got {other:?}"),
        }
    }

    #[test]
    fn auth_url_carries_the_pkce_parameters() {
        let cfg = SpotifyConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            auth_url: Url::parse("https://accounts.spotify.com/authorize").unwrap(),
            token_url: Url::parse("https://accounts.spotify.com/api/token").unwrap(),
            api_base: Url::parse("https://api.spotify.com/v1/").unwrap(),
            callback_uri: "http://127.0.0.1:8080/callback".to_string(),
        };
        let login = Login::new(
            &HttpConfig::default(), &cfg, &SyncConfig::default()
        ).unwrap();

        let url = login.auth_url().to_string();
        assert!(url.contains("response_type=code"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={}", login.state)));
        assert!(url.contains("scope=user-read-recently-played"));
    }
}
