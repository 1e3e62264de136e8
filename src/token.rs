//!
//! src/token.rs  Andrew Belles  Sept 15th, 2025
//!
//! Defines the durable credential slot the saver survives restarts with.
//! The on-disk shape stays compatible with the token.json the login
//! flow writes: access_token, token_type, refresh_token, expiry.
//!

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::SaverError;

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// OAuth token pair plus expiry. A missing refresh token means the
/// access token cannot be renewed once it expires.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expiry: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: i64
    ) -> Self {
        Self {
            access_token,
            token_type: default_token_type(),
            refresh_token,
            expiry: Utc::now() + Duration::seconds(expires_in),
        }
    }

    /// Builds a credential from a token endpoint response. The endpoint may
    /// omit the refresh token on a refresh grant, in which case the previous
    /// one stays valid and is carried over.
    pub fn from_token_response(
        value: &serde_json::Value,
        previous_refresh: Option<String>
    ) -> Result<Self, SaverError> {
        let access_token = value.get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SaverError::Parse(
                "token response missing access_token".to_string()
            ))?
            .to_string();
        let token_type = value.get("token_type")
            .and_then(|v| v.as_str())
            .unwrap_or("Bearer")
            .to_string();
        let expires_in = value.get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(3600);
        let refresh_token = value.get("refresh_token")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or(previous_refresh);

        Ok( Self {
            access_token,
            token_type,
            refresh_token,
            expiry: Utc::now() + Duration::seconds(expires_in),
        })
    }

    pub fn has_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expiry
    }

    /// True when the token expires within the next `secs` seconds.
    pub fn expires_within(&self, secs: i64) -> bool {
        Utc::now() + Duration::seconds(secs) >= self.expiry
    }
}

// never log token values
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[redacted]")
            .field("token_type", &self.token_type)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Persistence for the live credential. One writer at a time; load at
/// startup, save after every cycle.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Credential, SaverError>;
    async fn save(&self, credential: &Credential) -> Result<(), SaverError>;
}

pub struct TokenFile {
    path: PathBuf
}

impl TokenFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    fn read_slot(&self) -> Result<Credential, SaverError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SaverError::NotFound(
                    format!("token file {}", self.path.display())
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let credential: Credential = serde_json::from_slice(&bytes)
            .map_err(|e| SaverError::Parse(
                format!("token file {}: {e}", self.path.display())
            ))?;

        // an expired access token is still usable if it can be renewed
        if credential.is_expired() && !credential.has_refresh() {
            return Err(SaverError::TokenExpired(credential.expiry.to_rfc3339()));
        }
        Ok(credential)
    }

    fn write_slot(&self, credential: &Credential) -> Result<(), SaverError> {
        let parent = self.path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        // write-then-rename so a concurrent reader never sees a torn file
        let temp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer(temp.as_file(), credential)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        temp.persist(&self.path).map_err(|e| SaverError::Io(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for TokenFile {
    async fn load(&self) -> Result<Credential, SaverError> {
        let credential = self.read_slot()?;
        debug!(path = %self.path.display(), "token.loaded");
        Ok(credential)
    }

    async fn save(&self, credential: &Credential) -> Result<(), SaverError> {
        self.write_slot(credential)?;
        debug!(path = %self.path.display(), "token.saved");
        Ok(())
    }
}
