//!
//! src/testutil.rs  Andrew Belles  Sept 17th, 2025
//!
//! In-memory fakes for the saver's three collaborators. Each mirrors the
//! failure surface of the real thing: the store rejects duplicate primary
//! keys and can inject lookup failures, the source replays scripted
//! batches, the token slot counts saves.
//!

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::errors::SaverError;
use crate::fetch::{HistorySource, PlayEvent};
use crate::persistent::{ArtistRow, ArtistTrackRow, HistoryRow, Storage, TrackRow};
use crate::token::{Credential, CredentialStore};

#[derive(Default)]
struct MemoryInner {
    tracks: HashMap<String, TrackRow>,
    artists: HashMap<String, ArtistRow>,
    history: Vec<HistoryRow>,
    links: Vec<ArtistTrackRow>,
    fail_track_lookups: HashSet<String>,
    fail_artist_lookups: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_track(&self, row: TrackRow) {
        self.inner.lock().unwrap().tracks.insert(row.id.clone(), row);
    }

    pub fn seed_artist(&self, row: ArtistRow) {
        self.inner.lock().unwrap().artists.insert(row.id.clone(), row);
    }

    pub fn fail_track_lookup(&self, id: &str) {
        self.inner.lock().unwrap().fail_track_lookups.insert(id.to_string());
    }

    pub fn fail_artist_lookup(&self, id: &str) {
        self.inner.lock().unwrap().fail_artist_lookups.insert(id.to_string());
    }

    pub fn track_count(&self) -> usize {
        self.inner.lock().unwrap().tracks.len()
    }

    pub fn artist_count(&self) -> usize {
        self.inner.lock().unwrap().artists.len()
    }

    pub fn history_count(&self) -> usize {
        self.inner.lock().unwrap().history.len()
    }

    pub fn link_count(&self) -> usize {
        self.inner.lock().unwrap().links.len()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn find_track(&self, id: &str) -> Result<Option<TrackRow>, SaverError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_track_lookups.contains(id) {
            return Err(SaverError::Db(format!("injected lookup failure for {id}")));
        }
        Ok(inner.tracks.get(id).cloned())
    }

    async fn find_artist(&self, id: &str) -> Result<Option<ArtistRow>, SaverError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_artist_lookups.contains(id) {
            return Err(SaverError::Db(format!("injected lookup failure for {id}")));
        }
        Ok(inner.artists.get(id).cloned())
    }

    async fn insert_tracks(&self, rows: &[TrackRow]) -> Result<(), SaverError> {
        let mut inner = self.inner.lock().unwrap();
        // whole set or nothing, like one transaction per set
        for row in rows {
            if inner.tracks.contains_key(&row.id) {
                return Err(SaverError::Db(
                    format!("UNIQUE constraint failed: tracks.id ({})", row.id)
                ));
            }
        }
        for row in rows {
            inner.tracks.insert(row.id.clone(), row.clone());
        }
        Ok(())
    }

    async fn insert_artists(&self, rows: &[ArtistRow]) -> Result<(), SaverError> {
        let mut inner = self.inner.lock().unwrap();
        for row in rows {
            if inner.artists.contains_key(&row.id) {
                return Err(SaverError::Db(
                    format!("UNIQUE constraint failed: artists.id ({})", row.id)
                ));
            }
        }
        for row in rows {
            inner.artists.insert(row.id.clone(), row.clone());
        }
        Ok(())
    }

    async fn insert_history(&self, rows: &[HistoryRow]) -> Result<(), SaverError> {
        self.inner.lock().unwrap().history.extend_from_slice(rows);
        Ok(())
    }

    async fn insert_links(&self, rows: &[ArtistTrackRow]) -> Result<(), SaverError> {
        self.inner.lock().unwrap().links.extend_from_slice(rows);
        Ok(())
    }

    async fn max_played_at(&self) -> Result<Option<DateTime<Utc>>, SaverError> {
        Ok(self.inner.lock().unwrap().history.iter().map(|h| h.played_at).max())
    }
}

/// Replays one scripted batch (or error) per fetch, recording the fetch
/// windows it was asked for. Falls back to empty batches once drained.
pub struct ScriptedSource {
    batches: Mutex<VecDeque<Result<Vec<PlayEvent>, SaverError>>>,
    calls: Mutex<Vec<DateTime<Utc>>>,
    token: Mutex<Credential>,
    cancel_on_fetch: Mutex<Option<CancellationToken>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            token: Mutex::new(Credential::new(
                "scripted-access".to_string(),
                Some("scripted-refresh".to_string()),
                3600
            )),
            cancel_on_fetch: Mutex::new(None),
        }
    }

    pub fn push_batch(&self, events: Vec<PlayEvent>) {
        self.batches.lock().unwrap().push_back(Ok(events));
    }

    pub fn push_error(&self, error: SaverError) {
        self.batches.lock().unwrap().push_back(Err(error));
    }

    /// The `after` argument of every fetch made so far.
    pub fn calls(&self) -> Vec<DateTime<Utc>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn rotate_token(&self, credential: Credential) {
        *self.token.lock().unwrap() = credential;
    }

    /// Cancels the given token while a fetch is in flight, for the
    /// finish-the-cycle-then-stop contract.
    pub fn cancel_on_fetch(&self, token: CancellationToken) {
        *self.cancel_on_fetch.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl HistorySource for ScriptedSource {
    async fn fetch_since(
        &self,
        after: DateTime<Utc>,
        _limit: u32
    ) -> Result<Vec<PlayEvent>, SaverError> {
        self.calls.lock().unwrap().push(after);
        if let Some(token) = self.cancel_on_fetch.lock().unwrap().as_ref() {
            token.cancel();
        }
        self.batches.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn current_token(&self) -> Credential {
        self.token.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<Credential>>,
    saves: Mutex<usize>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }

    pub fn current(&self) -> Option<Credential> {
        self.slot.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryTokenStore {
    async fn load(&self) -> Result<Credential, SaverError> {
        self.slot.lock().unwrap().clone()
            .ok_or_else(|| SaverError::NotFound("empty token slot".to_string()))
    }

    async fn save(&self, credential: &Credential) -> Result<(), SaverError> {
        *self.slot.lock().unwrap() = Some(credential.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}
