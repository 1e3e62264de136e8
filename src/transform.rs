//!
//! src/transform.rs  Andrew Belles  Sept 16th, 2025
//!
//! Converts a fetched batch of play events into the minimal set of new
//! rows. History is never deduplicated; tracks and artists are checked
//! against the batch first, then against storage.
//!

use tracing::{debug, error};

use crate::errors::SaverError;
use crate::fetch::PlayEvent;
use crate::persistent::{ArtistRow, ArtistTrackRow, HistoryRow, Storage, TrackRow};

/// Row counts actually committed in one cycle, for the cycle log line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitStats {
    pub tracks: usize,
    pub artists: usize,
    pub history: usize,
    pub links: usize,
}

/// The per-cycle working set: fetched events plus the four staged row
/// sets. Discarded after commit.
pub struct FetchedBatch {
    fetched: Vec<PlayEvent>,

    history: Vec<HistoryRow>,
    tracks: Vec<TrackRow>,
    artists: Vec<ArtistRow>,
    links: Vec<ArtistTrackRow>,
}

fn track_row(event: &PlayEvent) -> TrackRow {
    TrackRow {
        id: event.track_id.clone(),
        name: event.name.clone(),
        track_number: event.track_number,
        disc_number: event.disc_number,
        explicit: event.explicit,
    }
}

impl FetchedBatch {
    pub fn new(fetched: Vec<PlayEvent>) -> Self {
        Self {
            fetched,
            history: Vec::new(),
            tracks: Vec::new(),
            artists: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Stages rows for every fetched event. Every event yields a history
    /// entry; tracks and artists are staged at most once per id; links are
    /// staged once per (artist, track) pair seen in this batch, even when
    /// the track already existed, so an incomplete join table catches up.
    ///
    /// A lookup failure other than not-found skips that one track and is
    /// logged; the rest of the batch still goes through.
    pub async fn stage<D: Storage>(&mut self, db: &D) {
        let fetched = std::mem::take(&mut self.fetched);
        for event in &fetched {
            self.history.push(HistoryRow {
                track_id: event.track_id.clone(),
                played_at: event.played_at,
            });

            let known = match self.track_already_staged_or_stored(db, &event.track_id).await {
                Ok(known) => known,
                Err(e) => {
                    error!(track = %event.track_id, error = %e,
                        "transform.track.lookup_failed");
                    continue;
                }
            };

            if !known {
                self.tracks.push(track_row(event));
                for artist in &event.artists {
                    match self.artist_already_staged_or_stored(db, &artist.id).await {
                        Ok(true) => {}
                        Ok(false) => self.artists.push(ArtistRow {
                            id: artist.id.clone(),
                            name: artist.name.clone(),
                        }),
                        Err(e) => {
                            error!(artist = %artist.id, error = %e,
                                "transform.artist.lookup_failed");
                            continue;
                        }
                    }
                }
            }

            // links are re-staged for known tracks on purpose
            for artist in &event.artists {
                let link = ArtistTrackRow {
                    artist_id: artist.id.clone(),
                    track_id: event.track_id.clone(),
                };
                if !self.links.contains(&link) {
                    self.links.push(link);
                }
            }
        }
        self.fetched = fetched;
    }

    /// Two-tier known check: rows already staged this cycle first, then a
    /// storage point lookup.
    async fn track_already_staged_or_stored<D: Storage>(
        &self,
        db: &D,
        id: &str
    ) -> Result<bool, SaverError> {
        if self.tracks.iter().any(|t| t.id == id) {
            return Ok(true);
        }
        Ok(db.find_track(id).await?.is_some())
    }

    async fn artist_already_staged_or_stored<D: Storage>(
        &self,
        db: &D,
        id: &str
    ) -> Result<bool, SaverError> {
        if self.artists.iter().any(|a| a.id == id) {
            return Ok(true);
        }
        Ok(db.find_artist(id).await?.is_some())
    }

    /// Inserts the staged sets in fixed order so link referents exist
    /// first: tracks, artists, history, links. A failed set (including a
    /// uniqueness conflict raced in by a concurrent writer) is logged and
    /// the remaining sets are still attempted; there is no cross-set
    /// transaction.
    pub async fn commit<D: Storage>(&self, db: &D) -> CommitStats {
        let mut stats = CommitStats::default();

        match db.insert_tracks(&self.tracks).await {
            Ok(()) => stats.tracks = self.tracks.len(),
            Err(e) => error!(count = self.tracks.len(), error = %e,
                "commit.tracks.failed"),
        }
        match db.insert_artists(&self.artists).await {
            Ok(()) => stats.artists = self.artists.len(),
            Err(e) => error!(count = self.artists.len(), error = %e,
                "commit.artists.failed"),
        }
        match db.insert_history(&self.history).await {
            Ok(()) => stats.history = self.history.len(),
            Err(e) => error!(count = self.history.len(), error = %e,
                "commit.history.failed"),
        }
        match db.insert_links(&self.links).await {
            Ok(()) => stats.links = self.links.len(),
            Err(e) => error!(count = self.links.len(), error = %e,
                "commit.links.failed"),
        }

        debug!(
            tracks = stats.tracks,
            artists = stats.artists,
            history = stats.history,
            links = stats.links,
            "commit.done"
        );
        stats
    }
}
