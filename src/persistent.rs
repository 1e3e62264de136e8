//!
//! src/persistent.rs  Andrew Belles  Sept 16th, 2025
//!
//! Defines module for persisting play history to memory.
//! We define the memory as an sqlite database with four tables:
//! tracks, artists, history entries, and the artist/track join.
//!

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Pool, Row, Sqlite};

use crate::errors::SaverError;

/// Row mirrors of the four tables. Identifiers are spotify's opaque
/// string ids; sequence ids are assigned by sqlite on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRow {
    pub id: String,
    pub name: String,
    pub track_number: i64,
    pub disc_number: i64,
    pub explicit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtistRow {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub track_id: String,
    pub played_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtistTrackRow {
    pub artist_id: String,
    pub track_id: String,
}

/// The storage capability the synchronizer commits against. Point lookups
/// return Ok(None) when the row is absent; any Err is a real failure.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn find_track(&self, id: &str) -> Result<Option<TrackRow>, SaverError>;
    async fn find_artist(&self, id: &str) -> Result<Option<ArtistRow>, SaverError>;

    async fn insert_tracks(&self, rows: &[TrackRow]) -> Result<(), SaverError>;
    async fn insert_artists(&self, rows: &[ArtistRow]) -> Result<(), SaverError>;
    async fn insert_history(&self, rows: &[HistoryRow]) -> Result<(), SaverError>;
    async fn insert_links(&self, rows: &[ArtistTrackRow]) -> Result<(), SaverError>;

    /// Timestamp of the latest stored history entry, None when empty.
    async fn max_played_at(&self) -> Result<Option<DateTime<Utc>>, SaverError>;
}

pub struct Persistent {
    pool: Pool<Sqlite>
}

impl Persistent {

    async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), SaverError> {
        // ensure that schema exists
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tracks (
              id            TEXT PRIMARY KEY,
              name          TEXT NOT NULL,
              track_number  INTEGER NOT NULL DEFAULT 0,
              disc_number   INTEGER NOT NULL DEFAULT 0,
              explicit      INTEGER NOT NULL DEFAULT 0
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS artists (
              id    TEXT PRIMARY KEY,
              name  TEXT NOT NULL
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS history_entries (
              id         INTEGER PRIMARY KEY AUTOINCREMENT,
              track_id   TEXT NOT NULL,
              played_at  INTEGER NOT NULL
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS artists_tracks (
              id         INTEGER PRIMARY KEY AUTOINCREMENT,
              artist_id  TEXT NOT NULL,
              track_id   TEXT NOT NULL
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_played
                ON history_entries(played_at);"
        ).execute(pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_artists_tracks_track
                ON artists_tracks(track_id);"
        ).execute(pool).await?;

        Ok(())
    }

    pub async fn init(database_url: &str) -> Result<Self, SaverError> {
        let is_memory = database_url == "sqlite::memory:";

        if !is_memory {
            if let Some(path) = database_url.strip_prefix("sqlite:") {
                if let Some(parent) = std::path::Path::new(path)
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true);

        // WAL is file-only; don't set it for in-memory
        if !is_memory {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                       .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if is_memory {1} else {8})
            .connect_with(opts)
            .await?;

        // Always create schema right away
        Self::ensure_schema(&pool).await?;

        Ok( Self { pool } )
    }
}

#[async_trait]
impl Storage for Persistent {

    async fn find_track(&self, id: &str) -> Result<Option<TrackRow>, SaverError> {
        let row = sqlx::query(
            "SELECT id, name, track_number, disc_number, explicit
                FROM tracks WHERE id = ?1 LIMIT 1;"
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TrackRow {
            id: r.get("id"),
            name: r.get("name"),
            track_number: r.get("track_number"),
            disc_number: r.get("disc_number"),
            explicit: r.get::<i64, _>("explicit") != 0,
        }))
    }

    async fn find_artist(&self, id: &str) -> Result<Option<ArtistRow>, SaverError> {
        let row = sqlx::query("SELECT id, name FROM artists WHERE id = ?1 LIMIT 1;")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| ArtistRow {
            id: r.get("id"),
            name: r.get("name"),
        }))
    }

    async fn insert_tracks(&self, rows: &[TrackRow]) -> Result<(), SaverError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r"
                INSERT INTO tracks (id, name, track_number, disc_number, explicit)
                VALUES (?1, ?2, ?3, ?4, ?5);
                "
            )
            .bind(&row.id)
            .bind(&row.name)
            .bind(row.track_number)
            .bind(row.disc_number)
            .bind(i64::from(row.explicit))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_artists(&self, rows: &[ArtistRow]) -> Result<(), SaverError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query("INSERT INTO artists (id, name) VALUES (?1, ?2);")
                .bind(&row.id)
                .bind(&row.name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_history(&self, rows: &[HistoryRow]) -> Result<(), SaverError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO history_entries (track_id, played_at) VALUES (?1, ?2);"
            )
            .bind(&row.track_id)
            .bind(row.played_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_links(&self, rows: &[ArtistTrackRow]) -> Result<(), SaverError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO artists_tracks (artist_id, track_id) VALUES (?1, ?2);"
            )
            .bind(&row.artist_id)
            .bind(&row.track_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn max_played_at(&self) -> Result<Option<DateTime<Utc>>, SaverError> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(played_at) FROM history_entries;"
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(max.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }
}
