//!
//! src/saver.rs  Andrew Belles  Sept 17th, 2025
//!
//! Defines the synchronizer loop: on a fixed cadence, work out the
//! watermark, pull new play events, stage and commit them, then persist
//! whatever token the transport holds. Nothing in the steady-state loop
//! is allowed to take the process down.
//!

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::fetch::HistorySource;
use crate::persistent::Storage;
use crate::token::CredentialStore;
use crate::transform::FetchedBatch;

pub struct HistorySaver<S, D, C> {
    source: Arc<S>,
    db: Arc<D>,
    tokens: Arc<C>,
    cfg: SyncConfig,

    // handles daemon exit
    shutdown: CancellationToken
}

impl<S, D, C> HistorySaver<S, D, C>
where
    S: HistorySource,
    D: Storage,
    C: CredentialStore,
{
    pub fn new(source: Arc<S>, db: Arc<D>, tokens: Arc<C>, cfg: SyncConfig) -> Self {
        Self {
            source,
            db,
            tokens,
            cfg,
            shutdown: CancellationToken::new()
        }
    }

    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The poll loop. The first cycle runs after a short warm-up so a
    /// fresh process shows progress quickly; every later cycle waits the
    /// steady interval. Cancellation is observed only at the top of the
    /// wait, so a cycle in flight always finishes its commit and token
    /// save before the loop exits.
    pub async fn run(self) {
        info!(
            warmup_secs = self.cfg.warmup.as_secs(),
            interval_secs = self.cfg.interval.as_secs(),
            "saver.start"
        );

        let mut period = self.cfg.warmup;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!(reason = "shutdown token", "saver.stop");
                    break;
                }
                () = sleep(period) => {}
            }
            self.run_cycle().await;
            period = self.cfg.interval;
        }
        info!("saver.exit");
    }

    /// One synchronization cycle. Every failure inside is recoverable:
    /// the next cycle retries from the same watermark.
    pub async fn run_cycle(&self) {
        info!("saver.cycle.start");

        let watermark = self.watermark().await;

        let events = match self.source.fetch_since(watermark, self.cfg.page_limit).await {
            Ok(events) => events,
            Err(e) => {
                // commit an empty batch so the loop never stalls here
                error!(error = %e, watermark = %watermark, "saver.fetch.failed");
                Vec::new()
            }
        };
        let fetched = events.len();

        let mut batch = FetchedBatch::new(events);
        batch.stage(self.db.as_ref()).await;
        let stats = batch.commit(self.db.as_ref()).await;

        info!(
            fetched,
            tracks = stats.tracks,
            artists = stats.artists,
            history = stats.history,
            links = stats.links,
            "saver.cycle.done"
        );

        // the transport may have rotated the token; persist it every
        // cycle, changed or not
        let token = self.source.current_token().await;
        if let Err(e) = self.tokens.save(&token).await {
            error!(error = %e, "saver.token.save_failed");
        }
    }

    /// Exclusive lower bound for the next fetch: the latest stored
    /// played-at value, or epoch zero (fetch everything) when the table
    /// is empty or unreadable.
    async fn watermark(&self) -> DateTime<Utc> {
        match self.db.max_played_at().await {
            Ok(Some(watermark)) => watermark,
            Ok(None) => {
                warn!("saver.watermark.empty");
                DateTime::<Utc>::UNIX_EPOCH
            }
            Err(e) => {
                warn!(error = %e, "saver.watermark.unreadable");
                DateTime::<Utc>::UNIX_EPOCH
            }
        }
    }
}
