//!
//! src/main.rs  Andrew Belles  Sept 18th, 2025
//!
//! Main source file: wires config, logging, storage, and the spotify
//! client into the saver daemon, plus the one-off subcommands for
//! login and database bootstrap.
//!
//!

mod config;
mod errors;
mod logging;

mod fetch;
mod login;
mod persistent;
mod saver;
mod token;
mod transform;

#[cfg(test)]
mod testutil;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::SaverError;
use crate::persistent::Persistent;
use crate::token::{CredentialStore, TokenFile};

#[derive(Parser, Debug)]
#[command(name = "rs-history-saver", about = "Saves your spotify playback history")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the interactive OAuth flow and write token.json
    Login,
    /// Create the database file and schema
    CreateDb,
    /// Apply the schema to an existing database
    Migrate,
}

#[tokio::main]
async fn main() -> Result<(), SaverError> {
    let args = Args::parse();
    let cfgs = config::load_config()?;
    let _guard = logging::init_logging(&cfgs.logging)?;

    tracing::info!(
        service = "rs-history-saver",
        version = %env!("CARGO_PKG_VERSION"),
        "starting"
    );

    match args.command {
        Some(Command::Login) => run_login(&cfgs).await,
        Some(Command::CreateDb) => {
            Persistent::init(&cfgs.persistence.db_url).await?;
            info!(db = %cfgs.persistence.db_url, "database created");
            Ok(())
        }
        Some(Command::Migrate) => {
            Persistent::init(&cfgs.persistence.db_url).await?;
            info!(db = %cfgs.persistence.db_url, "schema migrated");
            Ok(())
        }
        None => run_saver(&cfgs).await,
    }
}

async fn run_login(cfgs: &AppConfig) -> Result<(), SaverError> {
    info!("login.start");
    let login = login::Login::new(&cfgs.http, &cfgs.spotify, &cfgs.sync)?;
    let credential = login.login().await?;

    let slot = TokenFile::new(&cfgs.token.path);
    slot.save(&credential).await?;
    info!(path = %cfgs.token.path.display(), "login.token.saved");
    Ok(())
}

async fn run_saver(cfgs: &AppConfig) -> Result<(), SaverError> {
    // anything failing in here is startup-fatal; once the loop runs,
    // failures are logged and retried next cycle
    let db = Arc::new(Persistent::init(&cfgs.persistence.db_url).await?);

    let tokens = Arc::new(TokenFile::new(&cfgs.token.path));
    let credential = tokens.load().await?;

    let spotify = Arc::new(fetch::SpotifyClient::new(
        &cfgs.http,
        &cfgs.spotify,
        &cfgs.sync,
        credential
    )?);

    let saver = saver::HistorySaver::new(spotify, db, tokens, cfgs.sync.clone());

    let shutdown = saver.shutdown();
    let trigger = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(msg = "shutting saver daemon down", "saver.signal");
            shutdown.cancel();
        }
    });

    saver.run().await;
    let _ = trigger.await;
    info!("saver shut down cleanly");
    Ok(())
}

/// Unit Tests
/// Live testbench against the real api, gated behind LIVE_HTTP=1
#[cfg(test)]
mod tests {
    use super::*;

    fn live() -> bool {
        std::env::var("LIVE_HTTP").ok().as_deref() == Some("1")
    }

    #[tokio::test]
    #[allow(dead_code)]
    async fn saver_cycle_testbench() -> Result<(), SaverError> {
        dotenvy::dotenv().ok();

        if !live() {
            eprintln!("Set LIVE_HTTP=1 to run");
            return Ok(())
        }

        let cfgs = config::load_config()?;
        let db = Arc::new(Persistent::init("sqlite::memory:").await?);

        let tokens = Arc::new(TokenFile::new(&cfgs.token.path));
        let credential = tokens.load().await?;

        let spotify = Arc::new(fetch::SpotifyClient::new(
            &cfgs.http,
            &cfgs.spotify,
            &cfgs.sync,
            credential
        )?);

        let saver = saver::HistorySaver::new(
            spotify, db.clone(), tokens, cfgs.sync.clone()
        );
        saver.run_cycle().await;

        use crate::persistent::Storage;
        println!("watermark after cycle: {:?}", db.max_played_at().await?);

        Ok(())
    }
}
