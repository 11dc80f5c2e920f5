//! `boardsync`: follow one board headlessly and log what the sync engine
//! does with it.

use std::sync::Arc;

use boardsync::config::{ConfigError, SyncConfig};
use boardsync::directory::RestDirectory;
use boardsync::engine::{BoardRecord, Outcome, SessionEvent, SyncCore};
use boardsync::persistence::{RestStore, StoreError};
use boardsync::session::SessionHandle;
use boardsync::transport::RealtimeStream;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("persistence setup failed: {0}")]
    Store(#[from] StoreError),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "boardsync", about = "Follow a collaborative board and log sync activity")]
struct Cli {
    /// Board to open.
    board_id: Uuid,
    /// User the session acts as.
    user_id: Uuid,
    /// Board owner, for authorization. Defaults to the user.
    owner_id: Option<Uuid>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("boardsync=info")))
        .init();
    if let Err(e) = dotenv
        && !e.not_found()
    {
        warn!(error = %e, "failed to read .env");
    }

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;
    let board = BoardRecord { board_id: cli.board_id, owner_id: cli.owner_id.unwrap_or(cli.user_id) };

    let core = SyncCore::new(board, cli.user_id, &config);
    let store = Arc::new(RestStore::new(&config)?);
    let directory = Arc::new(RestDirectory::new(&config)?);
    let stream = RealtimeStream::connect(&config, cli.board_id);
    let (handle, task) = SessionHandle::open(core, store, directory, stream);

    let mut events = handle.subscribe();
    let mut snapshots = handle.watch();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => {
                    error!("session ended unexpectedly");
                    break;
                }
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let (elements, gestures) = {
                    let snapshot = snapshots.borrow_and_update();
                    (snapshot.elements.len(), snapshot.gestures.len())
                };
                info!(elements, gestures, "board changed");
            }
        }
    }

    handle.close().await;
    if let Err(e) = task.await {
        error!(error = %e, "session task failed");
    }
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Reconciled { element_id, outcome: Outcome::Applied } => {
            info!(%element_id, "change confirmed");
        }
        SessionEvent::Reconciled { element_id, outcome: Outcome::RolledBack(recovery) } => {
            warn!(%element_id, ?recovery, "change rolled back");
        }
        SessionEvent::Reloaded { count } => info!(count, "board loaded from canonical state"),
        SessionEvent::PermissionDenied { element_id, message } => warn!(%element_id, %message, "permission denied"),
        SessionEvent::Reconnected => info!("change stream reconnected"),
    }
}
