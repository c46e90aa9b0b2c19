use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::conductor::{Conductor, ConductorMsg};
use crate::config::Config;
use crate::coordination::LeaderElector;
use crate::database::Database;
use crate::hub::LogHub;

/// The application object for when Pulse is running as a scheduler.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,

    /// The sender side of the conductor's event inbox, the bus edge of this process.
    ///
    /// Held here so the inbox stays open for the lifetime of the app; dropping it would end
    /// the conductor loop.
    _events_tx: mpsc::Sender<ConductorMsg>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the leader elector task.
    elector_handle: JoinHandle<()>,
    /// The join handle of the conductor task.
    conductor_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(100);

        // Initialize this node's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;

        // Spawn various core tasks.
        let (elector, leader_rx) = LeaderElector::new(config.clone(), &db, shutdown_tx.subscribe())
            .await
            .context("error creating leader elector")?;
        let elector_handle = elector.spawn();

        let (events_tx, events_rx) = mpsc::channel(1000);
        let conductor = Conductor::new(config.clone(), db.clone(), Arc::new(LogHub), leader_rx, shutdown_tx.clone(), events_rx)
            .await
            .context("error creating conductor")?;
        let conductor_handle = conductor.spawn();

        Ok(Self {
            _config: config,
            _db: db,
            _events_tx: events_tx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            elector_handle,
            conductor_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Pulse is shutting down");
        if let Err(err) = self.conductor_handle.await.context("error joining conductor handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down conductor");
        }
        if let Err(err) = self.elector_handle.await {
            tracing::error!(error = ?err, "error joining leader elector task");
        }

        tracing::debug!("Pulse shutdown complete");
        Ok(())
    }
}
