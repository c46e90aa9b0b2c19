//! Leadership coordination for scheduler roles.
//!
//! Every replica participates in request handling, but exactly one process per role may own the
//! in-process timer registry and run trigger recovery. Leadership is mediated through a lease
//! record in the store: candidates treat an absent *or expired* lease as acquirable and race for
//! it with a compare-and-swap, so exactly one candidate wins a given takeover. The winner then
//! heartbeats the lease every election tick.
//!
//! A brief dual-leadership window across ticks is tolerated: timer registration is idempotent
//! per id and the dispatch commit transition is conditional, so duplicate recovery passes cannot
//! double-fire.


use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use rand::Rng;
use sled::{IVec, Tree};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::config::Config;
use crate::database::Database;
use crate::models::Lease;
use crate::utils;

const METRIC_IS_LEADER: &str = "pulse_dispatch_is_leader";
const METRIC_LEADERSHIP_CHANGE: &str = "pulse_dispatch_num_leadership_changes";

/// The maximum random jitter in milliseconds applied before a non-leader contends.
const MAX_JITTER_MS: u64 = 5_000;

/// Different states which a leader elector may be in.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This process instance is the leader for its role.
    Leading,
    /// A state indicating that a different process is currently the leader, identified by the
    /// encapsulated id.
    ///
    /// When a new leader is detected, this value will be updated with the leader's identity.
    Following(String),
    /// A state indicating that the lease state is unknown, or that the corresponding leader
    /// elector task is starting or stopping.
    Standby,
}

/// A task which is responsible for acquiring and maintaining a leadership lease for this
/// process's scheduler role.
pub struct LeaderElector {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The DB tree holding leadership leases, keyed by role.
    tree: Tree,
    /// The identity used when acquiring the lease, generated once at startup.
    id: Uuid,
    /// The last known leader state.
    state: LeaderState,
    /// The number of state transitions observed by this process.
    transitions: u64,
    /// Sender for the current state of the leadership coordination system.
    state_tx: watch::Sender<LeaderState>,
    /// A broadcast channel used to trigger task shutdown.
    shutdown: BroadcastStream<()>,
}

impl LeaderElector {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, db: &Database, shutdown: broadcast::Receiver<()>) -> Result<(Self, watch::Receiver<LeaderState>)> {
        metrics::register_gauge!(METRIC_LEADERSHIP_CHANGE, metrics::Unit::Count, "the number of leadership transitions observed by this process");
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if this node is the leader, where 1.0 indicates leadership, any other value does not"
        );
        let tree = db.get_leases_tree().await?;
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        Ok((
            LeaderElector {
                config,
                tree,
                id: Uuid::new_v4(),
                state: LeaderState::Standby,
                transitions: 0,
                state_tx,
                shutdown: BroadcastStream::new(shutdown),
            },
            state_rx,
        ))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(id = %self.id, role = %self.config.role, "leader elector task started");

        // Perform an initial pass at acquiring / renewing the lease.
        if let Err(err) = self.try_acquire_or_renew().await {
            tracing::error!(error = ?err, "error attempting to acquire/renew lease");
        }

        loop {
            let delay = tokio::time::sleep(std::time::Duration::from_secs(self.config.election_interval_seconds));
            tokio::pin!(delay);
            tokio::select! {
                _ = &mut delay => {
                    if let Err(err) = self.try_acquire_or_renew().await {
                        tracing::error!(error = ?err, "error during call to try_acquire_or_renew");
                        if !matches!(&self.state, LeaderState::Standby) {
                            self.set_state(LeaderState::Standby);
                        }
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }

        tracing::info!("leader elector task stopped");
    }

    /// Attempt to acquire or renew the leadership lease for this process's role.
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        // Non-leaders wait a small random jitter to desynchronize simultaneous starts.
        if !matches!(self.state, LeaderState::Leading) {
            let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
            tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
        }

        let now = utils::now_unix();
        let (tree, role) = (self.tree.clone(), self.config.role.clone());
        let current_raw = Database::spawn_blocking(move || tree.get(role.as_bytes()))
            .await?
            .context("error fetching lease record")?;
        let current = current_raw
            .as_ref()
            .map(|raw| utils::decode_model::<Lease>(raw))
            .transpose()
            .context("error decoding lease record")?;

        match current {
            // This process holds the lease: heartbeat.
            Some(lease) if lease.holder == self.id => {
                let renewed = self.new_lease(now);
                let raw = utils::encode_model(&renewed)?;
                let (tree, role) = (self.tree.clone(), self.config.role.clone());
                Database::spawn_blocking(move || tree.insert(role.as_bytes(), raw))
                    .await?
                    .context("error renewing lease record")?;
                tracing::debug!(expires_at = renewed.expires_at, "lease renewed");
                if !matches!(self.state, LeaderState::Leading) {
                    self.set_state(LeaderState::Leading);
                }
            }
            // Another process holds an unexpired lease: follow it.
            Some(lease) if !lease.is_expired(now) => {
                let holder = lease.holder.to_string();
                if self.state != LeaderState::Following(holder.clone()) {
                    self.set_state(LeaderState::Following(holder));
                }
            }
            // The lease is absent or expired: contend for it.
            _ => self.try_acquire(current_raw, now).await?,
        }
        Ok(())
    }

    /// Contend for an absent or expired lease with a compare-and-swap on the observed value.
    async fn try_acquire(&mut self, observed_raw: Option<IVec>, now: i64) -> Result<()> {
        let lease = self.new_lease(now);
        let raw = utils::encode_model(&lease)?;
        let (tree, role) = (self.tree.clone(), self.config.role.clone());
        let cas = Database::spawn_blocking(move || tree.compare_and_swap(role.as_bytes(), observed_raw, Some(raw)))
            .await?
            .context("error writing lease record")?;
        match cas {
            Ok(()) => {
                tracing::info!(id = %self.id, role = %self.config.role, "leadership acquired");
                self.set_state(LeaderState::Leading);
            }
            Err(cas_err) => {
                // Another candidate won the takeover race this tick; follow whatever it wrote.
                let holder = cas_err
                    .current
                    .as_ref()
                    .and_then(|raw| utils::decode_model::<Lease>(raw).ok())
                    .map(|lease| lease.holder.to_string());
                tracing::debug!(?holder, "lost lease takeover race");
                match holder {
                    Some(holder) => self.set_state(LeaderState::Following(holder)),
                    None => self.set_state(LeaderState::Standby),
                }
            }
        }
        Ok(())
    }

    /// Build a fresh lease for this process as of the given instant.
    fn new_lease(&self, now: i64) -> Lease {
        Lease {
            role: self.config.role.clone(),
            holder: self.id,
            expires_at: now + self.config.lease_duration_seconds,
            renewed_at: now,
        }
    }

    /// Set the current leader state & emit a state update.
    fn set_state(&mut self, state: LeaderState) {
        self.state = state;
        self.transitions += 1;
        let _ = self.state_tx.send(self.state.clone());
        let is_leader = if matches!(self.state, LeaderState::Leading) { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_LEADER, is_leader);
        metrics::gauge!(METRIC_LEADERSHIP_CHANGE, self.transitions as f64);
    }
}
