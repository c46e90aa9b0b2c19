//! The conductor, the protocol brain of the dispatch engine.
//!
//! The conductor classifies every inbound dispatch event as past, real-time or future relative
//! to now, and drives the dispatch service, the trigger store and the notification hub
//! accordingly. Real-time events commit and notify immediately; future events become durable
//! triggers (and, on the leader, in-process timers); past events are logged anomalies which the
//! design accepts as lost.
//!
//! The conductor also owns the timer registry: it schedules fires while leading, rebuilds the
//! registry from the trigger store on every leadership acquisition, re-scans on an interval so
//! records which enter the scheduling window under a stable leader still fire, and drops the
//! registry on demotion. All side effects flow through direct service calls from this single
//! task, so ordering and error propagation stay explicit.

#[cfg(test)]
mod mod_test;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, WatchStream};

use crate::config::Config;
use crate::coordination::LeaderState;
use crate::database::Database;
use crate::dispatch::DispatchService;
use crate::hub::NotificationHub;
use crate::models::{ClientSettings, Dispatch, DispatchStatus, DispatchUpdate, Trigger, TriggerKind};
use crate::timers::TimerRegistry;
use crate::trigger::TriggerStore;
use crate::utils;

const METRIC_RECOVERED_TIMERS: &str = "pulse_dispatch_recovered_timers";

/// The classification of an inbound dispatch event relative to now.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    /// The event arrived too late to honor.
    Past,
    /// The event is within the gap window and fires immediately.
    RealTime,
    /// The event fires in the future and is registered as a trigger.
    Future,
}

/// Classify an event by its age in seconds relative to the gap window.
///
/// `delta_seconds` is `now - triggered_at`; both gap boundaries are inclusive of real-time.
pub fn classify(delta_seconds: i64, gap_seconds: i64) -> Classification {
    if delta_seconds > gap_seconds {
        Classification::Past
    } else if delta_seconds < -gap_seconds {
        Classification::Future
    } else {
        Classification::RealTime
    }
}

/// A message bound for the conductor.
pub enum ConductorMsg {
    /// A create-or-update dispatch event from the bus.
    CreateOrUpdateDispatch(DispatchUpdate),
    /// A delete dispatch event from the bus.
    DeleteDispatch {
        /// The id of the dispatch to cancel.
        dispatch_id: String,
    },
    /// A client settings update event from the bus, persisted pass-through.
    UpdateClientSettings(ClientSettings),
    /// A feature-module request to schedule a reminder.
    RegisterAlert {
        /// The caller-assigned dispatch id of the reminder.
        dispatch_id: String,
        /// The client to be notified.
        recipient_client_id: String,
        /// The client on whose behalf the reminder fires.
        sender_client_id: String,
        /// The unix seconds timestamp at which the reminder should fire.
        fire_at: i64,
        /// The timer class of the reminder.
        kind: TriggerKind,
    },
    /// A feature-module request to proactively drop a pending in-process timer.
    DeleteTimeout {
        /// The namespaced timer id to drop.
        timer_id: String,
    },
}

/// The conductor task for a scheduler role.
pub struct Conductor<H: NotificationHub> {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// The dispatch persistence service.
    dispatches: DispatchService,
    /// The trigger persistence service.
    triggers: TriggerStore,
    /// The in-process registry of pending fires, owned by this task.
    timers: TimerRegistry,
    /// The DB tree for client settings pass-through records.
    settings_tree: sled::Tree,
    /// The notification hub seam.
    hub: Arc<H>,

    /// A channel of inbound dispatch protocol events.
    events_rx: ReceiverStream<ConductorMsg>,
    /// A channel of elapsed timer ids from the registry.
    fires_rx: ReceiverStream<String>,
    /// A signal of this process's current leadership state.
    leader_rx: WatchStream<LeaderState>,
    /// A bool indicating if this process currently believes itself leader.
    is_leader: bool,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl<H: NotificationHub> Conductor<H> {
    /// Create a new instance.
    pub async fn new(
        config: Arc<Config>, db: Database, hub: Arc<H>, leader_rx: watch::Receiver<LeaderState>, shutdown_tx: broadcast::Sender<()>, events_rx: mpsc::Receiver<ConductorMsg>,
    ) -> Result<Self> {
        metrics::register_gauge!(METRIC_RECOVERED_TIMERS, metrics::Unit::Count, "the number of timers rebuilt from the store on the last leadership acquisition");
        let dispatches = DispatchService::new(&db).await?;
        let triggers = TriggerStore::new(&config, &db).await?;
        let settings_tree = db.get_settings_tree().await?;
        let (timers, fires_rx) = TimerRegistry::new(config.clone());
        Ok(Self {
            config,
            _db: db,
            dispatches,
            triggers,
            timers,
            settings_tree,
            hub,
            events_rx: ReceiverStream::new(events_rx),
            fires_rx: ReceiverStream::new(fires_rx),
            leader_rx: WatchStream::new(leader_rx),
            is_leader: false,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(role = %self.config.role, "conductor has started");

        // Periodic re-scan while leading, so triggers beyond the horizon at acquisition time,
        // or persisted by another replica after it, are scheduled once they enter the window.
        // Registration is idempotent per id, which makes repeat passes safe.
        let mut rescan = tokio::time::interval(std::time::Duration::from_secs(self.config.election_interval_seconds));
        rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg_opt = self.events_rx.next() => match msg_opt {
                    Some(msg) => self.handle_msg(msg).await,
                    None => break,
                },
                Some(timer_id) = self.fires_rx.next() => self.handle_timer_fired(timer_id).await,
                Some(state) = self.leader_rx.next() => self.handle_leader_state(state).await,
                _ = rescan.tick(), if self.is_leader => self.recover().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!(role = %self.config.role, "conductor has shutdown");
        Ok(())
    }

    /// Handle a conductor message.
    ///
    /// Failures are logged here and never tear down the conductor loop; a failed event
    /// manifests only as an absent notification.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_msg(&mut self, msg: ConductorMsg) {
        let res = match msg {
            ConductorMsg::CreateOrUpdateDispatch(update) => self.handle_create_or_update(update).await,
            ConductorMsg::DeleteDispatch { dispatch_id } => self.handle_delete(&dispatch_id).await,
            ConductorMsg::UpdateClientSettings(settings) => self.handle_update_client_settings(settings).await,
            ConductorMsg::RegisterAlert {
                dispatch_id,
                recipient_client_id,
                sender_client_id,
                fire_at,
                kind,
            } => self.handle_register_alert(dispatch_id, recipient_client_id, sender_client_id, fire_at, kind).await,
            ConductorMsg::DeleteTimeout { timer_id } => {
                self.timers.cancel(&timer_id);
                Ok(())
            }
        };
        if let Err(err) = res {
            tracing::error!(error = ?err, "error handling conductor message");
        }
    }

    /// Handle a create-or-update dispatch event.
    #[tracing::instrument(level = "debug", skip(self, update), err)]
    async fn handle_create_or_update(&mut self, mut update: DispatchUpdate) -> Result<()> {
        // Status transitions are driven internally; inbound events never carry one. New records
        // are created as `received`, while a retry of an already committed dispatch must not
        // downgrade it back to `received`.
        update.status = None;
        let dispatch = self.dispatches.update(update).await?;
        let delta = utils::now_unix() - dispatch.triggered_at;
        match classify(delta, self.config.gap_seconds) {
            Classification::RealTime => self.acquire_and_notify(&dispatch.dispatch_id).await?,
            Classification::Past => {
                // The event arrived too late to honor. This is a detected but unrecovered
                // failure mode: the notification is lost.
                tracing::error!(dispatch_id = %dispatch.dispatch_id, delta_seconds = delta, "dispatch event arrived too late to honor, dropping");
            }
            Classification::Future => {
                let trigger = Trigger {
                    dispatch_id: dispatch.dispatch_id.clone(),
                    expires_at: dispatch.triggered_at,
                    kind: TriggerKind::Dispatch,
                };
                self.triggers.update(&trigger).await?;
                if self.is_leader {
                    // A superseding update may carry a new fire time, so any stale timer is
                    // dropped before registering.
                    let timer_id = TriggerKind::Dispatch.timer_id(&dispatch.dispatch_id);
                    self.timers.cancel(&timer_id);
                    self.timers.schedule(&timer_id, trigger.expires_at);
                }
            }
        }
        Ok(())
    }

    /// Handle a delete dispatch event.
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn handle_delete(&mut self, dispatch_id: &str) -> Result<()> {
        let canceled = self.dispatches.internal_update(DispatchUpdate::status(dispatch_id, DispatchStatus::Canceled)).await?;
        if canceled.is_none() {
            tracing::warn!(dispatch_id, "dispatch not cancelable, already acquired, done, or unknown");
        }
        // Always clear any pending future registration, regardless of the dispatch-level
        // outcome above.
        self.triggers.delete(&[dispatch_id.to_string()]).await?;
        for kind in TriggerKind::ALL {
            self.timers.cancel(&kind.timer_id(dispatch_id));
        }
        Ok(())
    }

    /// Handle a client settings update event, persisted pass-through.
    #[tracing::instrument(level = "debug", skip(self, settings), err)]
    async fn handle_update_client_settings(&mut self, settings: ClientSettings) -> Result<()> {
        let encoded = utils::encode_model(&settings)?;
        let tree = self.settings_tree.clone();
        Database::spawn_blocking(move || tree.insert(settings.client_id.as_bytes(), encoded))
            .await?
            .context("error persisting client settings record")?;
        Ok(())
    }

    /// Handle a feature-module request to schedule a reminder.
    ///
    /// Fire times are classified the same way inbound dispatch events are: a past fire time
    /// would persist a trigger behind every future recovery window, a record nothing would
    /// ever scan or delete.
    #[tracing::instrument(level = "debug", skip_all, fields(dispatch_id = %dispatch_id, %kind), err)]
    async fn handle_register_alert(&mut self, dispatch_id: String, recipient_client_id: String, sender_client_id: String, fire_at: i64, kind: TriggerKind) -> Result<()> {
        let update = DispatchUpdate {
            dispatch_id: dispatch_id.clone(),
            status: None,
            triggered_at: Some(fire_at),
            recipient_client_id: Some(recipient_client_id),
            sender_client_id: Some(sender_client_id),
            content_key: None,
            metadata: None,
        };
        self.dispatches.update(update).await?;
        let delta = utils::now_unix() - fire_at;
        match classify(delta, self.config.gap_seconds) {
            Classification::RealTime => self.acquire_and_notify(&dispatch_id).await?,
            Classification::Past => {
                tracing::error!(dispatch_id = %dispatch_id, delta_seconds = delta, "alert fire time is already past, dropping");
            }
            Classification::Future => {
                let trigger = Trigger {
                    dispatch_id: dispatch_id.clone(),
                    expires_at: fire_at,
                    kind,
                };
                self.triggers.update(&trigger).await?;
                if self.is_leader {
                    let timer_id = kind.timer_id(&dispatch_id);
                    self.timers.cancel(&timer_id);
                    self.timers.schedule(&timer_id, fire_at);
                }
            }
        }
        Ok(())
    }

    /// Handle an elapsed timer.
    #[tracing::instrument(level = "debug", skip(self, timer_id))]
    async fn handle_timer_fired(&mut self, timer_id: String) {
        self.timers.remove(&timer_id);
        if let Err(err) = self.process_fire(&timer_id).await {
            tracing::error!(error = ?err, timer_id = timer_id.as_str(), "error processing timer fire");
        }
    }

    /// Commit & notify for an elapsed timer, then consume its trigger.
    async fn process_fire(&mut self, timer_id: &str) -> Result<()> {
        let (_kind, dispatch_id) = match TriggerKind::parse_timer_id(timer_id) {
            Some(parts) => parts,
            None => {
                tracing::warn!(timer_id, "unrecognized timer id, skipping fire");
                return Ok(());
            }
        };
        let dispatch_id = dispatch_id.to_string();
        // A delete racing this fire wins: a trigger masked by the ignore set, or already
        // physically removed, means the dispatch was cancelled.
        if self.triggers.get(&dispatch_id).await?.is_none() {
            tracing::debug!(dispatch_id = %dispatch_id, "trigger already deleted, skipping fire");
            return Ok(());
        }
        self.acquire_and_notify(&dispatch_id).await?;
        self.triggers.delete(&[dispatch_id]).await?;
        Ok(())
    }

    /// Conditionally commit the dispatch and notify the hub on success.
    ///
    /// The conditional `received -> acquired` transition is what makes concurrent duplicate
    /// deliveries safe: only the winner notifies.
    async fn acquire_and_notify(&mut self, dispatch_id: &str) -> Result<()> {
        let acquired = self.dispatches.internal_update(DispatchUpdate::status(dispatch_id, DispatchStatus::Acquired)).await?;
        let dispatch = match acquired {
            Some(dispatch) => dispatch,
            None => {
                tracing::debug!(dispatch_id, "dispatch already committed or unknown, skipping notify");
                return Ok(());
            }
        };
        if dispatch.recipient_client_id.is_none() {
            tracing::warn!(dispatch_id, "no recipient context resolvable for dispatch, skipping notify");
            return Ok(());
        }
        self.notify(dispatch).await;
        Ok(())
    }

    /// Invoke the notification hub, logging failures.
    ///
    /// The hub is never retried from here; a failed send manifests as an absent notification.
    async fn notify(&self, dispatch: Dispatch) {
        let dispatch_id = dispatch.dispatch_id.clone();
        if let Err(err) = self.hub.notify(dispatch).await {
            tracing::error!(error = ?err, dispatch_id = dispatch_id.as_str(), "error notifying hub for dispatch");
        }
    }

    /// Handle a change of this process's leadership state.
    #[tracing::instrument(level = "debug", skip(self, state))]
    async fn handle_leader_state(&mut self, state: LeaderState) {
        let was_leader = self.is_leader;
        self.is_leader = matches!(state, LeaderState::Leading);
        if self.is_leader && !was_leader {
            tracing::info!(role = %self.config.role, "leadership acquired, recovering pending timers");
            self.recover().await;
        }
        if !self.is_leader && was_leader {
            tracing::info!(role = %self.config.role, "leadership lost, clearing timer registry");
            self.timers.clear();
        }
    }

    /// Rebuild the timer registry from the trigger store.
    ///
    /// Scans each timer class for not-yet-fired records within the recovery window and
    /// schedules them. Registration is idempotent per id, so concurrent recovery passes during
    /// a dual-leadership window cannot double-fire.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn recover(&mut self) {
        let now = utils::now_unix();
        let (from, until) = (now + self.config.short_lead(), now + self.config.max_horizon());
        let mut total = 0usize;
        for kind in TriggerKind::ALL {
            let triggers = match self.triggers.scan_window(kind, from, until).await {
                Ok(triggers) => triggers,
                Err(err) => {
                    tracing::warn!(error = ?err, %kind, "error scanning triggers during recovery, skipping kind");
                    continue;
                }
            };
            let mut count = 0usize;
            for trigger in triggers {
                if self.timers.schedule(&kind.timer_id(&trigger.dispatch_id), trigger.expires_at) {
                    count += 1;
                }
            }
            tracing::info!(%kind, count, "recovered pending timers");
            total += count;
        }
        metrics::gauge!(METRIC_RECOVERED_TIMERS, total as f64);
    }
}
