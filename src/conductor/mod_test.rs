use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, watch};

use super::{classify, Classification, Conductor, ConductorMsg};
use crate::config::Config;
use crate::coordination::LeaderState;
use crate::database::Database;
use crate::dispatch::DispatchService;
use crate::fixtures::{self, RecordingHub};
use crate::models::{ClientSettings, DispatchStatus, TriggerKind};
use crate::trigger::TriggerStore;
use crate::utils;

async fn new_conductor() -> Result<(Conductor<RecordingHub>, RecordingHub, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let hub = RecordingHub::default();
    let (_leader_tx, leader_rx) = watch::channel(LeaderState::Standby);
    let (shutdown_tx, _) = broadcast::channel(1);
    let (_events_tx, events_rx) = mpsc::channel(100);
    let conductor = Conductor::new(config, db, Arc::new(hub.clone()), leader_rx, shutdown_tx, events_rx).await?;
    Ok((conductor, hub, tmpdir))
}

#[test]
fn classification_boundaries_are_inclusive_of_real_time() {
    let gap = 30;
    assert_eq!(classify(gap, gap), Classification::RealTime, "delta == gap must classify as real-time");
    assert_eq!(classify(-gap, gap), Classification::RealTime, "delta == -gap must classify as real-time");
    assert_eq!(classify(0, gap), Classification::RealTime, "delta == 0 must classify as real-time");
    assert_eq!(classify(gap + 1, gap), Classification::Past, "delta == gap + 1 must classify as past");
    assert_eq!(classify(-gap - 1, gap), Classification::Future, "delta == -gap - 1 must classify as future");
}

#[tokio::test]
async fn real_time_create_acquires_and_notifies_once() -> Result<()> {
    let (mut conductor, hub, _tmpdir) = new_conductor().await?;
    let update = fixtures::dispatch_update("d0", utils::now_unix(), "recipient-0");

    conductor.handle_create_or_update(update.clone()).await?;
    // A duplicate delivery of the same logical event must not produce a second notification.
    conductor.handle_create_or_update(update).await?;

    let sent = hub.sent();
    assert_eq!(sent.len(), 1, "expected exactly one hub notification, got {}", sent.len());
    assert_eq!(sent[0].dispatch_id, "d0", "unexpected notified dispatch, got {}", sent[0].dispatch_id);
    let stored = conductor.dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Acquired, "expected Acquired status, got {:?}", stored.status);

    Ok(())
}

#[tokio::test]
async fn past_create_is_dropped_without_side_effects() -> Result<()> {
    let (mut conductor, hub, _tmpdir) = new_conductor().await?;
    let gap = conductor.config.gap_seconds;
    let update = fixtures::dispatch_update("d0", utils::now_unix() - gap - 60, "recipient-0");

    conductor.handle_create_or_update(update).await?;

    assert!(hub.sent().is_empty(), "expected no hub notification for a past event");
    let stored = conductor.dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Received, "expected Received status, got {:?}", stored.status);
    assert!(conductor.triggers.get("d0").await?.is_none(), "expected no trigger for a past event");

    Ok(())
}

#[tokio::test]
async fn future_create_persists_trigger_without_notify() -> Result<()> {
    let (mut conductor, hub, _tmpdir) = new_conductor().await?;
    let fire_at = utils::now_unix() + 3 * 24 * 60 * 60;
    let update = fixtures::dispatch_update("d0", fire_at, "recipient-0");

    conductor.handle_create_or_update(update).await?;

    assert!(hub.sent().is_empty(), "expected no hub notification yet for a future event");
    let stored = conductor.dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Received, "expected Received status, got {:?}", stored.status);
    let trigger = conductor.triggers.get("d0").await?.context("expected trigger record")?;
    assert_eq!(trigger.expires_at, fire_at, "expected trigger expiry {} got {}", fire_at, trigger.expires_at);
    assert_eq!(trigger.kind, TriggerKind::Dispatch, "unexpected trigger kind, got {:?}", trigger.kind);
    // This process is not the leader, so no in-process timer is installed.
    assert_eq!(conductor.timers.len(), 0, "expected no timers on a non-leader, got {}", conductor.timers.len());

    Ok(())
}

#[tokio::test]
async fn future_create_schedules_timer_when_leading() -> Result<()> {
    let (mut conductor, _hub, _tmpdir) = new_conductor().await?;
    conductor.handle_leader_state(LeaderState::Leading).await;
    let fire_at = utils::now_unix() + 3 * 24 * 60 * 60;

    conductor.handle_create_or_update(fixtures::dispatch_update("d0", fire_at, "recipient-0")).await?;

    assert!(conductor.timers.contains("dispatch:d0"), "expected a pending timer for dispatch:d0");

    Ok(())
}

#[tokio::test]
async fn delete_cancels_dispatch_trigger_and_timer() -> Result<()> {
    let (mut conductor, hub, _tmpdir) = new_conductor().await?;
    conductor.handle_leader_state(LeaderState::Leading).await;
    let fire_at = utils::now_unix() + 3 * 24 * 60 * 60;
    conductor.handle_create_or_update(fixtures::dispatch_update("d0", fire_at, "recipient-0")).await?;

    conductor.handle_delete("d0").await?;

    let stored = conductor.dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Canceled, "expected Canceled status, got {:?}", stored.status);
    assert!(conductor.triggers.get("d0").await?.is_none(), "expected trigger to be deleted");
    assert_eq!(conductor.timers.len(), 0, "expected pending timer to be cancelled, got {}", conductor.timers.len());

    // A late fire racing the delete must not notify.
    conductor.handle_timer_fired("dispatch:d0".into()).await;
    assert!(hub.sent().is_empty(), "expected no hub notification after delete, got {}", hub.sent().len());

    Ok(())
}

#[tokio::test]
async fn delete_of_unknown_dispatch_is_a_noop() -> Result<()> {
    let (mut conductor, hub, _tmpdir) = new_conductor().await?;

    conductor.handle_delete("unknown").await?;

    assert!(hub.sent().is_empty(), "expected no side effects for unknown delete");

    Ok(())
}

#[tokio::test]
async fn delete_never_cancels_an_acquired_dispatch() -> Result<()> {
    let (mut conductor, hub, _tmpdir) = new_conductor().await?;
    conductor.handle_create_or_update(fixtures::dispatch_update("d0", utils::now_unix(), "recipient-0")).await?;
    assert_eq!(hub.sent().len(), 1, "expected the real-time event to notify");

    conductor.handle_delete("d0").await?;

    let stored = conductor.dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Acquired, "expected status to remain Acquired, got {:?}", stored.status);

    Ok(())
}

#[tokio::test]
async fn timer_fire_commits_notifies_and_consumes_trigger() -> Result<()> {
    let (mut conductor, hub, _tmpdir) = new_conductor().await?;
    let fire_at = utils::now_unix() + 3 * 24 * 60 * 60;
    conductor.handle_create_or_update(fixtures::dispatch_update("d0", fire_at, "recipient-0")).await?;

    conductor.handle_timer_fired("dispatch:d0".into()).await;

    assert_eq!(hub.sent().len(), 1, "expected exactly one hub notification, got {}", hub.sent().len());
    let stored = conductor.dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Acquired, "expected Acquired status, got {:?}", stored.status);
    assert!(conductor.triggers.get("d0").await?.is_none(), "expected trigger to be consumed by the fire");

    Ok(())
}

#[tokio::test]
async fn fire_with_missing_recipient_skips_notify_but_cleans_up() -> Result<()> {
    let (mut conductor, hub, _tmpdir) = new_conductor().await?;
    let fire_at = utils::now_unix() + 3 * 24 * 60 * 60;
    let mut update = fixtures::dispatch_update("d0", fire_at, "recipient-0");
    update.recipient_client_id = None;
    conductor.handle_create_or_update(update).await?;

    conductor.handle_timer_fired("dispatch:d0".into()).await;

    assert!(hub.sent().is_empty(), "expected no hub notification without recipient context");
    let stored = conductor.dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Acquired, "expected Acquired status, got {:?}", stored.status);
    assert!(conductor.triggers.get("d0").await?.is_none(), "expected trigger to be cleaned up");

    Ok(())
}

#[tokio::test]
async fn register_alert_persists_and_schedules_when_leading() -> Result<()> {
    let (mut conductor, _hub, _tmpdir) = new_conductor().await?;
    conductor.handle_leader_state(LeaderState::Leading).await;
    let fire_at = utils::now_unix() + 60 * 60;

    conductor
        .handle_register_alert("d0".into(), "recipient-0".into(), "sender-0".into(), fire_at, TriggerKind::Appointment)
        .await?;

    let stored = conductor.dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Received, "expected Received status, got {:?}", stored.status);
    let trigger = conductor.triggers.get("d0").await?.context("expected trigger record")?;
    assert_eq!(trigger.kind, TriggerKind::Appointment, "unexpected trigger kind, got {:?}", trigger.kind);
    assert!(conductor.timers.contains("appt:d0"), "expected a pending timer for appt:d0");

    // The exposed delete-timeout operation drops only the in-process timer.
    conductor.handle_msg(ConductorMsg::DeleteTimeout { timer_id: "appt:d0".into() }).await;
    assert!(!conductor.timers.contains("appt:d0"), "expected delete-timeout to drop the pending timer");
    assert!(conductor.triggers.get("d0").await?.is_some(), "expected the durable trigger to survive delete-timeout");

    Ok(())
}

#[tokio::test]
async fn register_alert_with_past_fire_time_is_dropped() -> Result<()> {
    let (mut conductor, hub, _tmpdir) = new_conductor().await?;
    conductor.handle_leader_state(LeaderState::Leading).await;
    let gap = conductor.config.gap_seconds;
    let fire_at = utils::now_unix() - gap - 60;

    conductor
        .handle_register_alert("d0".into(), "recipient-0".into(), "sender-0".into(), fire_at, TriggerKind::Appointment)
        .await?;

    assert!(hub.sent().is_empty(), "expected no hub notification for a past alert");
    assert!(conductor.triggers.get("d0").await?.is_none(), "expected no trigger for a past alert");
    assert_eq!(conductor.timers.len(), 0, "expected no timers for a past alert, got {}", conductor.timers.len());
    let stored = conductor.dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Received, "expected Received status, got {:?}", stored.status);

    Ok(())
}

#[tokio::test]
async fn register_alert_at_the_current_instant_notifies_immediately() -> Result<()> {
    let (mut conductor, hub, _tmpdir) = new_conductor().await?;

    conductor
        .handle_register_alert("d0".into(), "recipient-0".into(), "sender-0".into(), utils::now_unix(), TriggerKind::Nudge)
        .await?;

    assert_eq!(hub.sent().len(), 1, "expected exactly one hub notification, got {}", hub.sent().len());
    assert!(conductor.triggers.get("d0").await?.is_none(), "expected no trigger for a real-time alert");
    let stored = conductor.dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Acquired, "expected Acquired status, got {:?}", stored.status);

    Ok(())
}

#[tokio::test]
async fn client_settings_update_is_persisted_pass_through() -> Result<()> {
    let (mut conductor, _hub, _tmpdir) = new_conductor().await?;
    let settings = ClientSettings {
        client_id: "client-0".into(),
        settings: serde_json::json!({"timezone": "UTC", "reminders": true}),
    };

    conductor.handle_update_client_settings(settings.clone()).await?;

    let raw = conductor.settings_tree.get("client-0")?.context("expected stored settings record")?;
    let stored: ClientSettings = utils::decode_model(&raw)?;
    assert_eq!(stored, settings, "stored settings do not match the update");

    Ok(())
}

#[tokio::test]
async fn recovery_schedules_only_the_window_and_is_idempotent() -> Result<()> {
    let (mut conductor, _hub, _tmpdir) = new_conductor().await?;
    let now = utils::now_unix();
    let horizon = conductor.config.max_horizon();
    // Within the recovery window.
    conductor.triggers.update(&fixtures::trigger("d0", now + 2 * 60 * 60, TriggerKind::Appointment)).await?;
    conductor.triggers.update(&fixtures::trigger("d1", now + 24 * 60 * 60, TriggerKind::Dispatch)).await?;
    // Already past: must be omitted.
    conductor.triggers.update(&fixtures::trigger("d2", now - 10, TriggerKind::Dispatch)).await?;
    // Inside the short-lead margin: left for the real-time path.
    conductor.triggers.update(&fixtures::trigger("d3", now + 10, TriggerKind::Nudge)).await?;
    // Beyond the horizon: picked up by a later recovery pass.
    conductor.triggers.update(&fixtures::trigger("d4", now + horizon + 24 * 60 * 60, TriggerKind::LongReminder)).await?;

    conductor.handle_leader_state(LeaderState::Leading).await;

    assert_eq!(conductor.timers.len(), 2, "expected 2 recovered timers, got {}", conductor.timers.len());
    assert!(conductor.timers.contains("appt:d0"), "expected a pending timer for appt:d0");
    assert!(conductor.timers.contains("dispatch:d1"), "expected a pending timer for dispatch:d1");

    // Running recovery again with no time elapsed must not schedule duplicates.
    conductor.recover().await;
    assert_eq!(conductor.timers.len(), 2, "expected recovery to be idempotent, got {} timers", conductor.timers.len());

    Ok(())
}

#[tokio::test]
async fn recovery_pass_picks_up_later_persisted_triggers() -> Result<()> {
    let (mut conductor, _hub, _tmpdir) = new_conductor().await?;
    conductor.handle_leader_state(LeaderState::Leading).await;
    assert_eq!(conductor.timers.len(), 0, "expected an empty registry after the acquisition scan, got {}", conductor.timers.len());

    // A record persisted after the acquisition scan, as another replica would.
    conductor.triggers.update(&fixtures::trigger("d0", utils::now_unix() + 2 * 60 * 60, TriggerKind::Dispatch)).await?;

    conductor.recover().await;

    assert!(conductor.timers.contains("dispatch:d0"), "expected the re-scan to schedule the late-persisted trigger");

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn leader_reruns_recovery_periodically_while_leading() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let hub = RecordingHub::default();
    let (_leader_tx, leader_rx) = watch::channel(LeaderState::Leading);
    let (shutdown_tx, _) = broadcast::channel(1);
    let (_events_tx, events_rx) = mpsc::channel(100);
    let conductor = Conductor::new(config.clone(), db.clone(), Arc::new(hub.clone()), leader_rx, shutdown_tx.clone(), events_rx).await?;
    let handle = conductor.spawn();

    // Let the conductor observe leadership and run its acquisition scan over the empty store.
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Persist a dispatch and an in-window trigger directly, as another replica would.
    let fire_at = utils::now_unix() + 2 * 60 * 60;
    let dispatches = DispatchService::new(&db).await?;
    dispatches.update(fixtures::dispatch_update("d0", fire_at, "recipient-0")).await?;
    let mut triggers = TriggerStore::new(&config, &db).await?;
    triggers.update(&fixtures::trigger("d0", fire_at, TriggerKind::Dispatch)).await?;

    // A periodic re-scan must schedule the timer, and the fire must reach the hub.
    let mut waited = 0;
    while hub.sent().is_empty() && waited < 4 * 60 * 60 {
        tokio::time::sleep(Duration::from_secs(60)).await;
        waited += 60;
    }
    assert_eq!(hub.sent().len(), 1, "expected the periodic re-scan to drive the fire, got {} notifications", hub.sent().len());
    let stored = dispatches.get("d0").await?.context("expected stored dispatch record")?;
    assert_eq!(stored.status, DispatchStatus::Acquired, "expected Acquired status, got {:?}", stored.status);

    let _ = shutdown_tx.send(());
    handle.await.context("error joining conductor handle")??;

    Ok(())
}

#[tokio::test]
async fn losing_leadership_clears_the_registry() -> Result<()> {
    let (mut conductor, _hub, _tmpdir) = new_conductor().await?;
    conductor.handle_leader_state(LeaderState::Leading).await;
    let fire_at = utils::now_unix() + 3 * 24 * 60 * 60;
    conductor.handle_create_or_update(fixtures::dispatch_update("d0", fire_at, "recipient-0")).await?;
    assert_eq!(conductor.timers.len(), 1, "expected 1 pending timer, got {}", conductor.timers.len());

    conductor.handle_leader_state(LeaderState::Following("other".into())).await;

    assert_eq!(conductor.timers.len(), 0, "expected registry to be cleared on demotion, got {}", conductor.timers.len());

    Ok(())
}
