//! Data models for dispatches, triggers, leases & client settings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The lifecycle status of a dispatch.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatchStatus {
    /// The dispatch has been recorded but not yet committed to a send.
    Received,
    /// The dispatch has been committed to the notification hub.
    Acquired,
    /// The dispatch has been fully processed by the downstream consumer.
    Done,
    /// The dispatch was canceled before being committed.
    Canceled,
}

/// One logical notification-send intent.
///
/// At most one live (non-canceled, non-done) record exists per `dispatch_id`; the id is assigned
/// by the caller and is stable across retries of the same logical notification.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    /// The caller-assigned globally unique id of this dispatch.
    pub dispatch_id: String,
    /// The lifecycle status of this dispatch.
    pub status: DispatchStatus,
    /// The unix seconds timestamp at which the underlying event logically occurred.
    pub triggered_at: i64,
    /// The client to be notified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_client_id: Option<String>,
    /// The client on whose behalf the notification is sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_client_id: Option<String>,
    /// The notification content key, opaque to this engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_key: Option<String>,
    /// Notification-channel metadata, opaque to this engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A partial dispatch used for merge-style updates.
///
/// Only populated fields are applied over the stored record, which makes duplicate deliveries of
/// the same logical event converge instead of clobbering earlier data.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchUpdate {
    pub dispatch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DispatchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl DispatchUpdate {
    /// Create an update carrying only a status transition.
    pub fn status(dispatch_id: impl Into<String>, status: DispatchStatus) -> Self {
        Self {
            dispatch_id: dispatch_id.into(),
            status: Some(status),
            triggered_at: None,
            recipient_client_id: None,
            sender_client_id: None,
            content_key: None,
            metadata: None,
        }
    }

    /// Merge this update over the given stored record, creating a fresh `received` record when
    /// none exists.
    pub fn apply(&self, current: Option<Dispatch>) -> Dispatch {
        let mut merged = current.unwrap_or_else(|| Dispatch {
            dispatch_id: self.dispatch_id.clone(),
            status: DispatchStatus::Received,
            triggered_at: 0,
            recipient_client_id: None,
            sender_client_id: None,
            content_key: None,
            metadata: None,
        });
        if let Some(status) = self.status {
            merged.status = status;
        }
        if let Some(triggered_at) = self.triggered_at {
            merged.triggered_at = triggered_at;
        }
        if let Some(recipient) = self.recipient_client_id.as_ref() {
            merged.recipient_client_id = Some(recipient.clone());
        }
        if let Some(sender) = self.sender_client_id.as_ref() {
            merged.sender_client_id = Some(sender.clone());
        }
        if let Some(content_key) = self.content_key.as_ref() {
            merged.content_key = Some(content_key.clone());
        }
        if let Some(metadata) = self.metadata.as_ref() {
            merged.metadata = Some(metadata.clone());
        }
        merged
    }
}

/// The class of timer guarded by a trigger, partitioning recovery scans.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    /// An appointment reminder registered by a feature module.
    Appointment,
    /// A long-running reminder registered by a feature module.
    LongReminder,
    /// A nudge registered by a feature module.
    Nudge,
    /// A generic future dispatch registered by the conductor.
    Dispatch,
}

impl TriggerKind {
    /// All trigger kinds, in recovery order.
    pub const ALL: [TriggerKind; 4] = [TriggerKind::Appointment, TriggerKind::LongReminder, TriggerKind::Nudge, TriggerKind::Dispatch];

    /// The timer id namespace of this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            TriggerKind::Appointment => "appt",
            TriggerKind::LongReminder => "long",
            TriggerKind::Nudge => "nudge",
            TriggerKind::Dispatch => "dispatch",
        }
    }

    /// The namespaced timer registry id for the given dispatch.
    pub fn timer_id(&self, dispatch_id: &str) -> String {
        format!("{}:{}", self.prefix(), dispatch_id)
    }

    /// Parse a namespaced timer id back into its kind and dispatch id.
    pub fn parse_timer_id(timer_id: &str) -> Option<(TriggerKind, &str)> {
        let (prefix, dispatch_id) = timer_id.split_once(':')?;
        let kind = match prefix {
            "appt" => TriggerKind::Appointment,
            "long" => TriggerKind::LongReminder,
            "nudge" => TriggerKind::Nudge,
            "dispatch" => TriggerKind::Dispatch,
            _ => return None,
        };
        Some((kind, dispatch_id))
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// A persisted record of a dispatch scheduled to fire in the future.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// The id of the dispatch this trigger guards.
    pub dispatch_id: String,
    /// The unix seconds timestamp at which the guarded dispatch should fire.
    pub expires_at: i64,
    /// The timer class of this trigger.
    pub kind: TriggerKind,
}

/// A leadership lease for a scheduler role.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// The logical role this lease covers.
    pub role: String,
    /// The identity of the process currently holding the lease.
    pub holder: Uuid,
    /// The unix seconds timestamp past which the lease may be contested.
    pub expires_at: i64,
    /// The unix seconds timestamp of the last heartbeat renewal.
    pub renewed_at: i64,
}

impl Lease {
    /// Check if this lease has expired as of the given instant.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// A client settings record, persisted pass-through on behalf of the settings consumer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    /// The id of the client these settings belong to.
    pub client_id: String,
    /// The opaque settings payload.
    pub settings: serde_json::Value,
}
