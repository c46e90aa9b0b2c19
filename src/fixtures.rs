use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::BoxFuture;

use crate::hub::NotificationHub;
use crate::models::{Dispatch, DispatchUpdate, Trigger, TriggerKind};

/// Build a dispatch update carrying the standard create-event payload.
pub fn dispatch_update(dispatch_id: &str, triggered_at: i64, recipient: &str) -> DispatchUpdate {
    DispatchUpdate {
        dispatch_id: dispatch_id.into(),
        status: None,
        triggered_at: Some(triggered_at),
        recipient_client_id: Some(recipient.into()),
        sender_client_id: Some("sender-0".into()),
        content_key: Some("content-0".into()),
        metadata: None,
    }
}

/// Build a trigger record.
pub fn trigger(dispatch_id: &str, expires_at: i64, kind: TriggerKind) -> Trigger {
    Trigger {
        dispatch_id: dispatch_id.into(),
        expires_at,
        kind,
    }
}

/// A notification hub double which records every dispatch it is asked to send.
#[derive(Clone, Default)]
pub struct RecordingHub {
    sent: Arc<Mutex<Vec<Dispatch>>>,
}

impl RecordingHub {
    /// The dispatches sent through this hub so far.
    pub fn sent(&self) -> Vec<Dispatch> {
        self.sent.lock().expect("hub mutex poisoned").clone()
    }
}

impl NotificationHub for RecordingHub {
    fn notify(&self, dispatch: Dispatch) -> BoxFuture<'static, Result<()>> {
        let sent = self.sent.clone();
        Box::pin(async move {
            sent.lock().expect("hub mutex poisoned").push(dispatch);
            Ok(())
        })
    }
}
