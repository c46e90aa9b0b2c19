//! The notification hub seam.
//!
//! The hub is the actual send-channel fan-out and lives outside this engine; the conductor only
//! ever calls `notify` and never retries it. Failures are logged by the caller and manifest as a
//! missing notification, never as a crashed task.

use anyhow::Result;
use futures::future::BoxFuture;

use crate::models::Dispatch;

/// The boundary to the external notification fan-out.
pub trait NotificationHub: Send + Sync + 'static {
    /// Send the given dispatch through its configured channels.
    fn notify(&self, dispatch: Dispatch) -> BoxFuture<'static, Result<()>>;
}

/// A hub implementation which emits each committed dispatch as a structured log record.
///
/// Used when no external fan-out integration is wired in; downstream delivery consumes the
/// emitted records from the log stream.
pub struct LogHub;

impl NotificationHub for LogHub {
    fn notify(&self, dispatch: Dispatch) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            tracing::info!(
                dispatch_id = %dispatch.dispatch_id,
                recipient_client_id = ?dispatch.recipient_client_id,
                sender_client_id = ?dispatch.sender_client_id,
                content_key = ?dispatch.content_key,
                "dispatch committed for notification",
            );
            Ok(())
        })
    }
}
