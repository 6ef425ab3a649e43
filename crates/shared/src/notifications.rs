//! Live-update notifications between clients.
//!
//! PostgreSQL pushes on two `LISTEN` channels: entry changes carry the id of
//! the sending processor so a client can skip its own, metadata changes carry
//! a JSON `{key, value}` object. Oracle uses a `DBMS_ALERT` with the same
//! payload as the entry channel.

use crate::error::{SharedError, SharedResult};
use crate::processor::RemoteChangeHandler;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use std::sync::Weak;
use std::time::Duration;

pub const LIVE_UPDATE_CHANNEL: &str = "jabrefLiveUpdate";
pub const METADATA_UPDATE_CHANNEL: &str = "metadata_update";

/// `DBMS_ALERT` name used on Oracle.
pub const ORACLE_ALERT_NAME: &str = "JABREF_LIVE_UPDATE";

/// Pause after a failed receive before trying again.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Payload of a metadata notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub key: String,
    pub value: String,
}

/// What a received notification asks the client to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteNotification {
    EntriesChanged,
    MetadataChanged(MetadataUpdate),
    /// Sent by this client, or on a channel nobody handles.
    Ignored,
}

/// Interpret one notification received by the processor `processor_id`.
pub fn classify(
    channel: &str,
    payload: &str,
    processor_id: &str,
) -> SharedResult<RemoteNotification> {
    match channel {
        LIVE_UPDATE_CHANNEL if payload == processor_id => Ok(RemoteNotification::Ignored),
        LIVE_UPDATE_CHANNEL => Ok(RemoteNotification::EntriesChanged),
        METADATA_UPDATE_CHANNEL => serde_json::from_str(payload)
            .map(RemoteNotification::MetadataChanged)
            .map_err(|e| {
                SharedError::Notification(format!("invalid metadata payload '{payload}': {e}"))
            }),
        _ => Ok(RemoteNotification::Ignored),
    }
}

/// Hand a notification to the handler. Returns `false` once the handler is gone.
pub(crate) async fn dispatch(
    handler: &Weak<dyn RemoteChangeHandler>,
    notification: RemoteNotification,
) -> bool {
    let Some(handler) = handler.upgrade() else {
        return false;
    };
    match notification {
        RemoteNotification::EntriesChanged => handler.on_remote_change().await,
        RemoteNotification::MetadataChanged(update) => {
            handler
                .on_remote_metadata_change(&update.key, &update.value)
                .await
        }
        RemoteNotification::Ignored => {}
    }
    true
}

/// Receive loop of the PostgreSQL listener task.
///
/// `PgListener` reconnects on its own after a lost connection; receive errors
/// are logged and retried. The loop ends when the handler is dropped.
pub(crate) async fn run_postgres_listener(
    mut listener: PgListener,
    processor_id: String,
    handler: Weak<dyn RemoteChangeHandler>,
) {
    tracing::info!(
        channels = ?[LIVE_UPDATE_CHANNEL, METADATA_UPDATE_CHANNEL],
        "listening for shared database notifications"
    );

    loop {
        match listener.recv().await {
            Ok(notification) => {
                let channel = notification.channel();
                let payload = notification.payload();
                tracing::debug!(channel, payload, "received notification");

                let action = match classify(channel, payload, &processor_id) {
                    Ok(action) => action,
                    Err(e) => {
                        tracing::warn!(channel, error = %e, "ignoring malformed notification");
                        continue;
                    }
                };
                if !dispatch(&handler, action).await {
                    break;
                }
            }
            Err(e) => {
                if handler.strong_count() == 0 {
                    break;
                }
                tracing::error!(error = %e, "error receiving shared database notification");
                tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
            }
        }
    }

    tracing::info!("notification listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        pulls: AtomicUsize,
        metadata: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RemoteChangeHandler for RecordingHandler {
        async fn on_remote_change(&self) {
            self.pulls.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_remote_metadata_change(&self, key: &str, value: &str) {
            self.metadata
                .lock()
                .await
                .push((key.to_string(), value.to_string()));
        }
    }

    #[test]
    fn test_own_notifications_are_ignored() {
        assert_eq!(
            classify(LIVE_UPDATE_CHANNEL, "me", "me").unwrap(),
            RemoteNotification::Ignored
        );
        assert_eq!(
            classify(LIVE_UPDATE_CHANNEL, "other", "me").unwrap(),
            RemoteNotification::EntriesChanged
        );
        assert_eq!(
            classify("unrelated", "x", "me").unwrap(),
            RemoteNotification::Ignored
        );
    }

    #[test]
    fn test_metadata_payload_is_json() {
        let parsed = classify(
            METADATA_UPDATE_CHANNEL,
            r#"{"key":"saveActions","value":"disabled;"}"#,
            "me",
        )
        .unwrap();
        assert_eq!(
            parsed,
            RemoteNotification::MetadataChanged(MetadataUpdate {
                key: "saveActions".to_string(),
                value: "disabled;".to_string(),
            })
        );
        assert!(matches!(
            classify(METADATA_UPDATE_CHANNEL, "not json", "me"),
            Err(SharedError::Notification(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_live_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let as_dyn: Arc<dyn RemoteChangeHandler> = handler.clone();
        let weak = Arc::downgrade(&as_dyn);

        assert!(dispatch(&weak, RemoteNotification::EntriesChanged).await);
        assert!(
            dispatch(
                &weak,
                RemoteNotification::MetadataChanged(MetadataUpdate {
                    key: "k".to_string(),
                    value: "v".to_string(),
                }),
            )
            .await
        );
        assert_eq!(handler.pulls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.metadata.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_stops_after_handler_dropped() {
        let as_dyn: Arc<dyn RemoteChangeHandler> = Arc::new(RecordingHandler::default());
        let weak = Arc::downgrade(&as_dyn);
        drop(as_dyn);
        assert!(!dispatch(&weak, RemoteNotification::EntriesChanged).await);
    }
}
