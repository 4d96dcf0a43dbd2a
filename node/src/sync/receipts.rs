use super::SyncError;
use crate::remote::RemoteStore;
use chatsync_messaging::ConversationKey;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Fire-and-forget read marking for one conversation.
#[derive(Clone)]
pub struct ReadReceiptMarker {
    remote: Arc<dyn RemoteStore>,
    key: ConversationKey,
}

impl ReadReceiptMarker {
    pub fn new(remote: Arc<dyn RemoteStore>, key: ConversationKey) -> Self {
        Self { remote, key }
    }

    /// Failures are logged and dropped; nothing is retried.
    pub fn mark_read(&self) -> JoinHandle<()> {
        let remote = Arc::clone(&self.remote);
        let key = self.key.clone();
        tokio::spawn(async move {
            match remote.mark_read(&key).await {
                Ok(()) => debug!(conversation = %key, "conversation marked read"),
                Err(err) => {
                    let err = SyncError::Receipt(err);
                    warn!(conversation = %key, %err, "read receipt failed")
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use chatsync_messaging::UserId;

    #[tokio::test]
    async fn failures_are_swallowed() {
        let remote = MemoryRemote::new(UserId::new("alice"));
        remote.fail_next_receipts(1);
        let marker = ReadReceiptMarker::new(
            Arc::new(remote.clone()),
            ConversationKey::new(UserId::new("alice"), UserId::new("bob")),
        );

        marker.mark_read().await.unwrap();
        marker.mark_read().await.unwrap();

        assert_eq!(remote.mark_read_calls(), 2);
    }
}
