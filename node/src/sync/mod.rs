//! Per-conversation synchronization: cached history, paginated fetches and
//! the realtime feed reconciled into one canonical message list.

mod pagination;
mod receipts;
mod session;
mod store;
mod subscription;

pub use pagination::{Page, PageRequest, PaginationController};
pub use receipts::ReadReceiptMarker;
pub use session::ConversationHandle;
pub use store::MessageStore;
pub use subscription::{
    ConnectionState, ConnectionStatus, StatusOutcome, SubscriptionManager, SubscriptionSignal,
};

use crate::config::SyncConfig;
use crate::remote::{RealtimeTransport, RemoteError, RemoteStore};
use crate::storage::LocalCache;
use chatsync_messaging::{ConversationKey, MessageId, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("realtime transport error: {0}")]
    Transport(String),
    #[error("page fetch failed: {0}")]
    Fetch(#[source] RemoteError),
    #[error("send rejected: {0}")]
    Send(String),
    #[error("local cache error: {0}")]
    Cache(String),
    #[error("read receipt failed: {0}")]
    Receipt(#[source] RemoteError),
    #[error("invalid conversation: {0}")]
    InvalidConversation(String),
    #[error("conversation session closed")]
    SessionClosed,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PageLoaded {
        page: usize,
        count: usize,
        exhausted: bool,
    },
    SendConfirmed {
        optimistic: MessageId,
        confirmed: MessageId,
    },
    /// The optimistic entry has been removed from the list.
    SendFailed { optimistic: MessageId, reason: String },
}

pub(crate) struct EngineInner {
    pub(crate) local_user: UserId,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) transport: Arc<dyn RealtimeTransport>,
    pub(crate) cache: LocalCache,
    pub(crate) config: SyncConfig,
    sessions: Mutex<HashMap<ConversationKey, ConversationHandle>>,
}

/// Owns one session per conversation of the local user.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        local_user: UserId,
        remote: Arc<dyn RemoteStore>,
        transport: Arc<dyn RealtimeTransport>,
        cache: LocalCache,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                local_user,
                remote,
                transport,
                cache,
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.inner.local_user
    }

    /// Handle for the conversation with `peer`, spawning its session on
    /// first use. Must be called from within a tokio runtime.
    pub fn conversation(&self, peer: UserId) -> SyncResult<ConversationHandle> {
        if peer == self.inner.local_user {
            return Err(SyncError::InvalidConversation(format!(
                "{peer} cannot chat with themselves"
            )));
        }
        let key = ConversationKey::new(self.inner.local_user.clone(), peer.clone());
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .map_err(|_| SyncError::InvalidConversation("session table poisoned".into()))?;

        if let Some(handle) = sessions.get(&key).filter(|handle| !handle.is_closed()) {
            return Ok(handle.clone());
        }
        let handle = session::spawn(&self.inner, peer);
        sessions.insert(key, handle.clone());
        Ok(handle)
    }

    /// Stop every session. Existing handles report [`SyncError::SessionClosed`].
    pub async fn shutdown(&self) {
        let handles: Vec<ConversationHandle> = match self.inner.sessions.lock() {
            Ok(mut sessions) => sessions.drain().map(|(_, handle)| handle).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
