use super::SyncError;
use crate::storage::LocalCache;
use chatsync_messaging::{apply_update, ConversationKey, Message, MessageId, Reconciler};
use tracing::{debug, warn};

/// Canonical in-memory sequence of one conversation, newest first.
///
/// Every merge goes through the [`Reconciler`]; every mutation writes the
/// bounded head of the sequence back to the [`LocalCache`].
pub struct MessageStore {
    key: ConversationKey,
    messages: Vec<Message>,
    reconciler: Reconciler,
    cache: LocalCache,
}

impl MessageStore {
    pub fn new(key: ConversationKey, reconciler: Reconciler, cache: LocalCache) -> Self {
        Self {
            key,
            messages: Vec::new(),
            reconciler,
            cache,
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    /// Fold the cached snapshot in without writing it back.
    pub fn hydrate(&mut self) -> &[Message] {
        let cached = self.cache.load(&self.key);
        debug!(conversation = %self.key, count = cached.len(), "hydrating from cache");
        self.messages = self.reconciler.reconcile(&cached, &self.messages);
        &self.messages
    }

    pub fn merge(&mut self, batch: Vec<Message>) -> &[Message] {
        let batch: Vec<Message> = batch
            .into_iter()
            .filter(|m| m.belongs_to(&self.key))
            .collect();
        self.messages = self.reconciler.reconcile(&batch, &self.messages);
        self.persist();
        &self.messages
    }

    pub fn remove(&mut self, id: &MessageId) -> &[Message] {
        let before = self.messages.len();
        self.messages.retain(|m| &m.id != id);
        if self.messages.len() != before {
            self.persist();
        }
        &self.messages
    }

    /// Swap an optimistic entry for the row the server acknowledged.
    pub fn confirm(&mut self, optimistic: &MessageId, confirmed: Message) -> &[Message] {
        self.messages.retain(|m| &m.id != optimistic);
        self.merge(vec![confirmed])
    }

    /// Replace an entry by id, keeping its position. Unknown ids are ignored.
    pub fn apply_update(&mut self, updated: Message) -> bool {
        let applied = apply_update(&mut self.messages, updated);
        if applied {
            self.persist();
        }
        applied
    }

    fn persist(&self) {
        if let Err(err) = self.cache.save(&self.key, &self.messages) {
            let err = SyncError::Cache(format!("{err:#}"));
            warn!(conversation = %self.key, %err, "failed to persist message cache");
        }
    }
}
