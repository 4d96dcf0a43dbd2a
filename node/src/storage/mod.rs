//! Persistent key/value backends and the per-conversation message snapshot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chatsync_messaging::{ConversationKey, Message};
use tracing::{debug, warn};

/// Byte-oriented local store. Reads must be local and fast.
pub trait PersistentKv: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

#[derive(Clone)]
pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    const TREE: &'static str = "message_cache";

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create storage directory {:?}", path))?;
        let db = sled::open(path)
            .with_context(|| format!("failed to open sled database at {:?}", path))?;
        Ok(Self { db })
    }

    fn tree(&self) -> sled::Result<sled::Tree> {
        self.db.open_tree(Self::TREE)
    }
}

impl PersistentKv for SledKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let tree = self.tree()?;
        Ok(tree.get(key.as_bytes())?.map(|value| value.to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let tree = self.tree()?;
        tree.insert(key.as_bytes(), value)?;
        Ok(())
    }
}

/// Process-local store, used by tests and ephemeral nodes.
#[derive(Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentKv for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| anyhow!("lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("lock poisoned"))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Bounded snapshot of the newest messages of each conversation.
#[derive(Clone)]
pub struct LocalCache {
    kv: Arc<dyn PersistentKv>,
    limit: usize,
}

impl LocalCache {
    pub fn new(kv: Arc<dyn PersistentKv>, limit: usize) -> Self {
        Self { kv, limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Missing or unreadable snapshots load as empty.
    pub fn load(&self, key: &ConversationKey) -> Vec<Message> {
        match self.try_load(key) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(conversation = %key, ?err, "discarding unreadable message cache");
                Vec::new()
            }
        }
    }

    fn try_load(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        let Some(bytes) = self.kv.get(&key.cache_key())? else {
            return Ok(Vec::new());
        };
        let messages: Vec<Message> =
            bincode::deserialize(&bytes).context("message cache entry is corrupt")?;
        Ok(messages)
    }

    /// Persist at most `limit` entries from the head of `messages`.
    pub fn save(&self, key: &ConversationKey, messages: &[Message]) -> Result<()> {
        let bounded = &messages[..messages.len().min(self.limit)];
        let encoded = bincode::serialize(bounded)?;
        self.kv.set(&key.cache_key(), &encoded)?;
        debug!(conversation = %key, count = bounded.len(), "message cache saved");
        Ok(())
    }
}
