//! Message model shared by the ChatSync sync engine and its collaborators.

pub mod reconcile;

pub use reconcile::{apply_update, reconcile, Reconciler, DEFAULT_DEDUP_WINDOW_MS};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Reserved prefix for locally generated, not yet confirmed message ids.
pub const OPTIMISTIC_PREFIX: &str = "opt_";

/// Milliseconds since the Unix epoch according to the local clock.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Identifier of a participant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message identifier. Server ids are opaque; optimistic ids carry
/// [`OPTIMISTIC_PREFIX`] and are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh optimistic id.
    pub fn optimistic() -> Self {
        Self(format!("{OPTIMISTIC_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn is_optimistic(&self) -> bool {
        self.0.starts_with(OPTIMISTIC_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unordered pair of participants identifying a two-party thread.
///
/// The pair is stored sorted, so `new(a, b) == new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The participant that is not `user`, if `user` is part of the pair.
    pub fn other(&self, user: &UserId) -> Option<&UserId> {
        if &self.low == user {
            Some(&self.high)
        } else if &self.high == user {
            Some(&self.low)
        } else {
            None
        }
    }

    /// Key under which the local snapshot for this pair is persisted.
    pub fn cache_key(&self) -> String {
        format!("chat_messages:{}:{}", self.low, self.high)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
    Audio,
}

/// Uploaded attachment reference. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: Option<String>,
    pub size: Option<u64>,
    pub duration_ms: Option<u64>,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            name: None,
            size: None,
            duration_ms: None,
        }
    }
}

/// Whether a message is still awaiting server confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Optimistic,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Server-assigned for confirmed messages, client clock for optimistic ones.
    pub created_ms: i64,
    pub read_ms: Option<i64>,
    pub is_edited: bool,
}

impl Message {
    /// Build a confirmed message as the remote store would return it.
    pub fn confirmed(
        id: impl Into<String>,
        sender_id: UserId,
        receiver_id: UserId,
        content: impl Into<String>,
        created_ms: i64,
    ) -> Self {
        Self {
            id: MessageId::new(id),
            sender_id,
            receiver_id,
            content: content.into(),
            attachments: Vec::new(),
            created_ms,
            read_ms: None,
            is_edited: false,
        }
    }

    /// Build an optimistic entry stamped with the local clock.
    pub fn optimistic(
        sender_id: UserId,
        receiver_id: UserId,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            id: MessageId::optimistic(),
            sender_id,
            receiver_id,
            content: content.into(),
            attachments,
            created_ms: now_ms(),
            read_ms: None,
            is_edited: false,
        }
    }

    pub fn origin(&self) -> Origin {
        if self.id.is_optimistic() {
            Origin::Optimistic
        } else {
            Origin::Confirmed
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.origin() == Origin::Optimistic
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id.clone(), self.receiver_id.clone())
    }

    pub fn belongs_to(&self, key: &ConversationKey) -> bool {
        self.conversation_key() == *key
    }

    /// Messages need text, at least one attachment, or both.
    pub fn validate(&self) -> Result<()> {
        if self.content.is_empty() && self.attachments.is_empty() {
            return Err(MessagingError::EmptyMessage(self.id.to_string()));
        }
        if self.sender_id == self.receiver_id {
            return Err(MessagingError::InvalidParticipants(self.sender_id.to_string()));
        }
        Ok(())
    }
}

/// Messaging-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("message {0} has neither content nor attachments")]
    EmptyMessage(String),
    #[error("sender and receiver are the same participant: {0}")]
    InvalidParticipants(String),
}

pub type Result<T> = std::result::Result<T, MessagingError>;
