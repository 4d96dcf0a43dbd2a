//! Collaborator seams: the remote message store and the realtime transport.

mod memory;

pub use memory::MemoryRemote;

use async_trait::async_trait;
use chatsync_messaging::{Attachment, ConversationKey, Message, MessageId};
use tokio::sync::mpsc;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("request timed out")]
    Timeout,
}

/// Server-side message history.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Rows ordered by `created_ms` descending, skipping `offset`.
    async fn fetch_range(
        &self,
        key: &ConversationKey,
        offset: usize,
        limit: usize,
    ) -> RemoteResult<Vec<Message>>;

    /// Store a new message from the local user; returns the confirmed row.
    async fn send(
        &self,
        key: &ConversationKey,
        content: &str,
        attachments: &[Attachment],
    ) -> RemoteResult<Message>;

    /// Mark the peer's messages in this conversation as read.
    async fn mark_read(&self, key: &ConversationKey) -> RemoteResult<()>;

    async fn delete(&self, key: &ConversationKey, id: &MessageId) -> RemoteResult<()>;
}

/// Lifecycle signals reported by a realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Closed,
    Error,
    TimedOut,
}

#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Insert(Message),
    Update(Message),
    Status(ChannelStatus),
}

pub type EventSink = mpsc::UnboundedSender<RealtimeEvent>;

/// Opaque token for one open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Live INSERT/UPDATE feed for a conversation.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open a channel; the subscription ack arrives later on `sink` as
    /// [`ChannelStatus::Subscribed`].
    async fn subscribe(&self, key: &ConversationKey, sink: EventSink)
        -> RemoteResult<ChannelHandle>;

    async fn unsubscribe(&self, handle: ChannelHandle);
}
