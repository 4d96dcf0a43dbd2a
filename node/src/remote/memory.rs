use super::{
    ChannelHandle, ChannelStatus, EventSink, RealtimeEvent, RealtimeTransport, RemoteError,
    RemoteResult, RemoteStore,
};
use async_trait::async_trait;
use chatsync_messaging::{now_ms, Attachment, ConversationKey, Message, MessageId, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Loopback backend serving one local user.
///
/// Behaves like a hosted message table with a change feed: sends are
/// stamped with monotonic server time and fanned out to every live channel
/// of the conversation. The knobs (`fail_next_*`, manual acks, counters)
/// let callers script outages.
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<Mutex<MemoryState>>,
}

struct MemoryState {
    local_user: UserId,
    rows: HashMap<ConversationKey, Vec<Message>>,
    channels: HashMap<u64, (ConversationKey, EventSink)>,
    next_channel: u64,
    last_created_ms: i64,
    auto_ack: bool,
    fetch_delay: Option<Duration>,
    send_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    fail_fetches: usize,
    fail_sends: usize,
    fail_receipts: usize,
    fail_subscribes: usize,
    fetch_log: Vec<usize>,
    send_calls: usize,
    mark_read_calls: usize,
    subscribe_calls: usize,
}

impl MemoryRemote {
    pub fn new(local_user: UserId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                local_user,
                rows: HashMap::new(),
                channels: HashMap::new(),
                next_channel: 1,
                last_created_ms: 0,
                auto_ack: true,
                fetch_delay: None,
                send_delay: None,
                subscribe_delay: None,
                fail_fetches: 0,
                fail_sends: 0,
                fail_receipts: 0,
                fail_subscribes: 0,
                fetch_log: Vec::new(),
                send_calls: 0,
                mark_read_calls: 0,
                subscribe_calls: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store rows without notifying channels, as if they predate the session.
    pub fn seed(&self, messages: impl IntoIterator<Item = Message>) {
        let mut state = self.state();
        for message in messages {
            state.last_created_ms = state.last_created_ms.max(message.created_ms);
            state
                .rows
                .entry(message.conversation_key())
                .or_default()
                .push(message);
        }
    }

    /// Store a row and publish it as an INSERT.
    pub fn push_insert(&self, message: Message) {
        let mut state = self.state();
        let key = message.conversation_key();
        state.last_created_ms = state.last_created_ms.max(message.created_ms);
        state.rows.entry(key.clone()).or_default().push(message.clone());
        state.broadcast(&key, RealtimeEvent::Insert(message));
    }

    /// Replace a row by id and publish it as an UPDATE.
    pub fn push_update(&self, message: Message) {
        let mut state = self.state();
        let key = message.conversation_key();
        if let Some(rows) = state.rows.get_mut(&key) {
            if let Some(row) = rows.iter_mut().find(|row| row.id == message.id) {
                *row = message.clone();
            }
        }
        state.broadcast(&key, RealtimeEvent::Update(message));
    }

    /// Report `status` on every live channel of `key`. Terminal statuses
    /// drop the channel, like a transport that lost its socket.
    pub fn set_status(&self, key: &ConversationKey, status: ChannelStatus) {
        let mut state = self.state();
        state.broadcast(key, RealtimeEvent::Status(status));
        if status != ChannelStatus::Subscribed {
            state.channels.retain(|_, (channel_key, _)| channel_key != key);
        }
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.state().auto_ack = auto_ack;
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state().fetch_delay = delay;
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.state().send_delay = delay;
    }

    /// Stall `subscribe` before it registers the channel.
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        self.state().subscribe_delay = delay;
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.state().fail_fetches = count;
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.state().fail_sends = count;
    }

    pub fn fail_next_receipts(&self, count: usize) {
        self.state().fail_receipts = count;
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        self.state().fail_subscribes = count;
    }

    /// Offsets of every `fetch_range` call, in call order.
    pub fn fetch_log(&self) -> Vec<usize> {
        self.state().fetch_log.clone()
    }

    pub fn send_calls(&self) -> usize {
        self.state().send_calls
    }

    pub fn mark_read_calls(&self) -> usize {
        self.state().mark_read_calls
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn active_channels(&self, key: &ConversationKey) -> usize {
        self.state()
            .channels
            .values()
            .filter(|(channel_key, _)| channel_key == key)
            .count()
    }

    pub fn rows(&self, key: &ConversationKey) -> Vec<Message> {
        self.state().rows.get(key).cloned().unwrap_or_default()
    }
}

impl MemoryState {
    fn broadcast(&mut self, key: &ConversationKey, event: RealtimeEvent) {
        // Closed sinks belong to torn-down sessions.
        self.channels.retain(|_, (channel_key, sink)| {
            channel_key != key || sink.send(event.clone()).is_ok()
        });
    }

    fn next_created_ms(&mut self) -> i64 {
        self.last_created_ms = now_ms().max(self.last_created_ms + 1);
        self.last_created_ms
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_range(
        &self,
        key: &ConversationKey,
        offset: usize,
        limit: usize,
    ) -> RemoteResult<Vec<Message>> {
        let delay = self.state().fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.fetch_log.push(offset);
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(RemoteError::Unavailable("fetch failure injected".into()));
        }

        let mut rows = state.rows.get(key).cloned().unwrap_or_default();
        rows.sort_by(|a, b| b.created_ms.cmp(&a.created_ms));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn send(
        &self,
        key: &ConversationKey,
        content: &str,
        attachments: &[Attachment],
    ) -> RemoteResult<Message> {
        let delay = self.state().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.send_calls += 1;
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(RemoteError::Rejected("send failure injected".into()));
        }

        let sender = state.local_user.clone();
        let receiver = key
            .other(&sender)
            .cloned()
            .ok_or_else(|| RemoteError::Rejected(format!("{sender} is not part of {key}")))?;
        let created_ms = state.next_created_ms();
        let mut message = Message::confirmed(
            format!("srv_{}", Uuid::new_v4().simple()),
            sender,
            receiver,
            content,
            created_ms,
        );
        message.attachments = attachments.to_vec();

        state.rows.entry(key.clone()).or_default().push(message.clone());
        state.broadcast(key, RealtimeEvent::Insert(message.clone()));
        debug!(conversation = %key, id = %message.id, "loopback stored message");
        Ok(message)
    }

    async fn mark_read(&self, key: &ConversationKey) -> RemoteResult<()> {
        let mut state = self.state();
        state.mark_read_calls += 1;
        if state.fail_receipts > 0 {
            state.fail_receipts -= 1;
            return Err(RemoteError::Timeout);
        }

        let local = state.local_user.clone();
        let read_ms = now_ms();
        let mut updated = Vec::new();
        if let Some(rows) = state.rows.get_mut(key) {
            for row in rows
                .iter_mut()
                .filter(|row| row.receiver_id == local && row.read_ms.is_none())
            {
                row.read_ms = Some(read_ms);
                updated.push(row.clone());
            }
        }
        for row in updated {
            state.broadcast(key, RealtimeEvent::Update(row));
        }
        Ok(())
    }

    async fn delete(&self, key: &ConversationKey, id: &MessageId) -> RemoteResult<()> {
        let mut state = self.state();
        if let Some(rows) = state.rows.get_mut(key) {
            rows.retain(|row| &row.id != id);
        }
        Ok(())
    }
}

#[async_trait]
impl RealtimeTransport for MemoryRemote {
    async fn subscribe(
        &self,
        key: &ConversationKey,
        sink: EventSink,
    ) -> RemoteResult<ChannelHandle> {
        let delay = self.state().subscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.subscribe_calls += 1;
        if state.fail_subscribes > 0 {
            state.fail_subscribes -= 1;
            return Err(RemoteError::Unavailable("subscribe failure injected".into()));
        }

        let id = state.next_channel;
        state.next_channel += 1;
        if state.auto_ack {
            let _ = sink.send(RealtimeEvent::Status(ChannelStatus::Subscribed));
        }
        state.channels.insert(id, (key.clone(), sink));
        Ok(ChannelHandle(id))
    }

    async fn unsubscribe(&self, handle: ChannelHandle) {
        self.state().channels.remove(&handle.0);
    }
}
