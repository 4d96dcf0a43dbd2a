//! Single-writer actor owning one conversation's sync state.
//!
//! Fetch completions, realtime deliveries, send acks and caller commands all
//! funnel into one task, so the store never sees concurrent mutation.

use super::{
    ConnectionStatus, EngineInner, MessageStore, PaginationController, ReadReceiptMarker,
    StatusOutcome, SubscriptionManager, SubscriptionSignal, SyncError, SyncEvent, SyncResult,
};
use crate::remote::{RealtimeEvent, RemoteError, RemoteStore};
use chatsync_messaging::{Attachment, ConversationKey, Message, MessageId, Reconciler, UserId};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Command {
    Focus,
    Unfocus,
    LoadOlder,
    Send {
        content: String,
        attachments: Vec<Attachment>,
        reply: oneshot::Sender<SyncResult<MessageId>>,
    },
    Delete(MessageId),
    Barrier(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Completions of work spawned by the actor.
enum Completion {
    PageFetched {
        epoch: u64,
        page: usize,
        result: Result<Vec<Message>, RemoteError>,
    },
    SendFinished {
        optimistic: MessageId,
        result: Result<Message, RemoteError>,
    },
}

/// Cloneable handle to a conversation session.
#[derive(Clone)]
pub struct ConversationHandle {
    key: ConversationKey,
    commands: mpsc::UnboundedSender<Command>,
    messages: watch::Receiver<Vec<Message>>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<SyncEvent>,
}

impl ConversationHandle {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    fn command(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Show cached history, fetch the newest page, open the realtime
    /// channel and mark the conversation read.
    pub fn focus(&self) -> SyncResult<()> {
        self.command(Command::Focus)
    }

    /// Cancel fetches, close the channel and stop reconnecting.
    pub fn unfocus(&self) -> SyncResult<()> {
        self.command(Command::Unfocus)
    }

    /// Fetch the next older page, unless history is exhausted.
    pub fn load_older(&self) -> SyncResult<()> {
        self.command(Command::LoadOlder)
    }

    /// Insert an optimistic entry and send it. Returns the optimistic id;
    /// a rejection later surfaces as [`SyncEvent::SendFailed`].
    pub async fn send_optimistic(
        &self,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> SyncResult<MessageId> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            content: content.into(),
            attachments,
            reply,
        })?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    pub fn delete(&self, id: MessageId) -> SyncResult<()> {
        self.command(Command::Delete(id))
    }

    /// Resolves once every command sent before it has been applied.
    pub async fn barrier(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Barrier(tx))?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Current canonical sequence, newest first.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn same_session(&self, other: &ConversationHandle) -> bool {
        self.commands.same_channel(&other.commands)
    }

    /// Stop the session and wait for its teardown.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

pub(crate) fn spawn(engine: &EngineInner, peer: UserId) -> ConversationHandle {
    let key = ConversationKey::new(engine.local_user.clone(), peer.clone());
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (messages_tx, messages_rx) = watch::channel(Vec::new());
    let (events_tx, _) = broadcast::channel(64);

    let (subscription, status_rx) = SubscriptionManager::new(
        key.clone(),
        Arc::clone(&engine.transport),
        engine.config.reconnect.clone(),
        signal_tx,
    );

    let actor = SessionActor {
        key: key.clone(),
        local_user: engine.local_user.clone(),
        peer,
        remote: Arc::clone(&engine.remote),
        store: MessageStore::new(
            key.clone(),
            Reconciler::new(engine.config.dedup_window_ms),
            engine.cache.clone(),
        ),
        pagination: PaginationController::new(engine.config.page_size),
        subscription,
        receipts: ReadReceiptMarker::new(Arc::clone(&engine.remote), key.clone()),
        focused: false,
        hydrated: false,
        epoch: 0,
        in_flight: HashMap::new(),
        discarded: HashSet::new(),
        deleted: HashSet::new(),
        completion_tx,
        messages_tx,
        events_tx: events_tx.clone(),
    };
    tokio::spawn(actor.run(command_rx, completion_rx, signal_rx));

    ConversationHandle {
        key,
        commands: command_tx,
        messages: messages_rx,
        status: status_rx,
        events: events_tx,
    }
}

struct SessionActor {
    key: ConversationKey,
    local_user: UserId,
    peer: UserId,
    remote: Arc<dyn RemoteStore>,
    store: MessageStore,
    pagination: PaginationController,
    subscription: SubscriptionManager,
    receipts: ReadReceiptMarker,
    focused: bool,
    hydrated: bool,
    /// Bumped on unfocus; completions from older epochs are dropped.
    epoch: u64,
    in_flight: HashMap<usize, JoinHandle<()>>,
    /// Optimistic ids deleted before their send was acknowledged.
    discarded: HashSet<MessageId>,
    /// Confirmed ids of discarded sends; kept out of later merges.
    deleted: HashSet<MessageId>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    messages_tx: watch::Sender<Vec<Message>>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut signals: mpsc::UnboundedReceiver<SubscriptionSignal>,
    ) {
        debug!(conversation = %self.key, "session started");
        loop {
            // Commands first: an unfocus voids completions still queued.
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(done) = self.handle_command(command) {
                            commands.close();
                            let _ = done.send(());
                            break;
                        }
                    }
                    None => {
                        self.teardown();
                        break;
                    }
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                Some(signal) = signals.recv() => self.handle_signal(signal),
            }
        }
        debug!(conversation = %self.key, "session stopped");
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Focus => self.focus(),
            Command::Unfocus => self.unfocus(),
            Command::LoadOlder => {
                if self.focused {
                    self.request_page(self.pagination.next_page());
                } else {
                    debug!(conversation = %self.key, "ignoring load_older while unfocused");
                }
            }
            Command::Send {
                content,
                attachments,
                reply,
            } => {
                let _ = reply.send(self.send(content, attachments));
            }
            Command::Delete(id) => self.delete(id),
            Command::Barrier(done) => {
                let _ = done.send(());
            }
            Command::Shutdown(done) => {
                self.teardown();
                return ControlFlow::Break(done);
            }
        }
        ControlFlow::Continue(())
    }

    fn focus(&mut self) {
        if self.focused {
            return;
        }
        self.focused = true;
        info!(conversation = %self.key, "conversation focused");

        if !self.hydrated {
            self.store.hydrate();
            self.hydrated = true;
            self.publish();
        }
        self.request_page(0);
        self.subscription.open();
        self.receipts.mark_read();
    }

    fn unfocus(&mut self) {
        if !self.focused {
            return;
        }
        self.teardown();
        info!(conversation = %self.key, "conversation unfocused");
    }

    fn teardown(&mut self) {
        self.focused = false;
        self.epoch += 1;
        for (_, fetch) in self.in_flight.drain() {
            fetch.abort();
        }
        self.subscription.close();
    }

    fn request_page(&mut self, page: usize) {
        if self.in_flight.contains_key(&page) {
            debug!(conversation = %self.key, page, "page fetch already in flight");
            return;
        }
        let Some(request) = self.pagination.request(page) else {
            debug!(conversation = %self.key, page, "history exhausted, skipping fetch");
            return;
        };

        let remote = Arc::clone(&self.remote);
        let key = self.key.clone();
        let completions = self.completion_tx.clone();
        let epoch = self.epoch;
        let fetch = tokio::spawn(async move {
            let result = remote
                .fetch_range(&key, request.offset, request.limit)
                .await;
            let _ = completions.send(Completion::PageFetched {
                epoch,
                page,
                result,
            });
        });
        self.in_flight.insert(page, fetch);
    }

    fn send(&mut self, content: String, attachments: Vec<Attachment>) -> SyncResult<MessageId> {
        let pending = Message::optimistic(
            self.local_user.clone(),
            self.peer.clone(),
            content,
            attachments,
        );
        pending
            .validate()
            .map_err(|err| SyncError::Send(err.to_string()))?;
        let optimistic = pending.id.clone();

        let remote = Arc::clone(&self.remote);
        let key = self.key.clone();
        let completions = self.completion_tx.clone();
        let (content, attachments) = (pending.content.clone(), pending.attachments.clone());
        let id = optimistic.clone();
        tokio::spawn(async move {
            let result = remote.send(&key, &content, &attachments).await;
            let _ = completions.send(Completion::SendFinished {
                optimistic: id,
                result,
            });
        });

        self.store.merge(vec![pending]);
        self.publish();
        Ok(optimistic)
    }

    fn delete(&mut self, id: MessageId) {
        if !self.store.contains(&id) {
            return;
        }
        self.store.remove(&id);
        self.publish();

        if id.is_optimistic() {
            // The server row does not exist yet; delete it once acknowledged.
            self.discarded.insert(id);
            return;
        }
        self.delete_remote(id);
    }

    fn delete_remote(&self, id: MessageId) {
        let remote = Arc::clone(&self.remote);
        let key = self.key.clone();
        tokio::spawn(async move {
            if let Err(err) = remote.delete(&key, &id).await {
                warn!(conversation = %key, %id, %err, "remote delete failed");
            }
        });
    }

    fn finish_discarded(&mut self, optimistic: MessageId, result: Result<Message, RemoteError>) {
        let Ok(confirmed) = result else {
            debug!(conversation = %self.key, %optimistic, "deleted send was rejected");
            return;
        };
        debug!(
            conversation = %self.key,
            %optimistic,
            id = %confirmed.id,
            "deleting acknowledged send"
        );
        if self.store.contains(&confirmed.id) {
            self.store.remove(&confirmed.id);
            self.publish();
        }
        self.deleted.insert(confirmed.id.clone());
        self.delete_remote(confirmed.id);
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::PageFetched {
                epoch,
                page,
                result,
            } => {
                if epoch != self.epoch {
                    debug!(conversation = %self.key, page, "dropping fetch from closed focus");
                    return;
                }
                self.in_flight.remove(&page);
                match result {
                    Ok(rows) => {
                        let page = self.pagination.complete(page, rows);
                        let count = page.messages.len();
                        let rows = page
                            .messages
                            .into_iter()
                            .filter(|m| !self.deleted.contains(&m.id))
                            .collect();
                        self.store.merge(rows);
                        self.publish();
                        self.emit(SyncEvent::PageLoaded {
                            page: page.index,
                            count,
                            exhausted: page.exhausted,
                        });
                    }
                    Err(err) => {
                        let err = SyncError::Fetch(err);
                        warn!(conversation = %self.key, page, %err, "keeping current messages");
                    }
                }
            }
            Completion::SendFinished { optimistic, result } => {
                if self.discarded.remove(&optimistic) {
                    self.finish_discarded(optimistic, result);
                    return;
                }
                match result {
                    Ok(confirmed) => {
                        let confirmed_id = confirmed.id.clone();
                        self.store.confirm(&optimistic, confirmed);
                        self.publish();
                        self.emit(SyncEvent::SendConfirmed {
                            optimistic,
                            confirmed: confirmed_id,
                        });
                    }
                    Err(err) => {
                        let err = SyncError::Send(err.to_string());
                        warn!(
                            conversation = %self.key,
                            %optimistic,
                            %err,
                            "dropping optimistic message"
                        );
                        self.store.remove(&optimistic);
                        self.publish();
                        self.emit(SyncEvent::SendFailed {
                            optimistic,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    fn handle_signal(&mut self, signal: SubscriptionSignal) {
        match signal {
            SubscriptionSignal::ReconnectDue { ticket } => {
                self.subscription.on_reconnect_due(ticket);
            }
            SubscriptionSignal::Subscribed { channel, result } => {
                self.subscription.on_subscribed(channel, result);
            }
            SubscriptionSignal::Event {
                channel,
                event: RealtimeEvent::Status(status),
            } => {
                if let StatusOutcome::Connected { refetch: true } =
                    self.subscription.on_status(channel, status)
                {
                    self.request_page(0);
                }
            }
            SubscriptionSignal::Event { channel, event } => {
                if !self.subscription.accepts(channel) {
                    return;
                }
                match event {
                    RealtimeEvent::Insert(message)
                        if message.belongs_to(&self.key) && !self.deleted.contains(&message.id) =>
                    {
                        let from_peer = message.sender_id == self.peer;
                        self.store.merge(vec![message]);
                        self.publish();
                        if from_peer {
                            self.receipts.mark_read();
                        }
                    }
                    RealtimeEvent::Update(message) if message.belongs_to(&self.key) => {
                        if self.store.apply_update(message) {
                            self.publish();
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn publish(&self) {
        self.messages_tx.send_replace(self.store.messages().to_vec());
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::remote::{ChannelStatus, MemoryRemote};
    use crate::storage::{LocalCache, MemoryKv, PersistentKv};
    use crate::sync::SyncEngine;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixture {
        remote: MemoryRemote,
        cache: LocalCache,
        engine: SyncEngine,
        key: ConversationKey,
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    fn fixture() -> Fixture {
        let remote = MemoryRemote::new(alice());
        let cache = LocalCache::new(Arc::new(MemoryKv::new()), 50);
        let engine = SyncEngine::new(
            alice(),
            Arc::new(remote.clone()),
            Arc::new(remote.clone()),
            cache.clone(),
            SyncConfig::default(),
        );
        Fixture {
            remote,
            cache,
            engine,
            key: ConversationKey::new(alice(), bob()),
        }
    }

    fn from_bob(index: i64) -> Message {
        Message::confirmed(
            format!("srv_{index}"),
            bob(),
            alice(),
            format!("message {index}"),
            (index + 1) * 1_000,
        )
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..2_000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held: {what}");
    }

    async fn connected(handle: &ConversationHandle) {
        eventually("channel connected", || {
            handle.connection_status() == ConnectionStatus::Connected
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_shows_cache_then_merges_first_page() {
        let f = fixture();
        let cached: Vec<Message> = (0..10).rev().map(from_bob).collect();
        f.cache.save(&f.key, &cached).unwrap();
        f.remote.seed((0..15).map(from_bob));
        f.remote.set_fetch_delay(Some(Duration::from_secs(1)));

        let handle = f.engine.conversation(bob()).unwrap();
        handle.focus().unwrap();
        handle.barrier().await.unwrap();
        let shown: Vec<_> = handle.messages().into_iter().map(|m| m.id).collect();
        let expected: Vec<_> = cached.into_iter().map(|m| m.id).collect();
        assert_eq!(shown, expected);

        eventually("first page merged", || handle.messages().len() == 15).await;
        let messages = handle.messages();
        assert_eq!(messages[0].id.as_str(), "srv_14");
        assert!(messages
            .windows(2)
            .all(|pair| pair[0].created_ms > pair[1].created_ms));
        let unique: HashSet<_> = messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(unique.len(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_send_is_replaced_by_confirmed_row() {
        let f = fixture();
        let handle = f.engine.conversation(bob()).unwrap();
        let mut events = handle.subscribe_events();
        handle.focus().unwrap();
        connected(&handle).await;

        let optimistic = handle.send_optimistic("hello", Vec::new()).await.unwrap();
        assert!(optimistic.is_optimistic());

        let confirmed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SyncEvent::SendConfirmed {
                    optimistic: id,
                    confirmed,
                }) = events.recv().await
                {
                    assert_eq!(id, optimistic);
                    return confirmed;
                }
            }
        })
        .await
        .unwrap();

        handle.barrier().await.unwrap();
        let messages = handle.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, confirmed);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(f.remote.rows(&f.key).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_send_removes_optimistic_entry() {
        let f = fixture();
        f.remote.fail_next_sends(1);
        let handle = f.engine.conversation(bob()).unwrap();
        let mut events = handle.subscribe_events();
        handle.focus().unwrap();

        let optimistic = handle.send_optimistic("lost", Vec::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SyncEvent::SendFailed { optimistic: id, .. }) = events.recv().await {
                    assert_eq!(id, optimistic);
                    return;
                }
            }
        })
        .await
        .unwrap();
        assert!(handle.messages().iter().all(|m| m.id != optimistic));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_send_is_refused() {
        let f = fixture();
        let handle = f.engine.conversation(bob()).unwrap();

        let result = handle.send_optimistic("", Vec::new()).await;

        assert!(matches!(result, Err(SyncError::Send(_))));
        assert_eq!(f.remote.send_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_refetches_head_exactly_once() {
        let f = fixture();
        f.remote.seed((0..3).map(from_bob));
        let handle = f.engine.conversation(bob()).unwrap();
        handle.focus().unwrap();
        connected(&handle).await;
        eventually("initial page", || f.remote.fetch_log() == vec![0]).await;

        f.remote.fail_next_subscribes(2);
        f.remote.set_status(&f.key, ChannelStatus::Closed);
        eventually("drop noticed", || {
            handle.connection_status() == ConnectionStatus::Disconnected
        })
        .await;

        connected(&handle).await;
        eventually("head refetched", || f.remote.fetch_log().len() == 2).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(f.remote.fetch_log(), vec![0, 0]);
        assert_eq!(f.remote.subscribe_calls(), 4);
        assert_eq!(f.remote.active_channels(&f.key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_focus_keeps_one_channel() {
        let f = fixture();
        let handle = f.engine.conversation(bob()).unwrap();

        handle.focus().unwrap();
        handle.focus().unwrap();
        connected(&handle).await;
        handle.focus().unwrap();
        handle.barrier().await.unwrap();

        assert_eq!(f.remote.subscribe_calls(), 1);
        assert_eq!(f.remote.active_channels(&f.key), 1);

        handle.unfocus().unwrap();
        handle.barrier().await.unwrap();
        assert_eq!(handle.connection_status(), ConnectionStatus::Disconnected);
        eventually("channel released", || f.remote.active_channels(&f.key) == 0).await;

        handle.focus().unwrap();
        connected(&handle).await;
        assert_eq!(f.remote.subscribe_calls(), 2);
        assert_eq!(f.remote.active_channels(&f.key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn older_pages_stop_at_exhaustion() {
        let f = fixture();
        f.remote.seed((0..45).map(from_bob));
        let handle = f.engine.conversation(bob()).unwrap();

        handle.focus().unwrap();
        eventually("page 0", || handle.messages().len() == 20).await;
        handle.load_older().unwrap();
        eventually("page 1", || handle.messages().len() == 40).await;
        handle.load_older().unwrap();
        eventually("page 2", || handle.messages().len() == 45).await;

        handle.load_older().unwrap();
        handle.load_older().unwrap();
        handle.barrier().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(f.remote.fetch_log(), vec![0, 20, 40]);
        assert_eq!(handle.messages().last().map(|m| m.id.as_str()), Some("srv_0"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_keeps_messages_and_can_be_retried() {
        let f = fixture();
        f.remote.seed((0..25).map(from_bob));
        let handle = f.engine.conversation(bob()).unwrap();
        handle.focus().unwrap();
        eventually("page 0", || handle.messages().len() == 20).await;

        f.remote.fail_next_fetches(1);
        handle.load_older().unwrap();
        eventually("failed attempt", || f.remote.fetch_log().len() == 2).await;
        handle.barrier().await.unwrap();
        assert_eq!(handle.messages().len(), 20);

        handle.load_older().unwrap();
        eventually("retry merged", || handle.messages().len() == 25).await;
        assert_eq!(f.remote.fetch_log(), vec![0, 20, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_insert_is_merged_and_marked_read() {
        let f = fixture();
        let handle = f.engine.conversation(bob()).unwrap();
        handle.focus().unwrap();
        connected(&handle).await;
        eventually("focus receipt", || f.remote.mark_read_calls() == 1).await;

        f.remote.push_insert(from_bob(7));
        eventually("insert merged", || handle.messages().len() == 1).await;
        eventually("insert receipt", || f.remote.mark_read_calls() == 2).await;
        eventually("read update applied", || {
            handle.messages()[0].read_ms.is_some()
        })
        .await;

        let own = Message::confirmed("srv_own", alice(), bob(), "mine", 9_000);
        f.remote.push_insert(own);
        eventually("own insert merged", || handle.messages().len() == 2).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.remote.mark_read_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn receipt_failure_does_not_block_rendering() {
        let f = fixture();
        f.remote.fail_next_receipts(1);
        f.remote.seed((0..3).map(from_bob));
        let handle = f.engine.conversation(bob()).unwrap();

        handle.focus().unwrap();

        eventually("messages shown", || handle.messages().len() == 3).await;
        eventually("receipt attempted", || f.remote.mark_read_calls() == 1).await;
        handle.load_older().unwrap();
        handle.barrier().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unfocus_cancels_in_flight_fetch() {
        let f = fixture();
        f.remote.seed((0..5).map(from_bob));
        f.remote.set_fetch_delay(Some(Duration::from_secs(1)));
        let handle = f.engine.conversation(bob()).unwrap();

        handle.focus().unwrap();
        handle.barrier().await.unwrap();
        handle.unfocus().unwrap();
        handle.barrier().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(handle.messages().is_empty());
        assert!(f.remote.fetch_log().is_empty());
        assert_eq!(f.remote.active_channels(&f.key), 0);
        assert_eq!(handle.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_locally_and_remotely() {
        let f = fixture();
        f.remote.seed((0..2).map(from_bob));
        let handle = f.engine.conversation(bob()).unwrap();
        handle.focus().unwrap();
        eventually("loaded", || handle.messages().len() == 2).await;

        handle.delete(MessageId::new("srv_1")).unwrap();
        handle.barrier().await.unwrap();

        assert_eq!(handle.messages().len(), 1);
        eventually("remote row deleted", || f.remote.rows(&f.key).len() == 1).await;
        assert_eq!(f.cache.load(&f.key).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_subscribe_does_not_hold_back_pages() {
        let f = fixture();
        f.remote.seed((0..3).map(from_bob));
        f.remote.set_subscribe_delay(Some(Duration::from_secs(30)));
        let handle = f.engine.conversation(bob()).unwrap();

        handle.focus().unwrap();
        eventually("page merged while connecting", || handle.messages().len() == 3).await;
        assert_eq!(handle.connection_status(), ConnectionStatus::Connecting);

        let started = tokio::time::Instant::now();
        handle.unfocus().unwrap();
        handle.barrier().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.messages().len(), 3);
        assert_eq!(handle.connection_status(), ConnectionStatus::Disconnected);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(f.remote.subscribe_calls(), 1);
        assert_eq!(f.remote.active_channels(&f.key), 0);
    }

    /// Cache backend whose next write parks the caller until released.
    struct GatedKv {
        inner: MemoryKv,
        armed: AtomicBool,
        parked: AtomicBool,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl PersistentKv for GatedKv {
        fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.parked.store(true, Ordering::SeqCst);
                let _ = self.release.lock().unwrap().recv();
            }
            self.inner.set(key, value)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_completed_before_unfocus_is_applied_is_dropped() {
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let kv = Arc::new(GatedKv {
            inner: MemoryKv::new(),
            armed: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            release: Mutex::new(release_rx),
        });
        let remote = MemoryRemote::new(alice());
        remote.seed((0..3).map(from_bob));
        remote.set_fetch_delay(Some(Duration::from_millis(200)));
        let engine = SyncEngine::new(
            alice(),
            Arc::new(remote.clone()),
            Arc::new(remote.clone()),
            LocalCache::new(kv.clone(), 50),
            SyncConfig::default(),
        );
        let handle = engine.conversation(bob()).unwrap();
        handle.focus().unwrap();
        handle.barrier().await.unwrap();

        // Park the session inside the write of an optimistic send.
        kv.armed.store(true, Ordering::SeqCst);
        let sender = handle.clone();
        let send = tokio::spawn(async move { sender.send_optimistic("parked", Vec::new()).await });
        eventually("session parked", || kv.parked.load(Ordering::SeqCst)).await;

        eventually("page fetched", || remote.fetch_log() == vec![0]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.unfocus().unwrap();
        release_tx.send(()).unwrap();

        send.await.unwrap().unwrap();
        handle.barrier().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(handle.messages().iter().all(|m| m.content == "parked"));
        assert_eq!(handle.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(remote.fetch_log(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_pending_send_removes_acknowledged_row() {
        let f = fixture();
        f.remote.set_send_delay(Some(Duration::from_secs(1)));
        let handle = f.engine.conversation(bob()).unwrap();
        handle.focus().unwrap();
        connected(&handle).await;

        let optimistic = handle.send_optimistic("typo", Vec::new()).await.unwrap();
        handle.delete(optimistic).unwrap();
        handle.barrier().await.unwrap();
        assert!(handle.messages().is_empty());

        eventually("send reached server", || f.remote.send_calls() == 1).await;
        eventually("acknowledged row deleted", || f.remote.rows(&f.key).is_empty()).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(handle.messages().is_empty());
        assert!(f.cache.load(&f.key).is_empty());
    }
}
