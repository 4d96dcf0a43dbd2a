//! Realtime channel lifecycle for one conversation.
//!
//! ```text
//! idle -> connecting -> connected -> disconnected -> reconnecting -> connecting ...
//!   ^_____________________ close() from any state ________________________|
//! ```

use super::SyncError;
use crate::config::ReconnectPolicy;
use crate::remote::{ChannelHandle, ChannelStatus, RealtimeEvent, RealtimeTransport, RemoteResult};
use chatsync_messaging::ConversationKey;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// Coarse status shown to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn status(self) -> ConnectionStatus {
        match self {
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Connected => ConnectionStatus::Connected,
            Self::Idle | Self::Disconnected | Self::Reconnecting => ConnectionStatus::Disconnected,
        }
    }
}

/// Deliveries from channel forwarders, subscribe calls and reconnect
/// timers to the owner.
#[derive(Debug)]
pub enum SubscriptionSignal {
    Event { channel: u64, event: RealtimeEvent },
    Subscribed {
        channel: u64,
        result: RemoteResult<ChannelHandle>,
    },
    ReconnectDue { ticket: u64 },
}

/// What the owner should do after a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// Channel acknowledged. `refetch` is false for the first connection
    /// after `open`.
    ///
    /// A reconnection yields `refetch: true` exactly once. The owner may
    /// fold it into a page-0 fetch that is still in flight; that fetch was
    /// issued after the previous connection was lost or at focus, so it
    /// already covers the gap.
    Connected { refetch: bool },
    Dropped,
    Ignored,
}

struct ActiveChannel {
    id: u64,
    handle: Option<ChannelHandle>,
    forwarder: JoinHandle<()>,
}

pub struct SubscriptionManager {
    key: ConversationKey,
    transport: Arc<dyn RealtimeTransport>,
    policy: ReconnectPolicy,
    signals: mpsc::UnboundedSender<SubscriptionSignal>,
    status_tx: watch::Sender<ConnectionStatus>,
    state: ConnectionState,
    channel: Option<ActiveChannel>,
    reconnect_timer: Option<(u64, JoinHandle<()>)>,
    next_channel: u64,
    next_ticket: u64,
    attempts: u32,
    has_connected: bool,
}

impl SubscriptionManager {
    pub fn new(
        key: ConversationKey,
        transport: Arc<dyn RealtimeTransport>,
        policy: ReconnectPolicy,
        signals: mpsc::UnboundedSender<SubscriptionSignal>,
    ) -> (Self, watch::Receiver<ConnectionStatus>) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let manager = Self {
            key,
            transport,
            policy,
            signals,
            status_tx,
            state: ConnectionState::Idle,
            channel: None,
            reconnect_timer: None,
            next_channel: 1,
            next_ticket: 1,
            attempts: 0,
            has_connected: false,
        };
        (manager, status_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether inbound rows from `channel` should be applied.
    pub fn accepts(&self, channel: u64) -> bool {
        self.state == ConnectionState::Connected && self.is_current(channel)
    }

    fn is_current(&self, channel: u64) -> bool {
        self.channel.as_ref().map(|c| c.id) == Some(channel)
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(conversation = %self.key, from = ?self.state, to = ?next, "subscription state");
            self.state = next;
            self.status_tx.send_replace(next.status());
        }
    }

    /// Open the channel. No-op while connecting or connected.
    ///
    /// Never waits on the transport: the subscribe call runs in its own task
    /// and reports back through [`SubscriptionSignal::Subscribed`].
    pub fn open(&mut self) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!(conversation = %self.key, "channel already open");
            }
            _ => {
                self.cancel_timer();
                self.connect();
            }
        }
    }

    fn connect(&mut self) {
        self.set_state(ConnectionState::Connecting);

        let id = self.next_channel;
        self.next_channel += 1;
        let (sink, mut events) = mpsc::unbounded_channel();
        let signals = self.signals.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if signals
                    .send(SubscriptionSignal::Event { channel: id, event })
                    .is_err()
                {
                    break;
                }
            }
        });
        self.channel = Some(ActiveChannel {
            id,
            handle: None,
            forwarder,
        });

        let transport = Arc::clone(&self.transport);
        let key = self.key.clone();
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let result = transport.subscribe(&key, sink).await;
            let _ = signals.send(SubscriptionSignal::Subscribed {
                channel: id,
                result,
            });
        });
    }

    /// Outcome of the subscribe call for `channel`.
    pub fn on_subscribed(&mut self, channel: u64, result: RemoteResult<ChannelHandle>) {
        if !self.is_current(channel) {
            if let Ok(handle) = result {
                debug!(conversation = %self.key, channel, "releasing late subscription");
                self.unsubscribe(handle);
            }
            return;
        }
        match result {
            Ok(handle) => {
                if let Some(active) = self.channel.as_mut() {
                    active.handle = Some(handle);
                }
            }
            Err(err) => {
                let err = SyncError::Transport(err.to_string());
                warn!(conversation = %self.key, %err, "realtime subscribe failed");
                self.drop_channel();
            }
        }
    }

    pub fn on_status(&mut self, channel: u64, status: ChannelStatus) -> StatusOutcome {
        if !self.is_current(channel) {
            debug!(conversation = %self.key, channel, ?status, "status from stale channel");
            return StatusOutcome::Ignored;
        }
        match (status, self.state) {
            (ChannelStatus::Subscribed, ConnectionState::Connecting) => {
                let refetch = self.has_connected;
                self.has_connected = true;
                self.attempts = 0;
                self.set_state(ConnectionState::Connected);
                info!(conversation = %self.key, refetch, "realtime channel connected");
                StatusOutcome::Connected { refetch }
            }
            (ChannelStatus::Subscribed, _) => StatusOutcome::Ignored,
            (_, ConnectionState::Connecting | ConnectionState::Connected) => {
                warn!(conversation = %self.key, ?status, "realtime channel dropped");
                self.drop_channel();
                StatusOutcome::Dropped
            }
            _ => StatusOutcome::Ignored,
        }
    }

    pub fn on_reconnect_due(&mut self, ticket: u64) {
        let due = matches!(self.reconnect_timer, Some((current, _)) if current == ticket);
        if !due || self.state != ConnectionState::Reconnecting {
            return;
        }
        self.reconnect_timer = None;
        self.connect();
    }

    /// Tear everything down and return to idle.
    pub fn close(&mut self) {
        self.cancel_timer();
        self.release_channel();
        self.attempts = 0;
        self.has_connected = false;
        self.set_state(ConnectionState::Idle);
    }

    fn drop_channel(&mut self) {
        self.release_channel();
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn release_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.forwarder.abort();
            if let Some(handle) = channel.handle {
                self.unsubscribe(handle);
            }
        }
    }

    fn unsubscribe(&self, handle: ChannelHandle) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move { transport.unsubscribe(handle).await });
    }

    fn schedule_reconnect(&mut self) {
        self.cancel_timer();
        let delay = self.policy.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let signals = self.signals.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(SubscriptionSignal::ReconnectDue { ticket });
        });
        self.reconnect_timer = Some((ticket, timer));
        self.set_state(ConnectionState::Reconnecting);
        debug!(
            conversation = %self.key,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
    }

    fn cancel_timer(&mut self) {
        if let Some((_, timer)) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.cancel_timer();
        if let Some(channel) = self.channel.take() {
            channel.forwarder.abort();
        }
    }
}
