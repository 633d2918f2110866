//! One persistent channel per conversation: lifecycle, reconnection with
//! exponential back-off, inbound frame handling and outbound sends.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use shared::{
    domain::ConversationId,
    protocol::{ChannelFrame, OutboundFrame},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    identity::Identity,
    rest::endpoint,
    store::{ChannelWriter, ConversationState, MessageStore},
    transport::{Transport, TransportConnection, TransportEvent},
    types::{ConnectionStatus, MergePosition, SendOutcome},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Reconnection attempts allowed in one failure streak before giving up.
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_retries: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before scheduling retry number `retries + 1` of the current
    /// failure streak: `base * 2^retries`, capped at `max_delay`.
    ///
    /// `retries` counts reconnections already scheduled, not failed attempts,
    /// so the first retry after the initial failure waits exactly `base`.
    pub fn delay_for(&self, retries: u32) -> Duration {
        2u32.checked_pow(retries)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Builds `ws(s)://…/conversations/{id}/ws` carrying the caller's identity.
pub fn channel_url(
    server_url: &Url,
    conversation_id: &ConversationId,
    identity: &Identity,
) -> Result<Url> {
    let mut url = endpoint(server_url, &["conversations", conversation_id.as_str(), "ws"])?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(anyhow!("server_url must use http(s) or ws(s), got {other}://")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch {server_url} to {scheme}://"))?;
    let (key, value) = identity.channel_query();
    url.query_pairs_mut().append_pair(key, value);
    Ok(url)
}

enum Command {
    Send {
        body: String,
        reply: oneshot::Sender<SendOutcome>,
    },
}

enum ChannelEnd {
    Closed,
    Failed(String),
    Shutdown,
}

pub struct ConnectionManager {
    conversation_id: ConversationId,
    url: Url,
    transport: Arc<dyn Transport>,
    writer: ChannelWriter,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    retries: u32,
}

impl ConnectionManager {
    /// Starts the channel task and returns the handle that owns it.
    pub fn spawn(
        conversation_id: ConversationId,
        url: Url,
        transport: Arc<dyn Transport>,
        store: MessageStore,
        policy: ReconnectPolicy,
    ) -> ConnectionHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let manager = Self {
            conversation_id: conversation_id.clone(),
            url,
            transport,
            writer: store.channel_writer(&conversation_id, Arc::clone(&closed)),
            policy,
            commands,
            retries: 0,
        };
        let task = tokio::spawn(manager.run());
        ConnectionHandle {
            sender: ChannelSender {
                conversation_id,
                store,
                commands: commands_tx,
            },
            closed,
            task,
        }
    }

    async fn run(mut self) {
        loop {
            self.transition(ConnectionStatus::Connecting);
            match self.transport.open(&self.url).await {
                Ok(mut connection) => {
                    info!(conversation_id = %self.conversation_id, "channel open");
                    self.retries = 0;
                    self.writer.set_last_error(None);
                    self.transition(ConnectionStatus::Open);
                    let end = self.pump(connection.as_mut()).await;
                    self.drop_pending_sends();
                    match end {
                        ChannelEnd::Closed => {
                            info!(conversation_id = %self.conversation_id, "channel closed by peer");
                            self.transition(ConnectionStatus::Closed);
                        }
                        ChannelEnd::Failed(reason) => {
                            warn!(conversation_id = %self.conversation_id, %reason, "channel failed");
                            self.transition(ConnectionStatus::Error);
                        }
                        ChannelEnd::Shutdown => return,
                    }
                }
                Err(err) => {
                    warn!(
                        conversation_id = %self.conversation_id,
                        attempt = self.retries,
                        error = %err,
                        "channel open failed"
                    );
                    self.transition(ConnectionStatus::Error);
                }
            }

            if self.retries >= self.policy.max_retries {
                error!(
                    conversation_id = %self.conversation_id,
                    retries = self.retries,
                    "reconnection budget exhausted; giving up"
                );
                self.transition(ConnectionStatus::Error);
                return;
            }

            let delay = self.policy.delay_for(self.retries);
            self.retries += 1;
            info!(
                conversation_id = %self.conversation_id,
                attempt = self.retries,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            if !self.back_off(delay).await {
                return;
            }
        }
    }

    async fn pump(&mut self, connection: &mut dyn TransportConnection) -> ChannelEnd {
        loop {
            tokio::select! {
                event = connection.next_event() => match event {
                    TransportEvent::Frame(text) => self.handle_frame(&text),
                    TransportEvent::Closed => return ChannelEnd::Closed,
                    TransportEvent::Failed(reason) => return ChannelEnd::Failed(reason),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send { body, reply }) => {
                        if !self.writer.status().is_open() {
                            let _ = reply.send(SendOutcome::Dropped);
                            continue;
                        }
                        let frame = OutboundFrame::MessageNew { content: body };
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                error!(error = %err, "failed to encode outbound frame");
                                let _ = reply.send(SendOutcome::Dropped);
                                continue;
                            }
                        };
                        if let Err(err) = connection.send_text(text).await {
                            let _ = reply.send(SendOutcome::Dropped);
                            return ChannelEnd::Failed(err.to_string());
                        }
                        let _ = reply.send(SendOutcome::Delivered);
                    }
                    None => {
                        connection.close().await;
                        return ChannelEnd::Shutdown;
                    }
                },
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let frame = match serde_json::from_str::<ChannelFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    error = %err,
                    "dropping malformed channel frame"
                );
                return;
            }
        };

        match frame {
            ChannelFrame::StateSync(sync) => {
                debug!(conversation_id = %self.conversation_id, read_only = sync.read_only, "state sync");
                self.writer.set_read_only(sync.read_only);
            }
            ChannelFrame::MessageCreated(message) => {
                if message.conversation_id != self.conversation_id {
                    warn!(
                        conversation_id = %self.conversation_id,
                        foreign = %message.conversation_id,
                        "dropping message addressed to another conversation"
                    );
                    return;
                }
                self.writer
                    .merge_messages(vec![message], MergePosition::Append);
            }
            ChannelFrame::Error(api_error) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    code = ?api_error.code,
                    message = %api_error.message,
                    "server reported channel error"
                );
                self.writer.set_last_error(Some(api_error));
                self.transition(ConnectionStatus::Error);
            }
        }
    }

    /// Sleeps out the back-off while refusing sends. Returns `false` if the
    /// handle went away in the meantime.
    async fn back_off(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(SendOutcome::Dropped);
                    }
                    None => return false,
                },
            }
        }
    }

    fn drop_pending_sends(&mut self) {
        while let Ok(Command::Send { reply, .. }) = self.commands.try_recv() {
            let _ = reply.send(SendOutcome::Dropped);
        }
    }

    fn transition(&self, next: ConnectionStatus) -> bool {
        let (current, moved) = self.writer.transition(next);
        if moved {
            debug!(conversation_id = %self.conversation_id, from = %current, to = %next, "status change");
        } else if current != next {
            debug!(
                conversation_id = %self.conversation_id,
                from = %current,
                to = %next,
                "ignoring status transition"
            );
        }
        moved
    }
}

/// Cloneable write side of a channel. Sending never holds anything that
/// [`ConnectionHandle::close`] needs.
#[derive(Clone)]
pub struct ChannelSender {
    conversation_id: ConversationId,
    store: MessageStore,
    commands: mpsc::UnboundedSender<Command>,
}

impl ChannelSender {
    /// Writes one message to the channel. While the channel is not open this
    /// is a no-op returning [`SendOutcome::Dropped`]; nothing is queued.
    pub async fn send(&self, body: impl Into<String>) -> SendOutcome {
        if !self.store.status(&self.conversation_id).is_open() {
            debug!(conversation_id = %self.conversation_id, "send while channel not open; dropped");
            return SendOutcome::Dropped;
        }
        let (reply, outcome) = oneshot::channel();
        let command = Command::Send {
            body: body.into(),
            reply,
        };
        if self.commands.send(command).is_err() {
            return SendOutcome::Dropped;
        }
        outcome.await.unwrap_or(SendOutcome::Dropped)
    }
}

/// Owner of a running channel. Dropping it closes the channel.
pub struct ConnectionHandle {
    sender: ChannelSender,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.sender.conversation_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.sender.store.status(self.conversation_id())
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.sender.store.subscribe(self.conversation_id())
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub async fn send(&self, body: impl Into<String>) -> SendOutcome {
        self.sender.send(body).await
    }

    /// True once the task stopped, either closed or out of retries.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the reconnection timer and tears down the transport immediately.
    /// From here on the manager can no longer write to the store.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task.abort();
        if matches!(
            self.status(),
            ConnectionStatus::Connecting | ConnectionStatus::Open
        ) {
            self.sender
                .store
                .set_status(self.conversation_id(), ConnectionStatus::Closed);
        }
        debug!(conversation_id = %self.conversation_id(), "channel closed by owner");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
