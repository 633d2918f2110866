use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use shared::{domain::ConversationId, protocol::RosterPage};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info};
use url::Url;

pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod identity;
pub mod rest;
pub mod roster;
pub mod store;
pub mod transport;
pub mod types;

pub use bus::{RosterEvent, UiBus};
pub use config::{load_settings, SyncSettings};
pub use connection::{
    channel_url, ChannelSender, ConnectionHandle, ConnectionManager, ReconnectPolicy,
};
pub use error::{FetchError, TransportError};
pub use history::{BackfillOutcome, HistoryApi, HistoryBackfill};
pub use identity::{Identity, IdentityProvider, StaticIdentity};
pub use rest::RestClient;
pub use roster::{RosterApi, RosterState, ThreadRoster};
pub use store::{ConversationState, MessageStore};
pub use transport::{Transport, TransportConnection, TransportEvent, WebSocketTransport};
pub use types::{ConnectionStatus, MergePosition, SendOutcome};

/// Everything a [`SyncEngine`] is assembled from.
pub struct EngineParts {
    pub server_url: Url,
    pub identity: Arc<dyn IdentityProvider>,
    pub history: Arc<dyn HistoryApi>,
    pub roster: Arc<dyn RosterApi>,
    pub transport: Arc<dyn Transport>,
    pub bus: UiBus,
    pub policy: ReconnectPolicy,
    pub history_page_size: u32,
    pub roster_page_size: u32,
}

/// Client-side sync for one signed-in (or guest) user: the message store,
/// one channel per open conversation, history backfill and the thread roster.
pub struct SyncEngine {
    server_url: Url,
    identity: Arc<dyn IdentityProvider>,
    store: MessageStore,
    backfill: HistoryBackfill,
    roster: ThreadRoster,
    transport: Arc<dyn Transport>,
    bus: UiBus,
    policy: ReconnectPolicy,
    roster_page_size: u32,
    connections: Mutex<HashMap<ConversationId, ConnectionHandle>>,
    roster_listener: JoinHandle<()>,
}

impl SyncEngine {
    /// Must be called inside a tokio runtime; the roster starts listening on
    /// the bus immediately.
    pub fn new(parts: EngineParts) -> Arc<Self> {
        let store = MessageStore::new();
        let roster = ThreadRoster::new(parts.roster);
        let roster_listener = roster.attach(&parts.bus);
        Arc::new(Self {
            server_url: parts.server_url,
            identity: parts.identity,
            backfill: HistoryBackfill::new(store.clone(), parts.history, parts.history_page_size),
            store,
            roster,
            transport: parts.transport,
            bus: parts.bus,
            policy: parts.policy,
            roster_page_size: parts.roster_page_size,
            connections: Mutex::new(HashMap::new()),
            roster_listener,
        })
    }

    /// Wires the REST client and the WebSocket transport from settings.
    pub fn from_settings(settings: &SyncSettings) -> Result<Arc<Self>> {
        let identity: Arc<dyn IdentityProvider> = Arc::new(StaticIdentity(settings.identity()));
        let rest = Arc::new(
            RestClient::new(&settings.server_url, Arc::clone(&identity))
                .with_context(|| format!("invalid server url {}", settings.server_url))?,
        );
        Ok(Self::new(EngineParts {
            server_url: rest.server_url().clone(),
            identity,
            history: rest.clone(),
            roster: rest,
            transport: Arc::new(WebSocketTransport),
            bus: UiBus::default(),
            policy: settings.reconnect_policy(),
            history_page_size: settings.history_page_size,
            roster_page_size: settings.roster_page_size,
        }))
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn roster(&self) -> &ThreadRoster {
        &self.roster
    }

    pub fn bus(&self) -> &UiBus {
        &self.bus
    }

    pub fn identity(&self) -> Identity {
        self.identity.identity()
    }

    pub fn status(&self, conversation_id: &ConversationId) -> ConnectionStatus {
        self.store.status(conversation_id)
    }

    pub fn subscribe(&self, conversation_id: &ConversationId) -> watch::Receiver<ConversationState> {
        self.store.subscribe(conversation_id)
    }

    /// Starts the conversation's channel and pulls its latest history page.
    ///
    /// Returns `Ok(false)` when a live channel already exists; nothing is
    /// reloaded in that case. A channel that gave up reconnecting is replaced.
    /// If the history pull fails the channel keeps running and the error is
    /// returned; [`SyncEngine::load_older`] retries from the newest page.
    pub async fn open_conversation(&self, conversation_id: &ConversationId) -> Result<bool> {
        {
            let mut connections = self.connections.lock().await;
            if connections
                .get(conversation_id)
                .is_some_and(|handle| !handle.is_finished())
            {
                debug!(%conversation_id, "conversation already open");
                return Ok(false);
            }
            if let Some(mut stale) = connections.remove(conversation_id) {
                stale.close();
            }
            let url = channel_url(&self.server_url, conversation_id, &self.identity())?;
            let handle = ConnectionManager::spawn(
                conversation_id.clone(),
                url,
                Arc::clone(&self.transport),
                self.store.clone(),
                self.policy,
            );
            connections.insert(conversation_id.clone(), handle);
        }
        info!(%conversation_id, "conversation opened");

        self.backfill
            .load_latest(conversation_id)
            .await
            .with_context(|| format!("failed to load history for {conversation_id}"))?;
        Ok(true)
    }

    /// Stops the channel. Stored messages stay readable.
    pub async fn close_conversation(&self, conversation_id: &ConversationId) -> bool {
        let handle = self.connections.lock().await.remove(conversation_id);
        match handle {
            Some(mut handle) => {
                handle.close();
                info!(%conversation_id, "conversation closed");
                true
            }
            None => false,
        }
    }

    /// Closes the channel and forgets everything stored for the conversation.
    /// History pages still in flight are discarded when they land.
    pub async fn evict_conversation(&self, conversation_id: &ConversationId) {
        self.close_conversation(conversation_id).await;
        self.store.evict(conversation_id);
    }

    pub async fn send(&self, conversation_id: &ConversationId, body: impl Into<String>) -> SendOutcome {
        let sender = self
            .connections
            .lock()
            .await
            .get(conversation_id)
            .map(ConnectionHandle::sender);
        match sender {
            Some(sender) => sender.send(body).await,
            None => {
                debug!(%conversation_id, "send for conversation without a channel; dropped");
                SendOutcome::Dropped
            }
        }
    }

    pub async fn load_older(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<BackfillOutcome, FetchError> {
        self.backfill.load_older(conversation_id).await
    }

    /// Reloads the roster from its first page.
    pub async fn load_threads(&self) -> Result<RosterPage, FetchError> {
        self.roster
            .load_page(&self.identity(), self.roster_page_size, None)
            .await
    }

    pub async fn load_more_threads(&self) -> Result<Option<RosterPage>, FetchError> {
        self.roster
            .load_next_page(&self.identity(), self.roster_page_size)
            .await
    }

    pub async fn open_conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.connections.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Closes every channel and stops listening on the bus.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.connections.lock().await.drain().collect();
        for (_, mut handle) in handles {
            handle.close();
        }
        self.roster_listener.abort();
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.roster_listener.abort();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
