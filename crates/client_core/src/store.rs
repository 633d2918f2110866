//! In-memory per-conversation state: ordered de-duplicated messages, the
//! read-only flag, the channel status label and the history cursor.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use shared::{
    domain::{ConversationId, Cursor, MessageId},
    error::ApiError,
    protocol::Message,
};
use tokio::sync::watch;

use crate::types::{ConnectionStatus, MergePosition};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub read_only: bool,
    pub status: ConnectionStatus,
    /// Boundary of the next older history page.
    pub next_cursor: Option<Cursor>,
    /// Set once any history page has been stored, so that a `None` cursor
    /// can be told apart from "never loaded".
    pub history_loaded: bool,
    /// Payload of the most recent server `error` frame.
    pub last_error: Option<ApiError>,
}

impl ConversationState {
    pub fn history_exhausted(&self) -> bool {
        self.history_loaded && self.next_cursor.is_none()
    }
}

#[derive(Default)]
struct StoreInner {
    slots: HashMap<ConversationId, watch::Sender<ConversationState>>,
    epochs: HashMap<ConversationId, u64>,
}

/// Cheaply cloneable handle to the shared store.
///
/// Writes for a conversation are expected to come only from the component that
/// owns that conversation; readers observe through [`MessageStore::subscribe`].
#[derive(Clone, Default)]
pub struct MessageStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F>(&self, conversation_id: &ConversationId, modify: F)
    where
        F: FnOnce(&mut ConversationState) -> bool,
    {
        self.update_unless(conversation_id, None, modify);
    }

    /// Applies `modify` unless `closed` is set. The flag is read under the
    /// store lock, so a write can never land after an eviction that
    /// followed the close. Returns whether `modify` ran.
    fn update_unless<F>(
        &self,
        conversation_id: &ConversationId,
        closed: Option<&AtomicBool>,
        modify: F,
    ) -> bool
    where
        F: FnOnce(&mut ConversationState) -> bool,
    {
        let mut inner = self.lock();
        if closed.is_some_and(|closed| closed.load(Ordering::Acquire)) {
            return false;
        }
        let slot = inner
            .slots
            .entry(conversation_id.clone())
            .or_insert_with(|| watch::channel(ConversationState::default()).0);
        slot.send_if_modified(modify);
        true
    }

    /// Write access for the channel that owns `conversation_id`, revoked
    /// once `closed` is set.
    pub(crate) fn channel_writer(
        &self,
        conversation_id: &ConversationId,
        closed: Arc<AtomicBool>,
    ) -> ChannelWriter {
        ChannelWriter {
            store: self.clone(),
            conversation_id: conversation_id.clone(),
            closed,
        }
    }

    pub fn merge_messages(
        &self,
        conversation_id: &ConversationId,
        incoming: Vec<Message>,
        position: MergePosition,
    ) {
        if incoming.is_empty() {
            return;
        }
        self.update(conversation_id, |state| {
            let existing = std::mem::take(&mut state.messages);
            let merged = merge_ordered(existing, incoming, position);
            state.messages = merged;
            true
        });
    }

    pub fn set_read_only(&self, conversation_id: &ConversationId, value: bool) {
        self.update(conversation_id, |state| {
            let changed = state.read_only != value;
            state.read_only = value;
            changed
        });
    }

    pub fn set_status(&self, conversation_id: &ConversationId, status: ConnectionStatus) {
        self.update(conversation_id, |state| {
            let changed = state.status != status;
            state.status = status;
            changed
        });
    }

    pub fn set_next_cursor(&self, conversation_id: &ConversationId, cursor: Option<Cursor>) {
        self.update(conversation_id, |state| {
            let changed = state.next_cursor != cursor || !state.history_loaded;
            state.next_cursor = cursor;
            state.history_loaded = true;
            changed
        });
    }

    pub fn set_last_error(&self, conversation_id: &ConversationId, error: Option<ApiError>) {
        self.update(conversation_id, |state| {
            let changed = state.last_error != error;
            state.last_error = error;
            changed
        });
    }

    pub fn snapshot(&self, conversation_id: &ConversationId) -> ConversationState {
        self.lock()
            .slots
            .get(conversation_id)
            .map(|slot| slot.borrow().clone())
            .unwrap_or_default()
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.lock()
            .slots
            .get(conversation_id)
            .map(|slot| slot.borrow().messages.clone())
            .unwrap_or_default()
    }

    pub fn status(&self, conversation_id: &ConversationId) -> ConnectionStatus {
        self.lock()
            .slots
            .get(conversation_id)
            .map(|slot| slot.borrow().status)
            .unwrap_or_default()
    }

    pub fn is_read_only(&self, conversation_id: &ConversationId) -> bool {
        self.lock()
            .slots
            .get(conversation_id)
            .is_some_and(|slot| slot.borrow().read_only)
    }

    /// Receiver notified whenever this conversation's state changes.
    pub fn subscribe(&self, conversation_id: &ConversationId) -> watch::Receiver<ConversationState> {
        let mut inner = self.lock();
        inner
            .slots
            .entry(conversation_id.clone())
            .or_insert_with(|| watch::channel(ConversationState::default()).0)
            .subscribe()
    }

    pub fn conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.lock().slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Generation counter bumped on every eviction of the conversation.
    pub fn epoch(&self, conversation_id: &ConversationId) -> u64 {
        self.lock()
            .epochs
            .get(conversation_id)
            .copied()
            .unwrap_or_default()
    }

    /// Drops everything held for the conversation. Existing subscribers see
    /// their channel close.
    pub fn evict(&self, conversation_id: &ConversationId) -> bool {
        let mut inner = self.lock();
        *inner.epochs.entry(conversation_id.clone()).or_default() += 1;
        inner.slots.remove(conversation_id).is_some()
    }
}

/// Store writes made by a connection manager.
#[derive(Clone)]
pub(crate) struct ChannelWriter {
    store: MessageStore,
    conversation_id: ConversationId,
    closed: Arc<AtomicBool>,
}

impl ChannelWriter {
    pub(crate) fn status(&self) -> ConnectionStatus {
        self.store.status(&self.conversation_id)
    }

    pub(crate) fn merge_messages(&self, incoming: Vec<Message>, position: MergePosition) -> bool {
        self.write(|state| {
            if incoming.is_empty() {
                return false;
            }
            let existing = std::mem::take(&mut state.messages);
            state.messages = merge_ordered(existing, incoming, position);
            true
        })
    }

    pub(crate) fn set_read_only(&self, value: bool) -> bool {
        self.write(|state| {
            let changed = state.read_only != value;
            state.read_only = value;
            changed
        })
    }

    pub(crate) fn set_last_error(&self, error: Option<ApiError>) -> bool {
        self.write(|state| {
            let changed = state.last_error != error;
            state.last_error = error;
            changed
        })
    }

    /// Moves to `next` if the state machine allows it. Returns the status
    /// found before the attempt and whether it moved.
    pub(crate) fn transition(&self, next: ConnectionStatus) -> (ConnectionStatus, bool) {
        let mut outcome = (self.status(), false);
        self.write(|state| {
            outcome = (state.status, state.status == next);
            if state.status == next || !state.status.can_transition_to(next) {
                return false;
            }
            state.status = next;
            outcome.1 = true;
            true
        });
        outcome
    }

    fn write<F>(&self, modify: F) -> bool
    where
        F: FnOnce(&mut ConversationState) -> bool,
    {
        self.store
            .update_unless(&self.conversation_id, Some(&self.closed), modify)
    }
}

/// Concatenates according to `position` and collapses duplicate ids.
///
/// A message keeps the slot of its first occurrence in the concatenation and
/// takes the field values of its last occurrence.
pub fn merge_ordered(
    existing: Vec<Message>,
    incoming: Vec<Message>,
    position: MergePosition,
) -> Vec<Message> {
    let (first, second) = match position {
        MergePosition::Prepend => (incoming, existing),
        MergePosition::Append => (existing, incoming),
    };

    let mut merged: Vec<Message> = Vec::with_capacity(first.len() + second.len());
    let mut slots: HashMap<MessageId, usize> = HashMap::with_capacity(merged.capacity());
    for message in first.into_iter().chain(second) {
        match slots.get(&message.id) {
            Some(&slot) => merged[slot] = message,
            None => {
                slots.insert(message.id.clone(), merged.len());
                merged.push(message);
            }
        }
    }
    merged
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
