//! The user's list of conversations, kept live from paginated loads and
//! out-of-band bus notifications.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::Cursor,
    protocol::{RosterPage, ThreadEntry, ThreadPatch},
};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    bus::{RosterEvent, UiBus},
    error::FetchError,
    identity::Identity,
};

#[async_trait]
pub trait RosterApi: Send + Sync {
    async fn fetch_threads(
        &self,
        identity: &Identity,
        limit: u32,
        cursor: Option<&Cursor>,
    ) -> Result<RosterPage, FetchError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterState {
    pub items: Vec<ThreadEntry>,
    pub next_cursor: Option<Cursor>,
    pub loaded: bool,
}

impl RosterState {
    pub fn has_more(&self) -> bool {
        !self.loaded || self.next_cursor.is_some()
    }
}

#[derive(Clone)]
pub struct ThreadRoster {
    api: Arc<dyn RosterApi>,
    state: Arc<watch::Sender<RosterState>>,
}

impl ThreadRoster {
    pub fn new(api: Arc<dyn RosterApi>) -> Self {
        let (state, _) = watch::channel(RosterState::default());
        Self {
            api,
            state: Arc::new(state),
        }
    }

    pub fn snapshot(&self) -> RosterState {
        self.state.borrow().clone()
    }

    pub fn items(&self) -> Vec<ThreadEntry> {
        self.state.borrow().items.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RosterState> {
        self.state.subscribe()
    }

    /// Without a cursor the loaded page replaces the list; with one it is
    /// appended. A failed request leaves the roster untouched.
    pub async fn load_page(
        &self,
        identity: &Identity,
        limit: u32,
        cursor: Option<Cursor>,
    ) -> Result<RosterPage, FetchError> {
        let page = self
            .api
            .fetch_threads(identity, limit, cursor.as_ref())
            .await?;

        let replace = cursor.is_none();
        self.state.send_modify(|state| {
            if replace {
                state.items.clear();
            }
            for entry in page.items.iter().cloned() {
                upsert(&mut state.items, entry);
            }
            state.next_cursor = page.next_cursor.clone();
            state.loaded = true;
        });
        debug!(
            received = page.items.len(),
            replace,
            has_more = page.has_more(),
            "roster page applied"
        );
        Ok(page)
    }

    /// Follows the stored cursor. Returns `None` once the backend reported the
    /// last page.
    pub async fn load_next_page(
        &self,
        identity: &Identity,
        limit: u32,
    ) -> Result<Option<RosterPage>, FetchError> {
        let (loaded, cursor) = {
            let state = self.state.borrow();
            (state.loaded, state.next_cursor.clone())
        };
        match (loaded, cursor) {
            (false, _) => self.load_page(identity, limit, None).await.map(Some),
            (true, Some(cursor)) => self.load_page(identity, limit, Some(cursor)).await.map(Some),
            (true, None) => Ok(None),
        }
    }

    /// Inserts at the front unless the id is already present.
    pub fn apply_created(&self, entry: ThreadEntry) -> bool {
        self.state.send_if_modified(|state| {
            if state.items.iter().any(|existing| existing.id == entry.id) {
                return false;
            }
            state.items.insert(0, entry);
            true
        })
    }

    /// Shallow-merges into the matching entry. Unknown ids are ignored.
    pub fn apply_updated(&self, patch: &ThreadPatch) -> bool {
        self.state.send_if_modified(|state| {
            let Some(entry) = state.items.iter_mut().find(|entry| entry.id == patch.id) else {
                return false;
            };
            let before = entry.clone();
            patch.apply_to(entry);
            *entry != before
        })
    }

    pub fn apply(&self, event: RosterEvent) -> bool {
        match event {
            RosterEvent::Created(entry) => self.apply_created(entry),
            RosterEvent::Updated(patch) => self.apply_updated(&patch),
        }
    }

    /// Applies bus notifications until the bus is dropped.
    pub fn attach(&self, bus: &UiBus) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        let roster = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        roster.apply(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "roster listener lagged behind the bus; a reload will resync");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn upsert(items: &mut Vec<ThreadEntry>, entry: ThreadEntry) {
    match items.iter_mut().find(|existing| existing.id == entry.id) {
        Some(existing) => *existing = entry,
        None => items.push(entry),
    }
}

#[cfg(test)]
#[path = "tests/roster_tests.rs"]
mod tests;
