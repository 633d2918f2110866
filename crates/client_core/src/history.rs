//! Cursor-based history pulls and the glue that prepends them into the store.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, Cursor},
    protocol::HistoryPage,
};
use tracing::debug;

use crate::{error::FetchError, store::MessageStore, types::MergePosition};

pub const MAX_PAGE_LIMIT: u32 = 100;

/// Rejects a zero limit and clamps anything above [`MAX_PAGE_LIMIT`].
pub fn page_limit(limit: u32) -> Result<u32, FetchError> {
    if limit == 0 {
        return Err(FetchError::InvalidLimit);
    }
    Ok(limit.min(MAX_PAGE_LIMIT))
}

/// One page of past messages, newest page first when `cursor` is `None`.
///
/// Implementations are stateless and perform exactly one request per call.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        cursor: Option<&Cursor>,
    ) -> Result<HistoryPage, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    Loaded { received: usize, has_more: bool },
    /// A previous page reported no older messages.
    Exhausted,
    /// The conversation was evicted while the request was in flight; the page
    /// was discarded.
    Stale,
}

pub struct HistoryBackfill {
    store: MessageStore,
    api: Arc<dyn HistoryApi>,
    page_size: u32,
}

impl HistoryBackfill {
    pub fn new(store: MessageStore, api: Arc<dyn HistoryApi>, page_size: u32) -> Self {
        Self {
            store,
            api,
            page_size,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Loads the most recent page.
    pub async fn load_latest(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<BackfillOutcome, FetchError> {
        self.load(conversation_id, None).await
    }

    /// Loads the page just older than what the store already holds.
    pub async fn load_older(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<BackfillOutcome, FetchError> {
        let state = self.store.snapshot(conversation_id);
        if state.history_exhausted() {
            return Ok(BackfillOutcome::Exhausted);
        }
        self.load(conversation_id, state.next_cursor).await
    }

    async fn load(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<Cursor>,
    ) -> Result<BackfillOutcome, FetchError> {
        let epoch = self.store.epoch(conversation_id);
        let page = self
            .api
            .fetch_history(conversation_id, self.page_size, cursor.as_ref())
            .await?;

        if self.store.epoch(conversation_id) != epoch {
            debug!(%conversation_id, "discarding history page for evicted conversation");
            return Ok(BackfillOutcome::Stale);
        }

        let received = page.items.len();
        let has_more = page.has_more();
        self.store
            .merge_messages(conversation_id, page.items, MergePosition::Prepend);
        self.store.set_next_cursor(conversation_id, page.next_cursor);
        debug!(%conversation_id, received, has_more, "history page stored");
        Ok(BackfillOutcome::Loaded { received, has_more })
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
