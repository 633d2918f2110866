use super::*;
use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use shared::{
    domain::{MessageId, ParticipantId, Role, SenderRef},
    error::{ApiError, ErrorCode},
    protocol::Message,
};

fn message(id: &str) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from("c-1"),
        sender: SenderRef {
            id: ParticipantId::from("u-1"),
            role: Role::Customer,
        },
        body: format!("body {id}"),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().expect("timestamp"),
    }
}

fn page(ids: &[&str], next: Option<&str>) -> HistoryPage {
    HistoryPage {
        items: ids.iter().map(|id| message(id)).collect(),
        next_cursor: next.map(Cursor::from),
    }
}

#[derive(Default)]
struct FakeHistory {
    pages: Mutex<Vec<HistoryPage>>,
    calls: Mutex<Vec<(u32, Option<String>)>>,
    fail: bool,
    evict_during_fetch: Option<MessageStore>,
}

#[async_trait]
impl HistoryApi for FakeHistory {
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        cursor: Option<&Cursor>,
    ) -> Result<HistoryPage, FetchError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((limit, cursor.map(|c| c.as_str().to_string())));
        if let Some(store) = &self.evict_during_fetch {
            store.evict(conversation_id);
        }
        if self.fail {
            return Err(FetchError::Rejected {
                status: 404,
                source: ApiError::new(ErrorCode::NotFound, "no such conversation").into(),
            });
        }
        let mut pages = self.pages.lock().expect("pages lock");
        Ok(if pages.is_empty() {
            page(&[], None)
        } else {
            pages.remove(0)
        })
    }
}

fn ids(store: &MessageStore, conversation_id: &ConversationId) -> Vec<String> {
    store
        .messages(conversation_id)
        .into_iter()
        .map(|m| m.id.0)
        .collect()
}

#[test]
fn page_limit_rejects_zero_and_clamps() {
    assert!(matches!(page_limit(0), Err(FetchError::InvalidLimit)));
    assert_eq!(page_limit(1).expect("limit"), 1);
    assert_eq!(page_limit(50).expect("limit"), 50);
    assert_eq!(page_limit(5_000).expect("limit"), MAX_PAGE_LIMIT);
}

#[tokio::test]
async fn older_pages_follow_the_cursor_and_prepend() {
    let conversation = ConversationId::from("c-1");
    let store = MessageStore::new();
    let api = Arc::new(FakeHistory {
        pages: Mutex::new(vec![page(&["c", "d"], Some("cur-1")), page(&["a", "b"], None)]),
        ..FakeHistory::default()
    });
    let backfill = HistoryBackfill::new(store.clone(), api.clone(), 2);

    let first = backfill.load_latest(&conversation).await.expect("latest");
    assert_eq!(
        first,
        BackfillOutcome::Loaded {
            received: 2,
            has_more: true
        }
    );
    assert_eq!(ids(&store, &conversation), ["c", "d"]);

    let second = backfill.load_older(&conversation).await.expect("older");
    assert_eq!(
        second,
        BackfillOutcome::Loaded {
            received: 2,
            has_more: false
        }
    );
    assert_eq!(ids(&store, &conversation), ["a", "b", "c", "d"]);

    assert_eq!(
        backfill.load_older(&conversation).await.expect("exhausted"),
        BackfillOutcome::Exhausted
    );

    let calls = api.calls.lock().expect("calls").clone();
    assert_eq!(
        calls,
        vec![(2, None), (2, Some("cur-1".to_string()))],
        "no request once history is exhausted"
    );
}

#[tokio::test]
async fn history_overlapping_live_messages_is_not_duplicated() {
    let conversation = ConversationId::from("c-1");
    let store = MessageStore::new();
    store.merge_messages(&conversation, vec![message("b"), message("c")], MergePosition::Append);
    let api = Arc::new(FakeHistory {
        pages: Mutex::new(vec![page(&["a", "b"], None)]),
        ..FakeHistory::default()
    });
    let backfill = HistoryBackfill::new(store.clone(), api, 20);

    backfill.load_latest(&conversation).await.expect("latest");
    assert_eq!(ids(&store, &conversation), ["a", "b", "c"]);
}

#[tokio::test]
async fn failed_fetch_leaves_store_untouched() {
    let conversation = ConversationId::from("c-1");
    let store = MessageStore::new();
    store.merge_messages(&conversation, vec![message("z")], MergePosition::Append);
    let api = Arc::new(FakeHistory {
        fail: true,
        ..FakeHistory::default()
    });
    let backfill = HistoryBackfill::new(store.clone(), api, 20);

    let err = backfill.load_latest(&conversation).await.expect_err("rejected");
    assert_eq!(err.status(), Some(404));
    let state = store.snapshot(&conversation);
    assert_eq!(ids(&store, &conversation), ["z"]);
    assert!(!state.history_loaded);
}

#[tokio::test]
async fn page_for_evicted_conversation_is_discarded() {
    let conversation = ConversationId::from("c-1");
    let store = MessageStore::new();
    let api = Arc::new(FakeHistory {
        pages: Mutex::new(vec![page(&["a"], Some("cur-1"))]),
        evict_during_fetch: Some(store.clone()),
        ..FakeHistory::default()
    });
    let backfill = HistoryBackfill::new(store.clone(), api, 20);

    let outcome = backfill.load_latest(&conversation).await.expect("fetch");
    assert_eq!(outcome, BackfillOutcome::Stale);
    assert!(store.messages(&conversation).is_empty());
    assert!(!store.snapshot(&conversation).history_loaded);
}
