use super::*;
use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::ConversationId,
    error::{ApiError, ErrorCode},
};
use tokio::sync::Mutex;

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0)
        .single()
        .expect("timestamp")
}

fn entry(id: &str, title: Option<&str>) -> ThreadEntry {
    ThreadEntry {
        id: ConversationId::from(id),
        title: title.map(str::to_string),
        updated_at: at(8),
    }
}

fn page(ids: &[&str], next: Option<&str>) -> RosterPage {
    RosterPage {
        items: ids.iter().map(|id| entry(id, Some(id))).collect(),
        next_cursor: next.map(Cursor::from),
    }
}

/// Serves pages keyed by cursor (`""` for the first page).
#[derive(Default)]
struct FakeRoster {
    pages: HashMap<String, RosterPage>,
    fail: bool,
    calls: Mutex<Vec<(Identity, u32, Option<Cursor>)>>,
}

#[async_trait]
impl RosterApi for FakeRoster {
    async fn fetch_threads(
        &self,
        identity: &Identity,
        limit: u32,
        cursor: Option<&Cursor>,
    ) -> Result<RosterPage, FetchError> {
        self.calls
            .lock()
            .await
            .push((identity.clone(), limit, cursor.cloned()));
        if self.fail {
            return Err(FetchError::Rejected {
                status: 401,
                source: ApiError::new(ErrorCode::Unauthorized, "expired").into(),
            });
        }
        let key = cursor.map(|c| c.as_str().to_string()).unwrap_or_default();
        Ok(self.pages.get(&key).cloned().unwrap_or_else(|| page(&[], None)))
    }
}

fn roster_with(pages: Vec<(&str, RosterPage)>) -> (ThreadRoster, Arc<FakeRoster>) {
    let api = Arc::new(FakeRoster {
        pages: pages
            .into_iter()
            .map(|(cursor, page)| (cursor.to_string(), page))
            .collect(),
        ..FakeRoster::default()
    });
    (ThreadRoster::new(api.clone()), api)
}

fn ids(roster: &ThreadRoster) -> Vec<String> {
    roster.items().into_iter().map(|e| e.id.0).collect()
}

#[tokio::test]
async fn first_page_replaces_and_cursor_pages_append() {
    let (roster, api) = roster_with(vec![
        ("", page(&["t-1", "t-2"], Some("p2"))),
        ("p2", page(&["t-2", "t-3"], None)),
    ]);
    let guest = Identity::guest("g-1");
    roster.apply_created(entry("stale", None));

    let first = roster.load_page(&guest, 2, None).await.expect("first page");
    assert!(first.has_more());
    assert_eq!(ids(&roster), ["t-1", "t-2"]);

    let next = roster
        .load_next_page(&guest, 2)
        .await
        .expect("next page")
        .expect("more pages");
    assert!(!next.has_more());
    assert_eq!(ids(&roster), ["t-1", "t-2", "t-3"]);
    assert!(!roster.snapshot().has_more());

    assert!(roster.load_next_page(&guest, 2).await.expect("done").is_none());

    let calls = api.calls.lock().await.clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], (guest.clone(), 2, None));
    assert_eq!(calls[1], (guest, 2, Some(Cursor::from("p2"))));
}

#[tokio::test]
async fn reload_without_cursor_starts_over() {
    let (roster, _api) = roster_with(vec![("", page(&["t-9"], None))]);
    let user = Identity::user("tok");
    roster.apply_created(entry("t-1", None));
    roster.apply_created(entry("t-2", None));

    roster.load_page(&user, 20, None).await.expect("reload");
    assert_eq!(ids(&roster), ["t-9"]);
}

#[tokio::test]
async fn failed_load_leaves_roster_untouched() {
    let api = Arc::new(FakeRoster {
        fail: true,
        ..FakeRoster::default()
    });
    let roster = ThreadRoster::new(api);
    roster.apply_created(entry("t-1", None));
    let before = roster.snapshot();

    let err = roster
        .load_page(&Identity::guest("g-1"), 20, None)
        .await
        .expect_err("unauthorized");
    assert_eq!(err.status(), Some(401));
    assert_eq!(roster.snapshot(), before);
}

#[test]
fn created_thread_goes_to_front_once() {
    let roster = ThreadRoster::new(Arc::new(FakeRoster::default()));
    assert!(roster.apply_created(entry("t-1", Some("old"))));
    assert!(roster.apply_created(entry("t-2", Some("new"))));
    assert!(!roster.apply_created(entry("t-1", Some("again"))));

    assert_eq!(ids(&roster), ["t-2", "t-1"]);
    assert_eq!(roster.items()[1].title.as_deref(), Some("old"));
}

#[test]
fn update_patches_known_threads_and_ignores_unknown() {
    let roster = ThreadRoster::new(Arc::new(FakeRoster::default()));
    roster.apply_created(entry("t-1", Some("Visa")));
    let mut rx = roster.subscribe();
    rx.borrow_and_update();

    assert!(!roster.apply_updated(&ThreadPatch::new("ghost").with_title(Some("boo".into()))));
    assert!(!rx.has_changed().expect("roster alive"));
    assert_eq!(ids(&roster), ["t-1"]);

    assert!(roster.apply_updated(&ThreadPatch::new("t-1").with_updated_at(at(11))));
    let updated = roster.items()[0].clone();
    assert_eq!(updated.title.as_deref(), Some("Visa"));
    assert_eq!(updated.updated_at, at(11));

    assert!(roster.apply_updated(&ThreadPatch::new("t-1").with_title(None)));
    assert_eq!(roster.items()[0].title, None);
    assert!(!roster.apply_updated(&ThreadPatch::new("t-1").with_title(None)));
}

#[tokio::test]
async fn attached_roster_follows_bus_notifications() {
    let roster = ThreadRoster::new(Arc::new(FakeRoster::default()));
    let bus = UiBus::default();
    let listener = roster.attach(&bus);
    let mut rx = roster.subscribe();

    assert_eq!(bus.thread_created(entry("t-1", Some("Visa"))), 1);
    bus.thread_updated(ThreadPatch::new("t-1").with_title(Some("Visa renewal".into())));
    bus.thread_updated(ThreadPatch::new("ghost").with_title(Some("nope".into())));

    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|state| {
            state
                .items
                .first()
                .is_some_and(|e| e.title.as_deref() == Some("Visa renewal"))
        }),
    )
    .await
    .expect("update applied in time")
    .expect("roster alive");
    assert_eq!(ids(&roster), ["t-1"]);

    drop(bus);
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .expect("listener stops with the bus")
        .expect("listener did not panic");
}
