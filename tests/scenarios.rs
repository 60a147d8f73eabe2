// Integration tests for end-to-end consumer scenarios: several consumers
// sharing a key, failing refreshes, background revalidation and logout.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use humidor::{Query, QueryCache, QueryError, QueryOptions, QueryStore, query_key};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct User {
    id: u32,
    name: String,
}

fn user(id: u32, name: &str) -> User {
    User {
        id,
        name: name.to_string(),
    }
}

/// Key function for user 42 whose fetches block on `gate`.
fn gated_user_query(
    gate: Arc<Notify>,
    calls: Arc<AtomicUsize>,
    name: &'static str,
) -> impl Fn() -> QueryOptions<User> + Send + Sync + 'static {
    move || {
        let gate = Arc::clone(&gate);
        let calls = Arc::clone(&calls);
        QueryOptions::new(query_key!["user", "42"], move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                gate.notified().await;
                Ok(user(42, name))
            })
        })
    }
}

#[tokio::test]
async fn concurrent_consumers_share_one_fetch() {
    let cache = QueryCache::new();
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = tokio::spawn(Query::new(
        cache.clone(),
        gated_user_query(Arc::clone(&gate), Arc::clone(&calls), "from first"),
    ));
    let second = tokio::spawn(Query::new(
        cache.clone(),
        gated_user_query(Arc::clone(&gate), Arc::clone(&calls), "from second"),
    ));
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert_eq!(cache.ref_count(&query_key!["user", "42"]), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    gate.notify_one();
    let first = first.await.expect("no panic").expect("bound");
    let second = second.await.expect("no panic").expect("bound");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.data().expect("bound"), second.data().expect("bound"));
    assert_eq!(first.data().expect("bound"), Some(user(42, "from first")));
}

#[tokio::test]
async fn failed_refetch_keeps_previous_data() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = QueryStore::new({
        let calls = Arc::clone(&calls);
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if call == 0 {
                    Ok(user(1, "ana"))
                } else {
                    Err(QueryError::network("connection reset"))
                }
            })
        }
    });
    store.fetch(false).await.expect("first fetch");
    let fetched_at = store.last_fetched_at();

    let result = store.refetch().await;

    assert_eq!(result, Err(QueryError::network("connection reset")));
    assert_eq!(store.data(), Some(user(1, "ana")));
    assert_eq!(store.error(), Some(QueryError::network("connection reset")));
    assert!(!store.is_loading());
    assert_eq!(store.last_fetched_at(), fetched_at);
}

#[tokio::test]
async fn background_refresh_never_shows_loading() {
    let cache = QueryCache::new();
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["user", "me"];

    let store = cache
        .get_or_create(&key, || {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            QueryStore::new(move || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                let gate = Arc::clone(&gate);
                Box::pin(async move {
                    if call > 0 {
                        gate.notified().await;
                    }
                    Ok(user(7, if call == 0 { "old name" } else { "new name" }))
                })
            })
        })
        .expect("acquire");
    store.fetch(false).await.expect("initial fetch");

    let mut states = store.subscribe();
    let refresh = tokio::spawn({
        let cache = cache.clone();
        async move { cache.refresh_active_queries().await }
    });
    tokio::task::yield_now().await;

    assert!(store.is_fetching());
    assert!(!store.is_loading());
    assert_eq!(store.data(), Some(user(7, "old name")));

    gate.notify_one();
    assert_eq!(refresh.await.expect("no panic"), 1);

    assert!(states.has_changed().expect("store alive"));
    let latest = states.borrow_and_update().clone();
    assert!(!latest.loading);
    assert_eq!(latest.data, Some(user(7, "new name")));
    assert!(!store.is_stale());
}

#[tokio::test]
async fn refresh_only_invalidates_unused_entries() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["user", "former"];
    let store = cache
        .get_or_create(&key, || {
            let calls = Arc::clone(&calls);
            QueryStore::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(user(3, "li")) })
            })
        })
        .expect("acquire");
    store.fetch(false).await.expect("fetch");
    cache.decrement_ref(&key);

    assert_eq!(cache.refresh_active_queries().await, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(store.is_stale());
}

#[tokio::test]
async fn clear_on_logout_keeps_entries() {
    let cache = QueryCache::new();
    let profile = cache
        .get_or_create(&query_key!["user", "me"], || {
            QueryStore::new(|| Box::pin(async { Ok(user(1, "ana")) }))
        })
        .expect("acquire");
    let clubs = cache
        .get_or_create(&query_key!["clubs", "mine"], || {
            QueryStore::new(|| Box::pin(async { Ok(vec![1_u32, 2, 3]) }))
        })
        .expect("acquire");
    let unread = cache
        .get_or_create(&query_key!["notifications", "unread"], || {
            QueryStore::new(|| Box::pin(async { Ok(4_usize) }))
        })
        .expect("acquire");
    profile.fetch(false).await.expect("fetch");
    clubs.fetch(false).await.expect("fetch");
    unread.fetch(false).await.expect("fetch");

    cache.clear();

    assert_eq!(cache.len(), 3);
    assert_eq!(profile.data(), None);
    assert_eq!(clubs.data(), None);
    assert_eq!(unread.data(), None);
    assert!(profile.is_stale());
    assert!(clubs.is_stale());
    assert!(unread.is_stale());

    unread.fetch(false).await.expect("refetch after login");
    assert_eq!(unread.data(), Some(4));
}

#[tokio::test]
async fn switching_keys_moves_the_reference() {
    let cache = QueryCache::new();
    let (user_id, user_rx) = watch::channel(1_u32);

    let query = Arc::new(
        Query::new(cache.clone(), move || {
            let id = *user_rx.borrow();
            QueryOptions::new(query_key!["user", id], move || {
                Box::pin(async move { Ok(user(id, "someone")) })
            })
        })
        .await
        .expect("bound"),
    );
    let follow = query.follow(user_id.subscribe());

    user_id.send_replace(2);
    let mut states = query.watch();
    while let Some(state) = states.next().await {
        if state.data.as_ref().is_some_and(|u| u.id == 2) {
            break;
        }
    }

    assert_eq!(query.key().expect("bound"), query_key!["user", 2]);
    assert_eq!(cache.ref_count(&query_key!["user", 1]), Some(0));
    assert_eq!(cache.ref_count(&query_key!["user", 2]), Some(1));

    follow.cancel().await;
    drop(states);
    drop(query);
    assert_eq!(cache.ref_count(&query_key!["user", 2]), Some(0));
}

#[tokio::test]
async fn snapshot_survives_json_persistence() {
    let source = QueryStore::new(|| Box::pin(async { Ok(user(9, "mo")) }));
    source.fetch(false).await.expect("fetch");
    let json = source.to_json().expect("serialize");

    let restored: QueryStore<User> = QueryStore::new(|| {
        Box::pin(async { Err(QueryError::fetch("should not be called")) })
    });
    restored.hydrate_json(&json).expect("hydrate");

    assert_eq!(restored.data(), Some(user(9, "mo")));
    assert!(!restored.is_stale());
    assert!(matches!(
        restored.hydrate_json("{not json"),
        Err(QueryError::Snapshot(_))
    ));
    assert_eq!(restored.data(), Some(user(9, "mo")));
}
