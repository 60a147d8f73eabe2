// Integration tests for the invariants every cache and store must keep.
// Unit tests for individual methods are in src/cache.rs and src/store.rs

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use humidor::{
    Mutation, MutationOptions, QueryCache, QueryConfig, QueryError, QueryStore, query_key,
};

fn value_store(value: &'static str) -> QueryStore<String> {
    QueryStore::new(move || Box::pin(async move { Ok(value.to_string()) }))
}

#[tokio::test(start_paused = true)]
async fn fresh_data_goes_stale_after_stale_time() {
    let stale_time = Duration::from_secs(60);
    let store = QueryStore::with_stale_time(
        || Box::pin(async { Ok::<_, QueryError>(1) }),
        stale_time,
    );

    store.set_data_fresh(7);
    assert!(!store.is_stale());

    tokio::time::advance(stale_time).await;
    assert!(!store.is_stale(), "staleness requires strictly exceeding stale time");

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(store.is_stale());
    assert_eq!(store.data(), Some(7));
}

#[tokio::test]
async fn one_store_per_key() {
    let cache = QueryCache::new();
    let key = query_key!["user", "42"];
    let second_factory_ran = Arc::new(AtomicBool::new(false));

    let first = cache
        .get_or_create(&key, || value_store("first"))
        .expect("first acquire");
    let second = cache
        .get_or_create(&key, {
            let ran = Arc::clone(&second_factory_ran);
            move || {
                ran.store(true, Ordering::SeqCst);
                value_store("second")
            }
        })
        .expect("second acquire");

    assert!(first.ptr_eq(&second));
    assert!(!second_factory_ran.load(Ordering::SeqCst));
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.ref_count(&key), Some(2));
}

#[tokio::test]
async fn same_key_with_another_type_is_rejected() {
    let cache = QueryCache::new();
    let key = query_key!["user", "42"];
    let _strings = cache
        .get_or_create(&key, || value_store("ana"))
        .expect("acquire");

    let numbers = cache.get_or_create(&key, || {
        QueryStore::new(|| Box::pin(async { Ok::<_, QueryError>(42_u64) }))
    });

    assert_eq!(numbers.err(), Some(QueryError::TypeMismatch { key: key.clone() }));
    assert_eq!(cache.ref_count(&key), Some(1));
}

#[tokio::test(start_paused = true)]
async fn unreferenced_entries_survive_grace_period_then_evict() {
    let gc_time = Duration::from_secs(30);
    let cache = QueryCache::with_config(QueryConfig::default().with_gc_time(gc_time));
    let key = query_key!["events", "upcoming"];

    cache
        .get_or_create(&key, || value_store("tasting"))
        .expect("acquire");
    cache.decrement_ref(&key);

    assert_eq!(cache.ref_count(&key), Some(0));
    assert!(cache.get::<String>(&key).is_some());

    tokio::time::sleep(gc_time + Duration::from_millis(1)).await;
    assert!(cache.get::<String>(&key).is_none());
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reacquiring_during_grace_period_keeps_the_store() {
    let gc_time = Duration::from_secs(30);
    let cache = QueryCache::with_config(QueryConfig::default().with_gc_time(gc_time));
    let key = query_key!["events", "upcoming"];

    let original = cache
        .get_or_create(&key, || value_store("tasting"))
        .expect("acquire");
    original.fetch(false).await.expect("fetch");
    cache.decrement_ref(&key);

    tokio::time::sleep(gc_time / 2).await;
    let again = cache
        .get_or_create(&key, || value_store("replacement"))
        .expect("reacquire");

    tokio::time::sleep(gc_time * 2).await;
    assert!(again.ptr_eq(&original));
    assert_eq!(again.data(), Some("tasting".to_string()));
    assert_eq!(cache.ref_count(&key), Some(1));
}

#[tokio::test]
async fn invalidate_is_idempotent() {
    let store = value_store("robusto");
    store.fetch(false).await.expect("fetch");
    assert!(!store.is_stale());

    store.invalidate();
    assert_eq!(store.last_fetched_at(), None);
    assert!(store.is_stale());

    store.invalidate();
    assert_eq!(store.last_fetched_at(), None);
    assert!(store.is_stale());
    assert_eq!(store.data(), Some("robusto".to_string()));
    assert!(!store.is_loading());
}

#[tokio::test]
async fn failed_optimistic_write_rolls_back() {
    let cache = QueryCache::new();
    let key = query_key!["clubs", "detail", 5];
    let club = cache
        .get_or_create(&key, || value_store("Maduro Society"))
        .expect("acquire");
    club.fetch(false).await.expect("fetch");
    let fetched_at = club.last_fetched_at();

    let rename = Mutation::new(
        cache.clone(),
        MutationOptions::with_context(
            |_: String| Box::pin(async { Err::<String, _>(QueryError::fetch("name taken")) }),
            {
                let club = club.clone();
                move |name: &String| {
                    let original = club.data();
                    club.set_data(name.clone());
                    original
                }
            },
        )
        .on_error({
            let club = club.clone();
            move |_err: &QueryError, _name: &String, original: Option<&Option<String>>| {
                if let Some(Some(original)) = original {
                    club.set_data(original.clone());
                }
            }
        }),
    );

    assert_eq!(rename.mutate("Connecticut Club".to_string()).await, None);
    assert_eq!(club.data(), Some("Maduro Society".to_string()));
    assert_eq!(club.last_fetched_at(), fetched_at);
    assert_eq!(rename.error(), Some(QueryError::fetch("name taken")));
}

#[tokio::test]
async fn prefix_invalidation_only_touches_matching_keys() {
    let cache = QueryCache::new();
    let a1 = cache
        .get_or_create(&query_key!["a", "1"], || value_store("a1"))
        .expect("acquire");
    let a2 = cache
        .get_or_create(&query_key!["a", "2"], || value_store("a2"))
        .expect("acquire");
    let b1 = cache
        .get_or_create(&query_key!["b", "1"], || value_store("b1"))
        .expect("acquire");
    for store in [&a1, &a2, &b1] {
        store.fetch(false).await.expect("fetch");
    }

    assert_eq!(cache.invalidate_queries_matching(&query_key!["a"]), 2);

    assert!(a1.is_stale());
    assert!(a2.is_stale());
    assert!(!b1.is_stale());
}

#[tokio::test]
async fn prefix_matching_is_per_element() {
    let cache = QueryCache::new();
    let one = cache
        .get_or_create(&query_key!["user", 1], || value_store("one"))
        .expect("acquire");
    let twelve = cache
        .get_or_create(&query_key!["user", 12], || value_store("twelve"))
        .expect("acquire");
    one.fetch(false).await.expect("fetch");
    twelve.fetch(false).await.expect("fetch");

    assert_eq!(cache.invalidate_queries_matching(&query_key!["user", 1]), 1);
    assert!(one.is_stale());
    assert!(!twelve.is_stale());
}

#[tokio::test]
async fn counts_every_fetch_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = QueryStore::new({
        let calls = Arc::clone(&calls);
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move { Ok::<_, QueryError>(call) })
        }
    });

    store.fetch(false).await.expect("fetch");
    store.fetch(false).await.expect("fresh data is not refetched");
    store.refetch().await.expect("refetch");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.data(), Some(2));
}
