//! The shared registry of query stores.
//!
//! [`QueryCache`] maps the canonical form of a [`QueryKey`] to a type-erased
//! store plus a reference count. Consumers acquire a store with
//! [`QueryCache::get_or_create`] and must release it with
//! [`QueryCache::decrement_ref`] exactly once per acquisition. When the last
//! consumer releases an entry, eviction is scheduled after the configured
//! grace period; acquiring the entry again before then cancels it.
//!
//! # Example
//!
//! ```
//! use humidor::{QueryCache, QueryError, QueryStore, query_key};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let cache = QueryCache::new();
//! let key = query_key!["clubs", "detail", 42];
//!
//! let store = cache.get_or_create(&key, || {
//!     QueryStore::new(|| Box::pin(async { Ok::<_, QueryError>("Havana Nights") }))
//! })?;
//! store.fetch(false).await?;
//!
//! cache.invalidate_queries_matching(&query_key!["clubs", "detail"]);
//! assert!(store.is_stale());
//!
//! cache.decrement_ref(&key);
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::key::QueryKey;
use crate::store::QueryStore;
use crate::QueryError;

/// Operations the cache performs on stores without knowing their value type.
trait ErasedStore: Send + Sync {
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    fn invalidate(&self);
    fn clear(&self);
    fn refetch_in_background(&self) -> BoxFuture<'static, Result<(), QueryError>>;
}

impl<T> ErasedStore for QueryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn invalidate(&self) {
        QueryStore::invalidate(self);
    }

    fn clear(&self) {
        QueryStore::clear(self);
    }

    fn refetch_in_background(&self) -> BoxFuture<'static, Result<(), QueryError>> {
        let store = self.clone();
        async move { store.refetch_in_background().await }.boxed()
    }
}

struct Entry {
    key: QueryKey,
    store: Arc<dyn ErasedStore>,
    ref_count: usize,
    eviction: Option<CancellationToken>,
}

impl Entry {
    fn typed<T>(&self) -> Option<QueryStore<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.store.as_any().downcast_ref::<QueryStore<T>>().cloned()
    }

    fn cancel_eviction(&mut self) {
        if let Some(token) = self.eviction.take() {
            token.cancel();
            debug!(key = %self.key, "eviction cancelled");
        }
    }
}

type Entries = DashMap<String, Entry>;

/// A registry of query stores shared by every consumer in the application.
///
/// Create one at startup and pass clones (or an `Arc`) to whatever needs it;
/// all clones share the same entries.
#[derive(Clone)]
pub struct QueryCache {
    entries: Arc<Entries>,
    config: QueryConfig,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}

impl QueryCache {
    /// Creates a new cache with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new cache with the given configuration.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Gets the cache configuration.
    #[must_use]
    pub const fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Number of entries, including those waiting for eviction.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(&key.canonical())
    }

    /// Current reference count of `key`, or `None` if it has no entry.
    #[must_use]
    pub fn ref_count(&self, key: &QueryKey) -> Option<usize> {
        self.entries
            .get(&key.canonical())
            .map(|entry| entry.ref_count)
    }

    /// Keys of every entry, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|entry| entry.key.clone()).collect()
    }

    /// Looks up a store without claiming a reference.
    ///
    /// Returns `None` if the key has no entry or holds another value type.
    #[must_use]
    pub fn get<T>(&self, key: &QueryKey) -> Option<QueryStore<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entries.get(&key.canonical())?.typed()
    }

    /// Returns the store for `key`, creating it with `factory` if absent, and
    /// claims one reference to it.
    ///
    /// Every caller for the same key receives the same store; `factory` runs
    /// only when the key has no entry. It runs without any registry lock held,
    /// so it may read the cache. If two callers race to create the same key,
    /// the store inserted first wins and the other is dropped. A pending
    /// eviction of the entry is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the entry holds a store of
    /// another value type. No reference is claimed in that case.
    pub fn get_or_create<T, F>(&self, key: &QueryKey, factory: F) -> Result<QueryStore<T>, QueryError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> QueryStore<T>,
    {
        let cache_key = key.canonical();
        if let Some(mut entry) = self.entries.get_mut(&cache_key) {
            return claim(&mut entry, key);
        }

        let created: Arc<dyn ErasedStore> = Arc::new(factory());
        let mut entry = self.entries.entry(cache_key).or_insert_with(|| {
            debug!(%key, "cache entry created");
            Entry {
                key: key.clone(),
                store: created,
                ref_count: 0,
                eviction: None,
            }
        });
        claim(&mut entry, key)
    }

    /// Releases one reference to `key`.
    ///
    /// When the count reaches zero the entry is evicted after
    /// [`QueryConfig::gc_time`] unless it is acquired again first.
    pub fn decrement_ref(&self, key: &QueryKey) {
        let cache_key = key.canonical();
        let Some(mut entry) = self.entries.get_mut(&cache_key) else {
            debug!(%key, "release of unknown cache entry ignored");
            return;
        };

        if entry.ref_count == 0 {
            warn!(%key, "cache entry released more times than acquired");
            return;
        }
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return;
        }

        entry.cancel_eviction();
        entry.eviction = self.schedule_eviction(cache_key);
    }

    fn schedule_eviction(&self, cache_key: String) -> Option<CancellationToken> {
        let Ok(runtime) = Handle::try_current() else {
            warn!(key = %cache_key, "no async runtime, eviction not scheduled");
            return None;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let entries = Arc::downgrade(&self.entries);
        let grace = self.config.gc_time;
        debug!(key = %cache_key, ?grace, "eviction scheduled");

        runtime.spawn(async move {
            tokio::select! {
                biased;
                () = cancelled.cancelled() => {}
                () = tokio::time::sleep(grace) => evict(&entries, &cache_key, &cancelled),
            }
        });
        Some(token)
    }

    /// Removes an entry immediately, regardless of its references.
    ///
    /// Consumers still holding the store keep a working handle; it is simply
    /// no longer shared through the cache.
    pub fn remove(&self, key: &QueryKey) -> bool {
        match self.entries.remove(&key.canonical()) {
            Some((_, mut entry)) => {
                entry.cancel_eviction();
                debug!(%key, "cache entry removed");
                true
            }
            None => false,
        }
    }

    /// Marks the store for `key` stale. Returns `false` if it has no entry.
    pub fn invalidate_query(&self, key: &QueryKey) -> bool {
        let Some(store) = self.erased(key) else {
            return false;
        };
        store.invalidate();
        true
    }

    /// Marks every store whose key starts with `prefix` stale.
    ///
    /// Returns the number of stores invalidated.
    pub fn invalidate_queries_matching(&self, prefix: &QueryKey) -> usize {
        let stores = self.matching(prefix);
        for store in &stores {
            store.invalidate();
        }
        debug!(%prefix, count = stores.len(), "invalidated matching queries");
        stores.len()
    }

    /// Overwrites the data of an existing store without claiming a reference.
    ///
    /// Returns `false` if the key has no entry of type `T`.
    pub fn set_query_data<T>(&self, key: &QueryKey, data: T) -> bool
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.get::<T>(key) {
            Some(store) => {
                store.set_data(data);
                true
            }
            None => false,
        }
    }

    /// Revalidates every entry.
    ///
    /// Entries with consumers refetch in the background, keeping their data
    /// visible; entries without consumers are only invalidated. Resolves once
    /// every background refetch has settled. Failures are logged and never
    /// returned, so one failing query does not affect the rest.
    ///
    /// Returns the number of background refetches that were started.
    pub async fn refresh_active_queries(&self) -> usize {
        let mut active = Vec::new();
        for entry in self.entries.iter() {
            if entry.ref_count > 0 {
                active.push((entry.key.clone(), Arc::clone(&entry.store)));
            } else {
                entry.store.invalidate();
            }
        }

        let refreshes = active.into_iter().map(|(key, store)| async move {
            if let Err(err) = store.refetch_in_background().await {
                warn!(%key, error = %err, "background refetch failed");
            }
        });
        let count = refreshes.len();
        join_all(refreshes).await;
        debug!(count, "active queries refreshed");
        count
    }

    /// Drops the data of every store and marks it stale, keeping all entries
    /// so live consumers keep their store handles.
    pub fn clear(&self) {
        for entry in self.entries.iter() {
            entry.store.clear();
        }
        debug!(entries = self.entries.len(), "cache cleared");
    }

    /// Returns every store of type `T` whose key starts with `prefix`.
    #[must_use]
    pub fn find_queries<T>(&self, prefix: &QueryKey) -> Vec<QueryStore<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entries
            .iter()
            .filter(|entry| entry.key.starts_with(prefix))
            .filter_map(|entry| entry.typed())
            .collect()
    }

    /// Returns every store of type `T` whose key starts with `prefix` and
    /// whose current data satisfies `predicate`. Stores without data are
    /// skipped.
    pub fn find_queries_where<T, P>(&self, prefix: &QueryKey, predicate: P) -> Vec<QueryStore<T>>
    where
        T: Clone + Send + Sync + 'static,
        P: Fn(&T) -> bool,
    {
        self.find_queries::<T>(prefix)
            .into_iter()
            .filter(|store| store.state().data().is_some_and(&predicate))
            .collect()
    }

    fn erased(&self, key: &QueryKey) -> Option<Arc<dyn ErasedStore>> {
        self.entries
            .get(&key.canonical())
            .map(|entry| Arc::clone(&entry.store))
    }

    fn matching(&self, prefix: &QueryKey) -> Vec<Arc<dyn ErasedStore>> {
        self.entries
            .iter()
            .filter(|entry| entry.key.starts_with(prefix))
            .map(|entry| Arc::clone(&entry.store))
            .collect()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Claims one reference to `entry` as a store of type `T`.
fn claim<T>(entry: &mut Entry, key: &QueryKey) -> Result<QueryStore<T>, QueryError>
where
    T: Clone + Send + Sync + 'static,
{
    let store = entry
        .typed::<T>()
        .ok_or_else(|| QueryError::TypeMismatch { key: key.clone() })?;
    entry.ref_count += 1;
    entry.cancel_eviction();
    Ok(store)
}

/// Removes `cache_key` if it is still unreferenced and its eviction was not
/// cancelled.
fn evict(entries: &Weak<Entries>, cache_key: &str, token: &CancellationToken) {
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let removed = entries.remove_if(cache_key, |_, entry| {
        entry.ref_count == 0 && !token.is_cancelled()
    });
    if removed.is_some() {
        debug!(key = %cache_key, "cache entry evicted");
    }
}
