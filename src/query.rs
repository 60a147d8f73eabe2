//! Queries bound to a reactive key.
//!
//! A [`Query`] evaluates a key function producing [`QueryOptions`] and binds
//! itself to the matching cache entry. Whenever the key function is
//! re-evaluated with [`Query::recompute`] and yields a different key, the old
//! entry is released, the new one acquired, and (if enabled) fetched. Every
//! read goes through whichever store is currently bound, so switching keys
//! switches the data source with it.
//!
//! # Example
//!
//! ```
//! use humidor::{Query, QueryCache, QueryError, QueryOptions, query_key};
//! use tokio::sync::watch;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let cache = QueryCache::new();
//! let (club_id, club_rx) = watch::channel(1_u32);
//!
//! let query = Query::new(cache.clone(), move || {
//!     let id = *club_rx.borrow();
//!     QueryOptions::new(query_key!["clubs", "detail", id], move || {
//!         Box::pin(async move { Ok(format!("club {id}")) })
//!     })
//! })
//! .await?;
//! assert_eq!(query.data()?, Some("club 1".to_string()));
//!
//! club_id.send_replace(2);
//! query.recompute().await?;
//! assert_eq!(query.data()?, Some("club 2".to_string()));
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::QueryError;
use crate::cache::QueryCache;
use crate::key::QueryKey;
use crate::state::QueryState;
use crate::store::{Fetcher, QueryStore};

/// What a query's key function produces on each evaluation.
pub struct QueryOptions<T> {
    key: QueryKey,
    fetcher: Fetcher<T>,
    stale_time: Option<Duration>,
    enabled: bool,
}

impl<T> QueryOptions<T> {
    /// Creates options for `key`, fetched with `fetcher`.
    ///
    /// The fetcher is only used if this query ends up creating the store;
    /// a store already shared under the same key keeps its own fetcher.
    pub fn new<F>(key: impl Into<QueryKey>, fetcher: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            fetcher: Arc::new(fetcher),
            stale_time: None,
            enabled: true,
        }
    }

    /// Overrides the cache's stale time for a store this query creates.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Disables automatic fetching while `false`. Defaults to `true`.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

struct Binding<T> {
    key: QueryKey,
    store: QueryStore<T>,
    enabled: bool,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            store: self.store.clone(),
            enabled: self.enabled,
        }
    }
}

type KeyFn<T> = Box<dyn Fn() -> QueryOptions<T> + Send + Sync>;

/// A consumer's view of one cache entry, chosen by a key function.
///
/// Dropping the query (or calling [`Query::release`]) releases the bound
/// entry exactly once.
pub struct Query<T> {
    cache: QueryCache,
    options: KeyFn<T>,
    binding: watch::Sender<Option<Binding<T>>>,
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Binds to the key the key function yields and fetches it if enabled.
    ///
    /// Fetch failures are logged and surface through [`Query::error`].
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the key is already cached with
    /// another value type.
    pub async fn new<F>(cache: QueryCache, options: F) -> Result<Self, QueryError>
    where
        F: Fn() -> QueryOptions<T> + Send + Sync + 'static,
    {
        let query = Self::bind(cache, options)?;
        query.auto_fetch().await;
        Ok(query)
    }

    /// Binds to the key the key function yields without fetching.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the key is already cached with
    /// another value type.
    pub fn bind<F>(cache: QueryCache, options: F) -> Result<Self, QueryError>
    where
        F: Fn() -> QueryOptions<T> + Send + Sync + 'static,
    {
        let (binding, _) = watch::channel(None);
        let query = Self {
            cache,
            options: Box::new(options),
            binding,
        };
        query.rebind((query.options)())?;
        Ok(query)
    }

    /// Re-evaluates the key function.
    ///
    /// If the key changed, the previous entry is released and the new one is
    /// acquired and fetched (unless disabled, or already fresh). If the key is
    /// unchanged, a fetch only happens when the query was just enabled.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TypeMismatch`] if the new key is cached with
    /// another value type; the query stays bound to its previous key.
    pub async fn recompute(&self) -> Result<(), QueryError> {
        if self.rebind((self.options)())? {
            self.auto_fetch().await;
        }
        Ok(())
    }

    /// Applies `options`, returning whether a fetch should follow.
    fn rebind(&self, options: QueryOptions<T>) -> Result<bool, QueryError> {
        if let Some(current) = self.current() {
            if current.key == options.key {
                let newly_enabled = options.enabled && !current.enabled;
                if current.enabled != options.enabled {
                    self.binding.send_modify(|binding| {
                        if let Some(binding) = binding {
                            binding.enabled = options.enabled;
                        }
                    });
                }
                return Ok(newly_enabled);
            }
        }

        let stale_time = options
            .stale_time
            .unwrap_or(self.cache.config().stale_time);
        let fetcher = Arc::clone(&options.fetcher);
        let store = self.cache.get_or_create(&options.key, || {
            QueryStore::from_fetcher(fetcher, stale_time)
        })?;

        debug!(key = %options.key, enabled = options.enabled, "query bound");
        let previous = self.binding.send_replace(Some(Binding {
            key: options.key,
            store,
            enabled: options.enabled,
        }));
        if let Some(previous) = previous {
            self.cache.decrement_ref(&previous.key);
        }
        Ok(options.enabled)
    }

    async fn auto_fetch(&self) {
        let Some(binding) = self.current() else {
            return;
        };
        if !binding.enabled {
            return;
        }
        if let Err(err) = binding.store.fetch(false).await {
            warn!(key = %binding.key, error = %err, "query fetch failed");
        }
    }

    fn current(&self) -> Option<Binding<T>> {
        self.binding.borrow().clone()
    }

    fn bound(&self) -> Result<Binding<T>, QueryError> {
        self.current().ok_or(QueryError::NotInitialized)
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.borrow().is_some()
    }

    /// The key currently bound.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::NotInitialized`] after [`Query::release`].
    pub fn key(&self) -> Result<QueryKey, QueryError> {
        Ok(self.bound()?.key)
    }

    /// The store currently bound.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::NotInitialized`] after [`Query::release`].
    pub fn store(&self) -> Result<QueryStore<T>, QueryError> {
        Ok(self.bound()?.store)
    }

    pub fn state(&self) -> Result<QueryState<T>, QueryError> {
        Ok(self.bound()?.store.state())
    }

    pub fn data(&self) -> Result<Option<T>, QueryError> {
        Ok(self.bound()?.store.data())
    }

    pub fn is_loading(&self) -> Result<bool, QueryError> {
        Ok(self.bound()?.store.is_loading())
    }

    pub fn error(&self) -> Result<Option<QueryError>, QueryError> {
        Ok(self.bound()?.store.error())
    }

    pub fn is_stale(&self) -> Result<bool, QueryError> {
        Ok(self.bound()?.store.is_stale())
    }

    /// Refetches the bound store regardless of staleness.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, or [`QueryError::NotInitialized`] after
    /// [`Query::release`].
    pub async fn refetch(&self) -> Result<(), QueryError> {
        self.bound()?.store.refetch().await
    }

    pub fn invalidate(&self) -> Result<(), QueryError> {
        self.bound()?.store.invalidate();
        Ok(())
    }

    pub fn set_data(&self, data: T) -> Result<(), QueryError> {
        self.bound()?.store.set_data(data);
        Ok(())
    }

    pub fn set_data_fresh(&self, data: T) -> Result<(), QueryError> {
        self.bound()?.store.set_data_fresh(data);
        Ok(())
    }

    /// Streams the state of whichever store is bound.
    ///
    /// Emits the current state immediately, then every change. When the query
    /// rebinds, the stream switches to the new store and emits its state. The
    /// stream ends when the query is dropped.
    pub fn watch(&self) -> BoxStream<'static, QueryState<T>> {
        let bindings = self.binding.subscribe();
        let initial = (bindings, None::<watch::Receiver<QueryState<T>>>);

        stream::unfold(initial, |(mut bindings, mut current)| async move {
            loop {
                let Some(states) = current.as_mut() else {
                    let next = bindings
                        .borrow_and_update()
                        .as_ref()
                        .map(|binding| binding.store.subscribe());
                    match next {
                        Some(mut states) => {
                            let state = states.borrow_and_update().clone();
                            return Some((state, (bindings, Some(states))));
                        }
                        None => {
                            bindings.changed().await.ok()?;
                            continue;
                        }
                    }
                };

                tokio::select! {
                    changed = bindings.changed() => {
                        changed.ok()?;
                        current = None;
                    }
                    changed = states.changed() => {
                        if changed.is_ok() {
                            let state = states.borrow_and_update().clone();
                            return Some((state, (bindings, current)));
                        }
                        bindings.changed().await.ok()?;
                        current = None;
                    }
                }
            }
        })
        .boxed()
    }

    /// Spawns a task that calls [`Query::recompute`] every time `deps`
    /// changes.
    ///
    /// The key function typically holds its own receiver of the same channel.
    /// The task stops when the handle is cancelled, the sender is dropped, or
    /// the query is dropped.
    pub fn follow<D>(self: &Arc<Self>, mut deps: watch::Receiver<D>) -> FollowHandle
    where
        D: Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let query: Weak<Self> = Arc::downgrade(self);

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    changed = deps.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(query) = query.upgrade() else {
                            break;
                        };
                        if let Err(err) = query.recompute().await {
                            warn!(error = %err, "query recompute failed");
                        }
                    }
                }
            }
        });

        FollowHandle::new(token, join)
    }
}

impl<T> Query<T> {
    /// Releases the bound cache entry. Later reads fail with
    /// [`QueryError::NotInitialized`] until [`Query::recompute`] binds again.
    pub fn release(&self) {
        if let Some(previous) = self.binding.send_replace(None) {
            debug!(key = %previous.key, "query released");
            self.cache.decrement_ref(&previous.key);
        }
    }
}

impl<T> Drop for Query<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle for a running [`Query::follow`] task.
pub struct FollowHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl FollowHandle {
    fn new(token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self { token, join }
    }

    /// Stops following and waits for the task to finish. A task that
    /// panicked is logged rather than propagated.
    pub async fn cancel(self) {
        self.token.cancel();
        if let Err(err) = self.join.await {
            warn!(error = %err, "follow task failed");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
