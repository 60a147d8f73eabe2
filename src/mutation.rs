//! Write operations with optimistic updates and cache invalidation.
//!
//! A [`Mutation`] wraps an async write function. Each call to
//! [`Mutation::mutate`] runs this protocol:
//!
//! 1. `on_mutate(vars)`, given to [`MutationOptions::with_context`], runs
//!    first; its return value becomes the context handed to the later
//!    callbacks (typically the previous data, for rollback).
//! 2. The mutation enters [`MutationState::Loading`].
//! 3. The write function is awaited.
//! 4. On success the state becomes [`MutationState::Success`], `on_success`
//!    runs, then every configured key is invalidated.
//! 5. On failure the state becomes [`MutationState::Error`], `on_error` runs
//!    (typically restoring the context), and `mutate` returns `None`.
//!
//! `mutate` never returns an error; check the returned option or
//! [`Mutation::error`].
//!
//! # Example
//!
//! ```
//! use humidor::{Mutation, MutationOptions, QueryCache, QueryError, QueryStore, query_key};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let cache = QueryCache::new();
//! let key = query_key!["clubs", "detail", 42];
//! let club = cache.get_or_create(&key, || {
//!     QueryStore::new(|| Box::pin(async { Ok::<_, QueryError>(String::from("Havana")) }))
//! })?;
//! club.fetch(false).await?;
//!
//! let rename = Mutation::new(
//!     cache.clone(),
//!     MutationOptions::with_context(
//!         |name: String| {
//!             Box::pin(async move {
//!                 Err::<String, _>(QueryError::network(format!("cannot rename to {name}")))
//!             })
//!         },
//!         {
//!             let club = club.clone();
//!             move |name: &String| {
//!                 let previous = club.data();
//!                 club.set_data(name.clone());
//!                 previous
//!             }
//!         },
//!     )
//!     .on_error({
//!         let club = club.clone();
//!         move |_err, _name, previous: Option<&Option<String>>| {
//!             if let Some(Some(previous)) = previous {
//!                 club.set_data(previous.clone());
//!             }
//!         }
//!     })
//!     .invalidates(key),
//! );
//!
//! assert_eq!(rename.mutate(String::from("Smoke Ring")).await, None);
//! assert_eq!(club.data(), Some(String::from("Havana")));
//! assert!(rename.error().is_some());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::QueryError;
use crate::cache::QueryCache;
use crate::key::QueryKey;

/// The state of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationState<T> {
    /// Mutation is idle (not yet started, or reset).
    Idle,
    /// Mutation is in progress.
    Loading,
    /// Mutation succeeded with a result.
    Success(T),
    /// Mutation failed with an error.
    Error(QueryError),
}

impl<T> MutationState<T> {
    /// Returns the result data if the mutation succeeded, otherwise `None`.
    pub const fn data(&self) -> Option<&T> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the error if the mutation failed, otherwise `None`.
    pub const fn error(&self) -> Option<&QueryError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Returns `true` if the mutation is idle.
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns `true` if the mutation is currently loading.
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Returns `true` if the mutation succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns `true` if the mutation failed.
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Which cached queries a successful mutation invalidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    /// Only the query with exactly this key.
    Exact(QueryKey),
    /// Every query whose key starts with this prefix.
    Prefix(QueryKey),
}

impl KeyFilter {
    /// Invalidates matching queries, returning how many were affected.
    pub fn invalidate(&self, cache: &QueryCache) -> usize {
        match self {
            Self::Exact(key) => usize::from(cache.invalidate_query(key)),
            Self::Prefix(prefix) => cache.invalidate_queries_matching(prefix),
        }
    }
}

type Mutator<D, V> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<D, QueryError>> + Send + Sync>;
type OnMutate<V, C> = Box<dyn Fn(&V) -> C + Send + Sync>;
type OnSuccess<D, V, C> = Box<dyn Fn(&D, &V, Option<&C>) + Send + Sync>;
type OnError<V, C> = Box<dyn Fn(&QueryError, &V, Option<&C>) + Send + Sync>;

/// Configuration of a [`Mutation`].
///
/// `C` is the context type produced by the `on_mutate` hook given to
/// [`MutationOptions::with_context`]. The context is passed to `on_success`
/// and `on_error` as `Some(&context)`. Options built with
/// [`MutationOptions::new`] have no hook and pass `None`.
pub struct MutationOptions<D, V, C = ()> {
    mutator: Mutator<D, V>,
    on_mutate: Option<OnMutate<V, C>>,
    on_success: Option<OnSuccess<D, V, C>>,
    on_error: Option<OnError<V, C>>,
    invalidates: Vec<KeyFilter>,
}

impl<D, V> MutationOptions<D, V, ()> {
    /// Creates options around the write function `mutator`.
    pub fn new<F>(mutator: F) -> Self
    where
        F: Fn(V) -> BoxFuture<'static, Result<D, QueryError>> + Send + Sync + 'static,
    {
        Self::build(Arc::new(mutator), None)
    }
}

impl<D, V, C> MutationOptions<D, V, C> {
    /// Creates options whose `on_mutate` hook runs before every write. The
    /// hook's result is the context of that call, typically the data it
    /// replaced optimistically.
    pub fn with_context<F, M>(mutator: F, on_mutate: M) -> Self
    where
        F: Fn(V) -> BoxFuture<'static, Result<D, QueryError>> + Send + Sync + 'static,
        M: Fn(&V) -> C + Send + Sync + 'static,
    {
        Self::build(Arc::new(mutator), Some(Box::new(on_mutate)))
    }

    fn build(mutator: Mutator<D, V>, on_mutate: Option<OnMutate<V, C>>) -> Self {
        Self {
            mutator,
            on_mutate,
            on_success: None,
            on_error: None,
            invalidates: Vec::new(),
        }
    }

    /// Runs after a successful write, before invalidation.
    #[must_use]
    pub fn on_success<F>(mut self, on_success: F) -> Self
    where
        F: Fn(&D, &V, Option<&C>) + Send + Sync + 'static,
    {
        self.on_success = Some(Box::new(on_success));
        self
    }

    /// Runs after a failed write, typically to roll back an optimistic update.
    #[must_use]
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&QueryError, &V, Option<&C>) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(on_error));
        self
    }

    /// Invalidates the query with exactly `key` after a successful write.
    #[must_use]
    pub fn invalidates(mut self, key: impl Into<QueryKey>) -> Self {
        self.invalidates.push(KeyFilter::Exact(key.into()));
        self
    }

    /// Invalidates every query under `prefix` after a successful write.
    #[must_use]
    pub fn invalidates_prefix(mut self, prefix: impl Into<QueryKey>) -> Self {
        self.invalidates.push(KeyFilter::Prefix(prefix.into()));
        self
    }

    pub fn invalidations(&self) -> &[KeyFilter] {
        &self.invalidates
    }
}

/// A write operation with its own loading and error state.
///
/// The state belongs to the mutation, not to the cache; concurrent calls on
/// one mutation share it and the last call to settle wins.
pub struct Mutation<D, V, C = ()> {
    cache: QueryCache,
    options: MutationOptions<D, V, C>,
    state: watch::Sender<MutationState<D>>,
}

impl<D, V, C> Mutation<D, V, C>
where
    D: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Send + 'static,
{
    pub fn new(cache: QueryCache, options: MutationOptions<D, V, C>) -> Self {
        let (state, _) = watch::channel(MutationState::Idle);
        Self {
            cache,
            options,
            state,
        }
    }

    /// Runs the write with `vars`.
    ///
    /// Returns the written data, or `None` if the write failed; the failure
    /// is then available from [`Mutation::error`].
    pub async fn mutate(&self, vars: V) -> Option<D> {
        let context = self.options.on_mutate.as_ref().map(|on_mutate| on_mutate(&vars));
        self.state.send_replace(MutationState::Loading);

        match (self.options.mutator)(vars.clone()).await {
            Ok(data) => {
                self.state.send_replace(MutationState::Success(data.clone()));
                if let Some(on_success) = &self.options.on_success {
                    on_success(&data, &vars, context.as_ref());
                }
                let invalidated: usize = self
                    .options
                    .invalidates
                    .iter()
                    .map(|filter| filter.invalidate(&self.cache))
                    .sum();
                debug!(invalidated, "mutation succeeded");
                Some(data)
            }
            Err(err) => {
                warn!(error = %err, "mutation failed");
                self.state.send_replace(MutationState::Error(err.clone()));
                if let Some(on_error) = &self.options.on_error {
                    on_error(&err, &vars, context.as_ref());
                }
                None
            }
        }
    }

    /// Returns a clone of the current state.
    #[must_use]
    pub fn state(&self) -> MutationState<D> {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading()
    }

    #[must_use]
    pub fn error(&self) -> Option<QueryError> {
        self.state.borrow().error().cloned()
    }

    #[must_use]
    pub fn data(&self) -> Option<D> {
        self.state.borrow().data().cloned()
    }

    /// Returns the mutation to [`MutationState::Idle`].
    pub fn reset(&self) {
        self.state.send_replace(MutationState::Idle);
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<MutationState<D>> {
        self.state.subscribe()
    }
}
