//! Per-key fetch state machine.
//!
//! A [`QueryStore`] owns one piece of fetched state and moves it through
//! `Idle -> Loading -> Success | Error`, looping back to `Loading` on every
//! forced or stale fetch. Every mutation goes through the store's methods and
//! is published to observers through a [`watch`] channel.
//!
//! Concurrent fetches on one store collapse into a single in-flight call:
//! callers arriving while a request is pending await that same request.
//! Each request carries a sequence number and only the latest issued request
//! may commit, so a response that was superseded by [`QueryStore::reset`],
//! [`QueryStore::hydrate`] or [`QueryStore::clear`] is dropped.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::QueryError;
use crate::config::DEFAULT_STALE_TIME;
use crate::lock::mutex_lock;
use crate::state::{QuerySnapshot, QueryState, epoch_ms_to_instant, instant_to_epoch_ms};

const SOURCE: &str = "store";

/// The injected data source of a store.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

type InFlight = Shared<BoxFuture<'static, Result<(), QueryError>>>;

#[derive(Default)]
struct Flight {
    /// Sequence number of the most recently issued request.
    seq: u64,
    /// The pending request, tagged with its sequence number.
    pending: Option<(u64, InFlight)>,
}

struct Inner<T> {
    fetcher: Fetcher<T>,
    state: watch::Sender<QueryState<T>>,
    flight: Mutex<Flight>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Foreground,
    Background,
}

/// A shared handle to one key's fetched state.
///
/// Cloning is cheap; every clone refers to the same state.
pub struct QueryStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for QueryStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for QueryStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("QueryStore")
            .field("has_data", &state.data.is_some())
            .field("loading", &state.loading)
            .field("error", &state.error)
            .field("last_fetched_at", &state.last_fetched_at)
            .field("stale_time", &state.stale_time)
            .finish()
    }
}

impl<T> QueryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a store with the default stale time.
    ///
    /// # Example
    ///
    /// ```
    /// use humidor::{QueryError, QueryStore};
    ///
    /// let store = QueryStore::new(|| Box::pin(async { Ok::<_, QueryError>(42) }));
    /// assert!(store.is_stale());
    /// ```
    pub fn new<F>(fetcher: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        Self::with_stale_time(fetcher, DEFAULT_STALE_TIME)
    }

    /// Creates a store whose data stays fresh for `stale_time`.
    pub fn with_stale_time<F>(fetcher: F, stale_time: Duration) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        Self::from_fetcher(Arc::new(fetcher), stale_time)
    }

    pub(crate) fn from_fetcher(fetcher: Fetcher<T>, stale_time: Duration) -> Self {
        let (state, _) = watch::channel(QueryState::new(stale_time));
        Self {
            inner: Arc::new(Inner {
                fetcher,
                state,
                flight: Mutex::new(Flight::default()),
            }),
        }
    }

    /// Returns a clone of the current state.
    #[must_use]
    pub fn state(&self) -> QueryState<T> {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn data(&self) -> Option<T> {
        self.inner.state.borrow().data.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    #[must_use]
    pub fn error(&self) -> Option<QueryError> {
        self.inner.state.borrow().error.clone()
    }

    #[must_use]
    pub fn last_fetched_at(&self) -> Option<Instant> {
        self.inner.state.borrow().last_fetched_at
    }

    #[must_use]
    pub fn stale_time(&self) -> Duration {
        self.inner.state.borrow().stale_time
    }

    /// Returns `true` if data was never fetched, was invalidated, or is older
    /// than the stale time.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.inner.state.borrow().is_stale()
    }

    /// Returns `true` if a request is in flight, foreground or background.
    #[must_use]
    pub fn is_fetching(&self) -> bool {
        mutex_lock(&self.inner.flight, SOURCE, "is_fetching")
            .pending
            .is_some()
    }

    /// Returns `true` if both handles refer to the same store.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.inner.state.subscribe()
    }

    /// Streams the current state followed by every subsequent change.
    pub fn watch(&self) -> BoxStream<'static, QueryState<T>> {
        Box::pin(WatchStream::new(self.subscribe()))
    }

    /// Fetches data unless it is still fresh.
    ///
    /// When `force` is `false` and the data is fresh this returns immediately.
    /// Otherwise `loading` is set, the error is cleared and the fetcher runs.
    /// On failure existing data is kept, the error is stored and returned.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's error.
    pub async fn fetch(&self, force: bool) -> Result<(), QueryError> {
        if !force && !self.is_stale() {
            return Ok(());
        }
        self.start(Mode::Foreground).await
    }

    /// Fetches data regardless of staleness.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's error.
    pub async fn refetch(&self) -> Result<(), QueryError> {
        self.fetch(true).await
    }

    /// Fetches data without ever setting `loading`.
    ///
    /// Data, error and fetch time are still updated when the request settles.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's error; callers doing bulk refreshes are expected
    /// to log and drop it.
    pub async fn refetch_in_background(&self) -> Result<(), QueryError> {
        self.start(Mode::Background).await
    }

    /// Marks the data stale without touching data or loading.
    pub fn invalidate(&self) {
        self.inner.state.send_modify(|state| state.last_fetched_at = None);
    }

    /// Overwrites data without marking it fresh.
    pub fn set_data(&self, data: T) {
        self.inner.state.send_modify(|state| state.data = Some(data));
    }

    /// Overwrites data and marks it freshly fetched.
    pub fn set_data_fresh(&self, data: T) {
        self.inner.state.send_modify(|state| {
            state.data = Some(data);
            state.error = None;
            state.last_fetched_at = Some(Instant::now());
        });
    }

    pub fn set_stale_time(&self, stale_time: Duration) {
        self.inner.state.send_modify(|state| state.stale_time = stale_time);
    }

    /// Clears the state, keeping the stale time. Any in-flight request is
    /// superseded.
    pub fn reset(&self) {
        self.supersede("reset");
        self.inner.state.send_modify(|state| {
            *state = QueryState::new(state.stale_time);
        });
    }

    /// Drops data and error and marks the store stale, keeping the stale
    /// time. Any in-flight request is superseded.
    ///
    /// Unlike [`QueryStore::reset`] this is meant for stores that stay shared,
    /// such as every entry of a cache on logout.
    pub fn clear(&self) {
        self.supersede("clear");
        self.inner.state.send_modify(|state| {
            state.data = None;
            state.loading = false;
            state.error = None;
            state.last_fetched_at = None;
        });
    }

    /// Captures the data and its fetch time for external persistence.
    #[must_use]
    pub fn snapshot(&self) -> QuerySnapshot<T> {
        let state = self.inner.state.borrow();
        QuerySnapshot {
            data: state.data.clone(),
            fetched_at_ms: state.last_fetched_at.and_then(instant_to_epoch_ms),
        }
    }

    /// Restores data and fetch time from a snapshot. Any in-flight request is
    /// superseded and the error is cleared.
    pub fn hydrate(&self, snapshot: QuerySnapshot<T>) {
        self.supersede("hydrate");
        let last_fetched_at = snapshot.fetched_at_ms.and_then(epoch_ms_to_instant);
        self.inner.state.send_modify(|state| {
            state.data = snapshot.data;
            state.loading = false;
            state.error = None;
            state.last_fetched_at = last_fetched_at;
        });
    }

    fn supersede(&self, op: &'static str) {
        let mut flight = mutex_lock(&self.inner.flight, SOURCE, op);
        flight.seq += 1;
        if flight.pending.take().is_some() {
            debug!(op, seq = flight.seq, "superseded in-flight request");
        }
    }

    /// Starts a request or joins the one already in flight.
    ///
    /// The request runs on its own task, so it settles even if every caller
    /// stops waiting for it. The fetcher is invoked on that task, never under
    /// the flight lock.
    fn start(&self, mode: Mode) -> InFlight {
        let mut flight = mutex_lock(&self.inner.flight, SOURCE, "start");
        if let Some((seq, pending)) = &flight.pending {
            debug!(seq, ?mode, "joining in-flight request");
            return pending.clone();
        }

        flight.seq += 1;
        let seq = flight.seq;
        if mode == Mode::Foreground {
            self.inner.state.send_modify(|state| {
                state.loading = true;
                state.error = None;
            });
        }

        let request = drive(
            Arc::clone(&self.inner.fetcher),
            Arc::downgrade(&self.inner),
            seq,
        );
        let pending = match Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn(request);
                async move { task.await.unwrap_or_else(|err| Err(QueryError::fetch(err))) }
                    .boxed()
                    .shared()
            }
            Err(_) => {
                warn!(seq, "no async runtime, request runs only while awaited");
                request.shared()
            }
        };

        flight.pending = Some((seq, pending.clone()));
        pending
    }
}

impl<T> QueryStore<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Serializes [`QueryStore::snapshot`] to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Snapshot`] if the data cannot be serialized.
    pub fn to_json(&self) -> Result<String, QueryError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Hydrates the store from JSON produced by [`QueryStore::to_json`].
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Snapshot`] if the JSON is malformed; the store is
    /// left untouched in that case.
    pub fn hydrate_json(&self, json: &str) -> Result<(), QueryError> {
        let snapshot: QuerySnapshot<T> = serde_json::from_str(json)?;
        self.hydrate(snapshot);
        Ok(())
    }
}

/// Runs one request to completion and commits its result.
///
/// A panicking fetcher settles the request with [`QueryError::Fetch`] so the
/// store never stays loading.
fn drive<T>(
    fetcher: Fetcher<T>,
    inner: Weak<Inner<T>>,
    seq: u64,
) -> BoxFuture<'static, Result<(), QueryError>>
where
    T: Send + Sync + 'static,
{
    async move {
        let result = AssertUnwindSafe(async { fetcher().await })
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(QueryError::fetch("fetcher panicked")));
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        commit(&inner, seq, result);
        outcome
    }
    .boxed()
}

/// Applies a settled request if it is still the latest one issued.
fn commit<T>(inner: &Weak<Inner<T>>, seq: u64, result: Result<T, QueryError>) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let mut flight = mutex_lock(&inner.flight, SOURCE, "commit");
    if flight.pending.as_ref().is_some_and(|(pending, _)| *pending == seq) {
        flight.pending = None;
    }
    if flight.seq != seq {
        debug!(seq, latest = flight.seq, "discarding superseded response");
        return;
    }

    match result {
        Ok(data) => inner.state.send_modify(|state| {
            state.data = Some(data);
            state.loading = false;
            state.error = None;
            state.last_fetched_at = Some(Instant::now());
        }),
        Err(err) => inner.state.send_modify(|state| {
            state.loading = false;
            state.error = Some(err);
        }),
    }
}
