//! Observable state of a single store, and its persisted snapshot.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::QueryError;

/// The state owned by one [`QueryStore`](crate::QueryStore).
///
/// Staleness and loading are independent: a store may be loading while its
/// previous data is still fresh, or stale while idle.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    /// Last successfully fetched value, or a value set optimistically.
    pub data: Option<T>,
    /// Whether a foreground fetch is in flight.
    pub loading: bool,
    /// The error of the most recent failed fetch.
    pub error: Option<QueryError>,
    /// When data was last confirmed by a fetch. `None` means never fetched or
    /// explicitly invalidated.
    pub last_fetched_at: Option<Instant>,
    /// How long fetched data stays fresh.
    pub stale_time: Duration,
}

impl<T> QueryState<T> {
    /// Creates an empty, never-fetched state.
    #[must_use]
    pub const fn new(stale_time: Duration) -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            last_fetched_at: None,
            stale_time,
        }
    }

    /// Returns the data if present.
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Returns `true` if a foreground fetch is in flight.
    pub const fn is_loading(&self) -> bool {
        self.loading
    }

    /// Returns `true` if the most recent fetch failed.
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Returns `true` if data is stale as of `now`.
    #[must_use]
    pub fn is_stale_at(&self, now: Instant) -> bool {
        match self.last_fetched_at {
            None => true,
            Some(fetched_at) => now.saturating_duration_since(fetched_at) > self.stale_time,
        }
    }

    /// Returns `true` if data is stale right now.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }
}

/// The persisted form of a store: its data and when that data was fetched.
///
/// `fetched_at_ms` is wall-clock milliseconds since the Unix epoch so a
/// snapshot survives a process restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySnapshot<T> {
    pub data: Option<T>,
    pub fetched_at_ms: Option<u64>,
}

/// Converts a monotonic fetch time to wall-clock epoch milliseconds.
pub(crate) fn instant_to_epoch_ms(at: Instant) -> Option<u64> {
    let age = Instant::now().saturating_duration_since(at);
    let wall = SystemTime::now().checked_sub(age)?;
    let since_epoch = wall.duration_since(UNIX_EPOCH).ok()?;
    u64::try_from(since_epoch.as_millis()).ok()
}

/// Converts wall-clock epoch milliseconds back to a monotonic instant.
///
/// Timestamps in the future clamp to now. Returns `None` when the timestamp
/// predates the monotonic clock's origin.
pub(crate) fn epoch_ms_to_instant(ms: u64) -> Option<Instant> {
    let wall = UNIX_EPOCH.checked_add(Duration::from_millis(ms))?;
    let age = SystemTime::now()
        .duration_since(wall)
        .unwrap_or(Duration::ZERO);
    Instant::now().checked_sub(age)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_stale_and_idle() {
        let state: QueryState<i32> = QueryState::new(Duration::from_secs(60));
        assert!(state.data().is_none());
        assert!(!state.is_loading());
        assert!(!state.is_error());
        assert!(state.is_stale());
    }

    #[test]
    fn test_staleness_boundary() {
        let now = Instant::now();
        let mut state = QueryState::<i32>::new(Duration::from_secs(10));
        state.last_fetched_at = Some(now);

        assert!(!state.is_stale_at(now));
        assert!(!state.is_stale_at(now + Duration::from_secs(10)));
        assert!(state.is_stale_at(now + Duration::from_secs(11)));
    }

    #[test]
    fn test_loading_does_not_affect_staleness() {
        let now = Instant::now();
        let mut state = QueryState::<i32>::new(Duration::from_secs(10));
        state.loading = true;
        assert!(state.is_stale_at(now));

        state.last_fetched_at = Some(now);
        assert!(!state.is_stale_at(now));
    }

    #[test]
    fn test_epoch_conversion_round_trip() {
        let fetched_at = Instant::now();
        let ms = instant_to_epoch_ms(fetched_at).expect("clock is after the epoch");
        let back = epoch_ms_to_instant(ms).expect("timestamp is representable");

        let drift = if back > fetched_at {
            back - fetched_at
        } else {
            fetched_at - back
        };
        assert!(drift < Duration::from_secs(1), "drift was {drift:?}");
    }

    #[test]
    fn test_future_timestamp_clamps_to_now() {
        let far_future = u64::MAX / 4;
        let before = Instant::now();
        if let Some(at) = epoch_ms_to_instant(far_future) {
            assert!(at >= before);
        }
    }
}
