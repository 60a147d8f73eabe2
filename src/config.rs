use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default freshness window for fetched data.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

/// Default grace period before an unreferenced cache entry is evicted.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(30);

/// Configuration for cache behavior.
///
/// This controls how long stores consider their data fresh and how long an
/// entry outlives its last consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// While data is fresh, a non-forced fetch is a no-op. Individual queries
    /// may override this when they create their store.
    pub stale_time: Duration,

    /// How long an entry with no remaining consumers is retained.
    ///
    /// A consumer attaching within this window reuses the entry and its data.
    pub gc_time: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            gc_time: DEFAULT_GC_TIME,
        }
    }
}

impl QueryConfig {
    /// Creates a new configuration with the given stale and gc times.
    #[must_use]
    pub const fn new(stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            stale_time,
            gc_time,
        }
    }

    #[must_use]
    pub const fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    #[must_use]
    pub const fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueryConfig::default();
        assert_eq!(config.stale_time, Duration::from_secs(300));
        assert_eq!(config.gc_time, Duration::from_secs(30));
    }

    #[test]
    fn test_new_config() {
        let config = QueryConfig::new(Duration::from_secs(30), Duration::from_secs(300));
        assert_eq!(config.stale_time, Duration::from_secs(30));
        assert_eq!(config.gc_time, Duration::from_secs(300));
    }

    #[test]
    fn test_builder_overrides() {
        let config = QueryConfig::default()
            .with_stale_time(Duration::from_secs(1))
            .with_gc_time(Duration::ZERO);
        assert_eq!(config, QueryConfig::new(Duration::from_secs(1), Duration::ZERO));
    }

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let config: QueryConfig =
            serde_json::from_str(r#"{"gc_time":{"secs":5,"nanos":0}}"#).expect("valid config");
        assert_eq!(config.stale_time, DEFAULT_STALE_TIME);
        assert_eq!(config.gc_time, Duration::from_secs(5));
    }
}
