use std::fmt::Display;

use thiserror::Error;

use crate::QueryKey;

/// Error type for query, mutation and cache operations.
///
/// Collaborator errors are normalised into this single type so they can be
/// stored on a store or mutation and cloned to every consumer sharing it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Query is not bound to a cache entry")]
    NotInitialized,

    #[error("Cache entry {key} holds a different value type")]
    TypeMismatch { key: QueryKey },

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl QueryError {
    /// Wraps any displayable failure as a [`QueryError::Fetch`].
    pub fn fetch(err: impl Display) -> Self {
        Self::Fetch(err.to_string())
    }

    /// Wraps any displayable failure as a [`QueryError::Network`].
    pub fn network(err: impl Display) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Snapshot(err.to_string())
    }
}
