//! Prelude module for convenient imports.
//!
//! ```
//! use humidor::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryCache`] - The registry of shared stores
//! - [`QueryStore`] and [`QueryState`] - Per-key state
//! - [`Query`] and [`QueryOptions`] - Key-bound consumers
//! - [`Mutation`] and [`MutationOptions`] - Writes with invalidation
//! - [`QueryKey`] and the [`query_key!`](crate::query_key) macro

pub use crate::cache::QueryCache;
pub use crate::config::QueryConfig;
pub use crate::error::QueryError;
pub use crate::key::{KeyPart, QueryKey};
pub use crate::mutation::{Mutation, MutationOptions, MutationState};
pub use crate::query::{Query, QueryOptions};
pub use crate::query_key;
pub use crate::state::QueryState;
pub use crate::store::QueryStore;
