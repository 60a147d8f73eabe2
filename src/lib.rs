//! # Humidor - a client-side query cache
//!
//! Humidor caches the results of async fetches under structured keys, shares
//! one state object between every consumer of a key, and keeps that state
//! fresh with stale-time tracking, in-flight deduplication, background
//! refresh and reference-counted eviction.
//!
//! ## Architecture
//!
//! The crate is built in layers:
//!
//! 1. **Keys**: [`QueryKey`] is an ordered list of [`KeyPart`]s, matched exactly
//!    or by prefix.
//! 2. **Stores**: a [`QueryStore`] owns one key's state and runs its fetcher.
//! 3. **Cache**: the [`QueryCache`] registry hands out one store per key and
//!    evicts unused entries after a grace period.
//! 4. **Queries**: a [`Query`] binds a consumer to the store of a key that can
//!    change over time.
//! 5. **Mutations**: a [`Mutation`] runs a write with optimistic updates and
//!    invalidates cached queries afterwards.
//!
//! ## Example
//!
//! ```
//! use humidor::{Query, QueryCache, QueryError, QueryOptions, query_key};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let cache = QueryCache::new();
//!
//! let members = Query::new(cache.clone(), || {
//!     QueryOptions::new(query_key!["clubs", "members", 7], || {
//!         Box::pin(async { Ok(vec![String::from("ana"), String::from("li")]) })
//!     })
//! })
//! .await?;
//!
//! assert_eq!(members.data()?.map(|m| m.len()), Some(2));
//! assert_eq!(cache.ref_count(&query_key!["clubs", "members", 7]), Some(1));
//!
//! members.release();
//! assert_eq!(cache.ref_count(&query_key!["clubs", "members", 7]), Some(0));
//! # Ok(())
//! # }
//! ```
//!
//! Everything that touches timers needs a Tokio runtime. Staleness and
//! eviction are measured with [`tokio::time::Instant`], so tests can pause
//! and advance the clock.

pub mod cache;
pub mod config;
pub mod error;
pub mod key;
mod lock;
pub mod mutation;
pub mod prelude;
pub mod query;
pub mod state;
pub mod store;

pub use cache::QueryCache;
pub use config::QueryConfig;
pub use error::QueryError;
pub use key::{KeyPart, QueryKey};
pub use mutation::{KeyFilter, Mutation, MutationOptions, MutationState};
pub use query::{FollowHandle, Query, QueryOptions};
pub use state::{QuerySnapshot, QueryState};
pub use store::{Fetcher, QueryStore};
