//! Club feed example demonstrating queries, mutations and cache maintenance.
//!
//! This example shows:
//! - Two consumers sharing one cached feed and one network call
//! - A query following the selected club
//! - An optimistic post that is rolled back when the server rejects it
//! - Background refresh after the app returns to the foreground
//! - Clearing cached data on logout
//!
//! The backend is simulated in-process with a short delay per request.
//!
//! Run with: `RUST_LOG=humidor=debug cargo run --example club_feed`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use color_eyre::eyre::Result;
use humidor::prelude::*;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// A post in a club's feed
#[derive(Debug, Clone, PartialEq, Eq)]
struct Post {
    author: String,
    body: String,
}

/// Simulated backend counting every request it serves
#[derive(Default)]
struct Backend {
    requests: AtomicUsize,
}

impl Backend {
    async fn feed(&self, club: u32) -> Result<Vec<Post>, QueryError> {
        let request = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(vec![Post {
            author: format!("member-{club}"),
            body: format!("club {club} feed, request #{request}"),
        }])
    }

    async fn post(&self, club: u32, body: &str) -> Result<Post, QueryError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if body.is_empty() {
            return Err(QueryError::fetch(format!("club {club} rejected an empty post")));
        }
        Ok(Post {
            author: "me".to_string(),
            body: body.to_string(),
        })
    }
}

fn feed_options(backend: &Arc<Backend>, club: u32) -> QueryOptions<Vec<Post>> {
    let backend = Arc::clone(backend);
    QueryOptions::new(query_key!["clubs", club, "feed"], move || {
        let backend = Arc::clone(&backend);
        Box::pin(async move { backend.feed(club).await })
    })
}

fn print_feed(label: &str, feed: Option<Vec<Post>>) {
    match feed {
        Some(posts) => {
            println!("{label}:");
            for post in posts {
                println!("  {}: {}", post.author, post.body);
            }
        }
        None => println!("{label}: <no data>"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cache = QueryCache::with_config(
        QueryConfig::default()
            .with_stale_time(Duration::from_secs(10))
            .with_gc_time(Duration::from_secs(1)),
    );
    let backend = Arc::new(Backend::default());

    // Two screens showing the same club share the store and the request.
    let (sidebar, main_panel) = tokio::try_join!(
        Query::new(cache.clone(), {
            let backend = Arc::clone(&backend);
            move || feed_options(&backend, 1)
        }),
        Query::new(cache.clone(), {
            let backend = Arc::clone(&backend);
            move || feed_options(&backend, 1)
        }),
    )?;
    print_feed("sidebar", sidebar.data()?);
    print_feed("main panel", main_panel.data()?);
    println!("requests so far: {}", backend.requests.load(Ordering::SeqCst));
    drop(sidebar);
    drop(main_panel);

    // A query that follows the selected club.
    let (selected, selected_rx) = watch::channel(1_u32);
    let feed = Arc::new(
        Query::new(cache.clone(), {
            let backend = Arc::clone(&backend);
            move || feed_options(&backend, *selected_rx.borrow())
        })
        .await?,
    );
    let follow = feed.follow(selected.subscribe());

    selected.send_replace(2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    print_feed("selected club", feed.data()?);

    // Optimistic post, rolled back because the server rejects it.
    let store = feed.store()?;
    let post = Mutation::new(
        cache.clone(),
        MutationOptions::with_context(
            {
                let backend = Arc::clone(&backend);
                move |body: String| {
                    let backend = Arc::clone(&backend);
                    Box::pin(async move { backend.post(2, &body).await })
                }
            },
            {
                let store = store.clone();
                move |body: &String| {
                    let previous = store.data();
                    let mut optimistic = previous.clone().unwrap_or_default();
                    optimistic.push(Post {
                        author: "me".to_string(),
                        body: body.clone(),
                    });
                    store.set_data(optimistic);
                    previous
                }
            },
        )
        .on_error({
            let store = store.clone();
            move |err: &QueryError, _body: &String, previous: Option<&Option<Vec<Post>>>| {
                println!("post failed: {err}");
                if let Some(Some(previous)) = previous {
                    store.set_data(previous.clone());
                }
            }
        })
        .invalidates_prefix(query_key!["clubs", 2]),
    );

    post.mutate(String::new()).await;
    print_feed("after rejected post", feed.data()?);

    if let Some(created) = post.mutate("Anyone tried the new maduro?".to_string()).await {
        println!("posted: {}", created.body);
    }
    println!("feed stale after post: {}", feed.is_stale()?);

    // Returning to the foreground refreshes whatever is on screen.
    let refreshed = cache.refresh_active_queries().await;
    println!("background refreshes: {refreshed}");
    print_feed("refreshed club", feed.data()?);

    // Logout drops every cached payload but keeps the entries.
    cache.clear();
    println!(
        "after logout: {} entries, feed data present: {}",
        cache.len(),
        feed.data()?.is_some()
    );

    follow.cancel().await;
    drop(feed);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    println!("entries after grace period: {}", cache.len());
    println!("total requests: {}", backend.requests.load(Ordering::SeqCst));

    Ok(())
}
