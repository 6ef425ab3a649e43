//! Test fixtures for entries and local databases.

use bibsync_core::{BibDatabaseContext, BibEntry, EventSource};
use bibsync_shared::{SharedProcessor, Synchronizer};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// An article with a title and a year.
pub fn article(title: &str, year: &str) -> BibEntry {
    BibEntry::new("article")
        .with_field("title", title)
        .with_field("year", year)
}

/// A local database context holding `entries`.
#[allow(dead_code)]
pub async fn local_context(name: &str, entries: Vec<BibEntry>) -> Arc<BibDatabaseContext> {
    let context = Arc::new(BibDatabaseContext::new(name));
    context
        .database()
        .lock()
        .await
        .insert_entries(entries, EventSource::Shared);
    context
}

/// An empty local database opened against `processor`.
#[allow(dead_code)]
pub async fn open_synchronizer(
    name: &str,
    processor: Arc<dyn SharedProcessor>,
) -> (Arc<BibDatabaseContext>, Arc<Synchronizer>) {
    let context = local_context(name, Vec::new()).await;
    let synchronizer = Synchronizer::open(context.clone(), processor)
        .await
        .expect("shared database opens");
    (context, synchronizer)
}

/// Poll `condition` until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
