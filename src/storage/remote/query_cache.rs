//! Query cache for paginated package listings
//!
//! Each key holds the backend pages fetched so far together with their continuation
//! tokens. A request replays cached pages and only fetches the missing tail. Requests
//! for one key serialize on that key's page list. An idle entry evicts itself.

use log::debug;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::model::PackageName;
use crate::storage::remote::object_store::Segment;
use crate::support::SupportService;

pub const DEFAULT_QUERY_CACHE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    pages: tokio::sync::Mutex<Vec<Segment<PackageName>>>,
    last_access: Mutex<Instant>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            pages: tokio::sync::Mutex::new(Vec::new()),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_access.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_access
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

pub struct QueryCache {
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
    timeout: Duration,
    support: Option<Arc<dyn SupportService>>,
}

impl QueryCache {
    pub fn new(timeout: Duration, support: Option<Arc<dyn SupportService>>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
            support,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serves `take` items after `skip` for `key`, calling `fetch` with the last
    /// continuation token for every missing backend page. `skip == 0` starts over.
    pub async fn query<F, Fut>(
        self: &Arc<Self>,
        key: String,
        skip: usize,
        take: usize,
        fetch: F,
    ) -> Result<Vec<PackageName>>
    where
        F: Fn(Option<String>) -> Fut,
        Fut: Future<Output = Result<Segment<PackageName>>>,
    {
        let entry = self.entry(&key);
        entry.touch();

        let mut pages = entry.pages.lock().await;
        if skip == 0 {
            pages.clear();
        }

        loop {
            let fetched: usize = pages.iter().map(|page| page.items.len()).sum();
            if fetched >= skip.saturating_add(take) {
                break;
            }

            let continuation = match pages.last() {
                None => None,
                Some(page) => match &page.continuation {
                    Some(token) => Some(token.clone()),
                    None => break,
                },
            };

            debug!("Query cache {} fetching page after {:?}", key, continuation);
            pages.push(fetch(continuation).await?);
        }

        let result = pages
            .iter()
            .flat_map(|page| page.items.iter())
            .skip(skip)
            .take(take)
            .cloned()
            .collect();

        drop(pages);
        entry.touch();
        Ok(result)
    }

    fn entry(self: &Arc<Self>, key: &str) -> Arc<CacheEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(key) {
            return entry.clone();
        }

        let entry = Arc::new(CacheEntry::new());
        entries.insert(key.to_string(), entry.clone());
        let count = entries.len();
        drop(entries);

        self.track_count(count);
        self.spawn_evictor(key.to_string(), entry.clone());
        entry
    }

    fn spawn_evictor(self: &Arc<Self>, key: String, entry: Arc<CacheEntry>) {
        let cache: Weak<Self> = Arc::downgrade(self);
        let timeout = self.timeout;

        tokio::spawn(async move {
            loop {
                let idle = entry.idle();
                if idle >= timeout {
                    break;
                }
                tokio::time::sleep(timeout - idle).await;
            }

            if let Some(cache) = cache.upgrade() {
                cache.evict(&key, &entry);
            }
        });
    }

    fn evict(&self, key: &str, entry: &Arc<CacheEntry>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries
            .get(key)
            .map_or(false, |current| Arc::ptr_eq(current, entry))
        {
            entries.remove(key);
            debug!("Query cache evicted {}", key);
        }
        let count = entries.len();
        drop(entries);

        self.track_count(count);
    }

    fn track_count(&self, count: usize) {
        if let Some(support) = &self.support {
            support.track_metric("QueryCacheEntries", count as f64, json!({}));
        }
    }
}
