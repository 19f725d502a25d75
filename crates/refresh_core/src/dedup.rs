//! Registry of in-flight shared fetches.
//!
//! The lookup and the insert happen under one lock, so two callers can never
//! both conclude a key is absent. The work runs on its own task: it finishes
//! (and removes its registry entry) even when every awaiting caller has gone
//! away, and the entry is gone before any awaiter observes the result.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::fetch::FetchError;

pub type SharedResult<T> = Result<T, FetchError>;

type SharedFetch<T> = Shared<BoxFuture<'static, SharedResult<T>>>;

pub struct SharedFetchRegistry<K, T>
where
    T: Clone,
{
    inflight: Arc<Mutex<HashMap<K, SharedFetch<T>>>>,
    launched: AtomicU64,
    joined: AtomicU64,
}

impl<K, T> SharedFetchRegistry<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            launched: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Await the in-flight fetch for `key`, or start one with `start`.
    ///
    /// `start` is only invoked when no fetch for `key` is in flight.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SharedResult<T>> + Send + 'static,
    {
        let fetch = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(existing) => {
                    self.joined.fetch_add(1, Ordering::Relaxed);
                    existing.clone()
                }
                None => {
                    let work = start();
                    let registry = Arc::clone(&self.inflight);
                    let done_key = key.clone();
                    let handle = tokio::spawn(async move {
                        let result = work.await;
                        registry.lock().remove(&done_key);
                        result
                    });
                    let shared = async move {
                        handle.await.unwrap_or(Err(FetchError::Cancelled))
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, shared.clone());
                    self.launched.fetch_add(1, Ordering::Relaxed);
                    shared
                }
            }
        };
        fetch.await
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }

    /// Number of fetches currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total fetches started.
    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::Relaxed)
    }

    /// Total callers that joined an existing fetch.
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

impl<K, T> Default for SharedFetchRegistry<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
