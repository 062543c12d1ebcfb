//! Name-keyed token buckets with rolling windows.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

/// A registry of named buckets, each allowing `limit` acquisitions per
/// rolling `window`. Buckets are cheap and never evicted.
#[derive(Debug, Default)]
pub struct BucketStore {
    buckets: DashMap<String, Arc<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    limit: usize,
    window: Duration,
    /// Timestamps of acquisitions inside the current window, oldest first.
    used: Mutex<VecDeque<Instant>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a bucket exists. Creating an existing bucket is a no-op;
    /// the original limits win.
    pub fn create(&self, name: &str, limit: usize, window: Duration) {
        self.buckets
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Bucket {
                    limit,
                    window,
                    used: Mutex::new(VecDeque::new()),
                })
            });
    }

    /// Block until the named bucket has a free slot, then consume it.
    /// Waiting on a bucket that was never created returns immediately.
    pub async fn wait(&self, name: &str) {
        let Some(bucket) = self.buckets.get(name).map(|b| Arc::clone(&b)) else {
            tracing::warn!(bucket = name, "waited on a bucket that does not exist");
            return;
        };

        loop {
            let sleep_until = {
                let mut used = bucket.used.lock();
                let now = Instant::now();
                while let Some(front) = used.front() {
                    if now.duration_since(*front) >= bucket.window {
                        used.pop_front();
                    } else {
                        break;
                    }
                }

                if used.len() < bucket.limit {
                    used.push_back(now);
                    return;
                }

                // Oldest acquisition leaves the window first. A bucket
                // with limit zero never admits anyone inside a window.
                match used.front() {
                    Some(oldest) => *oldest + bucket.window,
                    None => now + bucket.window,
                }
            };

            tokio::time::sleep_until(sleep_until).await;
        }
    }

    /// Clear the used count of a bucket. No-op for unknown names.
    pub fn reset(&self, name: &str) {
        if let Some(bucket) = self.buckets.get(name) {
            bucket.used.lock().clear();
        }
    }

    /// Number of slots consumed inside the current window.
    pub fn used(&self, name: &str) -> usize {
        match self.buckets.get(name) {
            Some(bucket) => {
                let mut used = bucket.used.lock();
                let now = Instant::now();
                while let Some(front) = used.front() {
                    if now.duration_since(*front) >= bucket.window {
                        used.pop_front();
                    } else {
                        break;
                    }
                }
                used.len()
            }
            None => 0,
        }
    }
}
