//! Token-bucket rate limiting for new sessions, keyed by client IP.
//!
//! Every accepted connection passes through a small family of named buckets
//! before the handshake starts. A bucket admits `max` hits per rolling
//! window; all buckets are consulted on every check, and a rejection reports
//! the longest remaining wait among the buckets that refused. Buckets that
//! would have admitted the hit still count it, so the hourly bucket keeps
//! filling while the per-minute bucket is rejecting.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

/// Entries processed between cooperative yields during a sweep.
const SWEEP_YIELD_EVERY: usize = 32;

/// How often the background sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A rejected check: which bucket refused and how long until it would not.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("too many connections ({bucket}), try again in {} seconds", .retry_after.as_secs().max(1))]
pub struct RateLimited {
    pub bucket: &'static str,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    window_start: Instant,
    count: u32,
}

/// One named bucket: `max` hits per `window` for each key independently.
pub struct RateLimitBucket<K> {
    name: &'static str,
    max: u32,
    window: Duration,
    entries: RwLock<HashMap<K, RateLimitEntry>>,
}

impl<K: Eq + Hash + Clone> RateLimitBucket<K> {
    pub fn new(name: &'static str, max: u32, window: Duration) -> Self {
        Self {
            name,
            max,
            window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Counts one hit for `key`, or reports how long the key must wait.
    async fn try_acquire(&self, key: &K, now: Instant) -> Result<(), RateLimited> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.clone(),
                    RateLimitEntry {
                        window_start: now,
                        count: 1,
                    },
                );
                Ok(())
            }
            Some(entry) if now.duration_since(entry.window_start) >= self.window => {
                entry.window_start = now;
                entry.count = 1;
                Ok(())
            }
            Some(entry) if entry.count < self.max => {
                entry.count += 1;
                Ok(())
            }
            Some(entry) => Err(RateLimited {
                bucket: self.name,
                retry_after: (entry.window_start + self.window).saturating_duration_since(now),
            }),
        }
    }

    /// Rolls every key's window forward and drops keys whose debt is paid.
    ///
    /// Counts are reduced by `max` per fully elapsed window rather than
    /// simply cleared, so a key that burst far over its hourly budget keeps
    /// waiting across several sweep rounds. Yields the executor thread every
    /// [`SWEEP_YIELD_EVERY`] entries; the write guard stays held, which is
    /// fine because the yield is for unrelated tasks, not for contenders.
    async fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut expired = Vec::new();
        let mut checked = 0usize;
        for (key, entry) in entries.iter_mut() {
            let elapsed_windows =
                (now.saturating_duration_since(entry.window_start).as_millis()
                    / self.window.as_millis().max(1)) as u32;
            if elapsed_windows > 0 {
                let debt = u64::from(elapsed_windows) * u64::from(self.max);
                if u64::from(entry.count) <= debt {
                    expired.push(key.clone());
                } else {
                    entry.count -= debt as u32;
                    entry.window_start += self.window * elapsed_windows;
                }
            }
            checked += 1;
            if checked % SWEEP_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        for key in expired {
            entries.remove(&key);
        }
    }
}

/// A family of buckets checked together under one key type.
pub struct RateLimiter<K> {
    buckets: Vec<RateLimitBucket<K>>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(buckets: Vec<RateLimitBucket<K>>) -> Self {
        Self { buckets }
    }

    /// Checks every bucket for `key`. On rejection the error carries the
    /// longest remaining wait among the refusing buckets; buckets that
    /// admitted the hit have already counted it.
    pub async fn check(&self, key: &K) -> Result<(), RateLimited> {
        let now = Instant::now();
        let mut worst: Option<RateLimited> = None;
        for bucket in &self.buckets {
            if let Err(limited) = bucket.try_acquire(key, now).await {
                match &worst {
                    Some(current) if current.retry_after >= limited.retry_after => {}
                    _ => worst = Some(limited),
                }
            }
        }
        match worst {
            Some(limited) => Err(limited),
            None => Ok(()),
        }
    }

    /// Sweeps all buckets once. See [`RateLimitBucket::sweep`].
    pub async fn sweep(&self) {
        for bucket in &self.buckets {
            bucket.sweep().await;
        }
    }

    /// Spawns the periodic sweep so idle keys are reclaimed without traffic.
    pub fn start_sweep_task(self: Arc<Self>)
    where
        K: Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        });
    }

    #[cfg(test)]
    async fn bucket_count(&self, bucket: usize, key: &K) -> Option<u32> {
        let entries = self.buckets[bucket].entries.read().await;
        entries.get(key).map(|e| e.count)
    }
}

/// The bucket family protecting session creation: 20 connections per minute
/// and 400 per hour from any one address.
pub fn connection_limiter() -> RateLimiter<IpAddr> {
    RateLimiter::new(vec![
        RateLimitBucket::new("connections per minute", 20, Duration::from_secs(60)),
        RateLimitBucket::new("connections per hour", 400, Duration::from_secs(60 * 60)),
    ])
}
