//! Fingerprint cache with single-flight population.
//!
//! A slot is either `Ready` (immutable value + expiry) or `Pending` (a
//! computation in flight). The first caller for a fingerprint becomes the
//! leader and installs a `Pending` slot; concurrent callers follow it by
//! waiting on its watch channel instead of recomputing.
//!
//! - Successful values are stored until `now + ttl`. Expiry is checked on
//!   every read, so nothing is served late even if the sweep has not run.
//! - Errors are handed to the current followers but never stored.
//! - A leader that is cancelled abandons its slot without publishing;
//!   followers then retry and one of them leads.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::fingerprint::Fingerprint;

type Flight<V, E> = watch::Receiver<Option<Result<V, E>>>;

enum Slot<V, E> {
    Ready { value: V, expires_at: Instant },
    Pending { flight: u64, rx: Flight<V, E> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError<E> {
    Cancelled,
    Compute(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CacheError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled while waiting for the cache"),
            Self::Compute(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CacheError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cancelled => None,
            Self::Compute(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Callers that waited on another caller's computation.
    pub coalesced: u64,
    /// Entries found expired on read or removed by a sweep.
    pub expired: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    expired: AtomicU64,
}

enum Join<V, E> {
    Done(Result<(V, bool), CacheError<E>>),
    Lead(watch::Sender<Option<Result<V, E>>>, u64),
    /// The followed leader abandoned its flight.
    Retry,
}

enum Lookup<V, E> {
    Expired,
    Missing,
    Follow(Flight<V, E>),
}

pub struct FingerprintCache<V, E> {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot<V, E>>>,
    next_flight: AtomicU64,
    counters: Counters,
}

impl<V, E> std::fmt::Debug for FingerprintCache<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintCache")
            .field("ttl", &self.ttl)
            .field(
                "entries",
                &self.slots.lock().unwrap_or_else(PoisonError::into_inner).len(),
            )
            .finish()
    }
}

impl<V, E> FingerprintCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<V, E>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `(value, reused)`. `reused` is false only for the caller
    /// whose `compute` produced the value.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &Fingerprint,
        cancel: &CancelToken,
        compute: F,
    ) -> Result<(V, bool), CacheError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (tx, flight) = loop {
            match self.join(&key.hex, cancel).await {
                Join::Done(outcome) => return outcome,
                Join::Lead(tx, flight) => break (tx, flight),
                Join::Retry => continue,
            }
        };

        let mut guard = FlightGuard {
            cache: self,
            key: &key.hex,
            flight,
            armed: true,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = compute() => Some(r),
        };

        match result {
            // Abandon: the guard drops the pending slot and `tx` goes away
            // unsent, so followers start over.
            None => Err(CacheError::Cancelled),
            Some(Err(_)) if cancel.is_cancelled() => Err(CacheError::Cancelled),
            Some(Ok(value)) => {
                {
                    let mut slots = self.lock();
                    if self.owns(&slots, &key.hex, flight) {
                        slots.insert(
                            key.hex.clone(),
                            Slot::Ready {
                                value: value.clone(),
                                expires_at: Instant::now() + self.ttl,
                            },
                        );
                    }
                    guard.armed = false;
                }
                tx.send_replace(Some(Ok(value.clone())));
                Ok((value, false))
            }
            Some(Err(e)) => {
                drop(guard);
                tx.send_replace(Some(Err(e.clone())));
                Err(CacheError::Compute(e))
            }
        }
    }

    /// Look the key up: serve a live entry, follow a flight, or become leader.
    async fn join(&self, key: &str, cancel: &CancelToken) -> Join<V, E> {
        if cancel.is_cancelled() {
            return Join::Done(Err(CacheError::Cancelled));
        }

        let rx = {
            let mut slots = self.lock();
            let now = Instant::now();
            let lookup = match slots.get(key) {
                Some(Slot::Ready { value, expires_at }) if now < *expires_at => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Join::Done(Ok((value.clone(), true)));
                }
                Some(Slot::Ready { .. }) => Lookup::Expired,
                Some(Slot::Pending { rx, .. }) => Lookup::Follow(rx.clone()),
                None => Lookup::Missing,
            };
            match lookup {
                Lookup::Follow(rx) => rx,
                Lookup::Expired => {
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                    return self.lead(&mut slots, key);
                }
                Lookup::Missing => return self.lead(&mut slots, key),
            }
        };

        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Join::Done(Err(CacheError::Cancelled)),
            outcome = wait_flight(rx) => outcome,
        };
        match outcome {
            Some(Ok(value)) => Join::Done(Ok((value, true))),
            Some(Err(e)) => Join::Done(Err(CacheError::Compute(e))),
            None => {
                debug!(key, "single-flight leader abandoned, retrying");
                Join::Retry
            }
        }
    }

    fn lead(&self, slots: &mut HashMap<String, Slot<V, E>>, key: &str) -> Join<V, E> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let flight = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        slots.insert(key.to_string(), Slot::Pending { flight, rx });
        Join::Lead(tx, flight)
    }

    fn owns(&self, slots: &HashMap<String, Slot<V, E>>, key: &str, flight: u64) -> bool {
        match slots.get(key) {
            Some(Slot::Pending { flight: f, .. }) => *f == flight,
            Some(Slot::Ready { .. }) => false,
            None => true,
        }
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => now < *expires_at,
            Slot::Pending { .. } => true,
        });
        let removed = before - slots.len();
        if removed > 0 {
            self.counters
                .expired
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = slots.len(), "swept expired fingerprints");
        }
        removed
    }

    /// Periodic sweep. The task holds only a weak reference and exits once
    /// the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                }
            }
        })
    }

    /// Number of slots, pending ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

async fn wait_flight<V: Clone, E: Clone>(mut rx: Flight<V, E>) -> Option<Result<V, E>> {
    match rx.wait_for(Option::is_some).await {
        Ok(published) => published.clone(),
        Err(_) => None,
    }
}

/// Removes the leader's pending slot unless disarmed after publishing.
struct FlightGuard<'a, V, E> {
    cache: &'a FingerprintCache<V, E>,
    key: &'a str,
    flight: u64,
    armed: bool,
}

impl<V, E> Drop for FlightGuard<'_, V, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self
            .cache
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(slots.get(self.key), Some(Slot::Pending { flight, .. }) if *flight == self.flight)
        {
            slots.remove(self.key);
        }
    }
}
