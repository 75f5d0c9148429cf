//! Fingerprint-keyed memoization with single-flight admission.
//!
//! Payloads live in the injected [`SharedStore`]. A miss registers a flight in
//! an in-process table while holding its lock, so a second caller for the same
//! fingerprint always joins the running computation instead of starting one.
//! Flights run as detached tasks: a caller that gives up (timeout, job
//! cancellation) does not abort the computation, whose result is still cached.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ciq_core::Fingerprint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::{SharedStore, StoreError};

const ENTRY_PREFIX: &str = "cache:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    /// Competitive-analysis reports.
    Short,
    /// AI-generated insights.
    Medium,
    /// Raw product metrics.
    Long,
}

impl TtlClass {
    pub fn ttl(&self) -> Duration {
        const HOUR: u64 = 60 * 60;
        match self {
            Self::Short => Duration::from_secs(2 * HOUR),
            Self::Medium => Duration::from_secs(12 * HOUR),
            Self::Long => Duration::from_secs(24 * HOUR),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CacheError<E> {
    #[error("computation failed: {0}")]
    Compute(E),
    #[error("computation for {0} ended without a result")]
    Abandoned(String),
    #[error("cache payload codec error: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: usize,
    pub hit_ratio: f64,
}

type FlightOutcome<E> = Result<Arc<Vec<u8>>, CacheError<E>>;
type FlightReceiver<E> = watch::Receiver<Option<FlightOutcome<E>>>;

struct CacheInner<E> {
    store: Arc<dyn SharedStore>,
    in_flight: Mutex<HashMap<String, FlightReceiver<E>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Removes the flight registration however the flight task ends.
struct FlightGuard<E> {
    inner: Arc<CacheInner<E>>,
    key: String,
}

impl<E> Drop for FlightGuard<E> {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct CacheLayer<E> {
    inner: Arc<CacheInner<E>>,
}

impl<E> Clone for CacheLayer<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> fmt::Debug for CacheLayer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLayer")
            .field("hits", &self.inner.hits.load(Ordering::Relaxed))
            .field("misses", &self.inner.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<E> CacheLayer<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                in_flight: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    fn entry_key(fingerprint: &Fingerprint) -> String {
        format!("{ENTRY_PREFIX}{fingerprint}")
    }

    /// Returns the cached payload for `fingerprint`, running `compute` at most
    /// once across all concurrent callers when it is absent. Failures are
    /// handed to every waiter and never stored.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: TtlClass,
        compute: F,
    ) -> Result<Vec<u8>, CacheError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, E>> + Send + 'static,
    {
        self.resolve(fingerprint, ttl, move || async move {
            compute().await.map_err(CacheError::Compute)
        })
        .await
    }

    /// Typed variant of [`CacheLayer::get_or_compute`] storing JSON payloads.
    pub async fn get_or_compute_json<T, F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: TtlClass,
        compute: F,
    ) -> Result<T, CacheError<E>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let payload = self
            .resolve(fingerprint, ttl, move || async move {
                match compute().await {
                    Ok(value) => serde_json::to_vec(&value)
                        .map_err(|err| CacheError::Codec(err.to_string())),
                    Err(err) => Err(CacheError::Compute(err)),
                }
            })
            .await?;
        serde_json::from_slice(&payload).map_err(|err| CacheError::Codec(err.to_string()))
    }

    async fn resolve<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: TtlClass,
        compute: F,
    ) -> Result<Vec<u8>, CacheError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, CacheError<E>>> + Send + 'static,
    {
        let key = Self::entry_key(fingerprint);
        match self.inner.store.get(&key).await {
            Ok(Some(payload)) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                debug!(%fingerprint, "cache hit");
                return Ok(payload);
            }
            Ok(None) => {}
            Err(err) => warn!(%fingerprint, error = %err, "cache read failed; treating as miss"),
        }

        let receiver = self.join_or_lead(key.clone(), ttl, compute);
        Self::await_flight(receiver, &key).await
    }

    fn join_or_lead<F, Fut>(&self, key: String, ttl: TtlClass, compute: F) -> FlightReceiver<E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, CacheError<E>>> + Send + 'static,
    {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(receiver) = in_flight.get(&key) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "cache single-flight join");
            return receiver.clone();
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        debug!(%key, "cache single-flight lead");
        let (sender, receiver) = watch::channel(None);
        in_flight.insert(key.clone(), receiver.clone());
        drop(in_flight);

        let guard = FlightGuard {
            inner: Arc::clone(&self.inner),
            key,
        };
        tokio::spawn(async move {
            let outcome = Self::run_flight(&guard, ttl, compute).await;
            // Unregister before publishing so a failed flight is retried by the
            // next caller rather than joined.
            drop(guard);
            let _ = sender.send(Some(outcome));
        });
        receiver
    }

    async fn run_flight<F, Fut>(guard: &FlightGuard<E>, ttl: TtlClass, compute: F) -> FlightOutcome<E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, CacheError<E>>> + Send + 'static,
    {
        let store = &guard.inner.store;
        // A previous flight may have landed between our miss and our lead.
        if let Ok(Some(payload)) = store.get(&guard.key).await {
            return Ok(Arc::new(payload));
        }

        let payload = compute().await?;
        if let Err(err) = store.set(&guard.key, payload.clone(), Some(ttl.ttl())).await {
            warn!(key = %guard.key, error = %err, "cache write failed; returning uncached value");
        }
        Ok(Arc::new(payload))
    }

    async fn await_flight(mut receiver: FlightReceiver<E>, key: &str) -> Result<Vec<u8>, CacheError<E>> {
        loop {
            let current = receiver.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome.map(|payload| payload.as_ref().clone());
            }
            if receiver.changed().await.is_err() {
                let last = receiver.borrow().clone();
                return match last {
                    Some(outcome) => outcome.map(|payload| payload.as_ref().clone()),
                    None => Err(CacheError::Abandoned(key.to_string())),
                };
            }
        }
    }

    /// Removes every entry whose fingerprint starts with `prefix`.
    pub async fn evict(&self, prefix: &str) -> Result<usize, StoreError> {
        let removed = self
            .inner
            .store
            .delete_prefix(&format!("{ENTRY_PREFIX}{prefix}"))
            .await?;
        info!(prefix, removed, "cache entries evicted");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let entry_count = self.inner.store.count_prefix(ENTRY_PREFIX).await?;
        let total = hits + misses;
        let hit_ratio = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        Ok(CacheStats {
            hits,
            misses,
            entry_count,
            hit_ratio,
        })
    }
}
