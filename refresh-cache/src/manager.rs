//! Read-through cache with per-key single-flight.
//!
//! Every read and every background refresh goes through [`CacheManager::load`].
//! A per-key flight (an async mutex plus the settled outcome of the last
//! compute) makes sure at most one compute per key runs at a time. Callers
//! that queued behind it take the same outcome, success or failure, instead
//! of computing again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::store::{CacheEntry, CacheStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Load {
    /// Serve a fresh entry if there is one, otherwise compute.
    ReadThrough,
    /// Always compute and overwrite.
    Refresh,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("computing `{key}` failed: {cause:#}")]
    Compute { key: String, cause: anyhow::Error },
    #[error("value for `{key}` cannot be encoded: {cause}")]
    Encode {
        key: String,
        cause: serde_json::Error,
    },
}

/// What the last compute of a key produced, shared with the callers that
/// queued behind it.
#[derive(Debug, Clone)]
enum Settled {
    Value(serde_json::Value),
    Failed(String),
}

impl Settled {
    fn of<T>(result: &Result<(T, serde_json::Value), CacheError>) -> Self {
        match result {
            Ok((_, encoded)) => Settled::Value(encoded.clone()),
            Err(CacheError::Compute { cause, .. }) => Settled::Failed(format!("{cause:#}")),
            Err(e) => Settled::Failed(e.to_string()),
        }
    }

    fn into_result<T: DeserializeOwned>(self, key: &str) -> Result<T, CacheError> {
        match self {
            Settled::Value(value) => serde_json::from_value(value).map_err(|cause| CacheError::Encode {
                key: key.to_string(),
                cause,
            }),
            Settled::Failed(message) => Err(CacheError::Compute {
                key: key.to_string(),
                cause: anyhow::anyhow!(message),
            }),
        }
    }
}

#[derive(Default)]
struct Flight {
    gate: tokio::sync::Mutex<()>,
    settled: Mutex<Option<Settled>>,
}

impl Flight {
    fn settled(&self) -> Option<Settled> {
        self.settled.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn settle(&self, outcome: Settled) {
        *self.settled.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
    }
}

type FlightTable = HashMap<String, Arc<Flight>>;

pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    stale_grace: Duration,
    flights: Mutex<FlightTable>,
}

impl CacheManager {
    /// `stale_grace` is how long past expiry an entry stays around as a
    /// fallback for failed recomputes.
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, stale_grace: Duration) -> Self {
        Self {
            store,
            clock,
            stale_grace,
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.load(key, ttl, Load::ReadThrough, compute).await
    }

    pub async fn refresh<T, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.load(key, ttl, Load::Refresh, compute).await
    }

    pub async fn load<T, F, Fut>(&self, key: &str, ttl: Duration, mode: Load, compute: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if mode == Load::ReadThrough {
            if let Some(value) = self.fresh::<T>(key).await {
                debug!(key, "cache hit");
                return Ok(value);
            }
        }

        let flight = self.flight_for(key);
        let result = {
            let _guard = flight.gate.lock().await;
            // A read-through caller that queued behind a compute takes its
            // outcome. A refresh always computes.
            match flight.settled().filter(|_| mode == Load::ReadThrough) {
                Some(settled) => {
                    debug!(key, "joined in-flight compute");
                    settled.into_result(key)
                }
                None => {
                    let result = self.load_locked(key, ttl, mode, compute).await;
                    // A failed refresh leaves the stored value to the readers.
                    if mode == Load::ReadThrough || result.is_ok() {
                        flight.settle(Settled::of(&result));
                    }
                    result.map(|(value, _)| value)
                }
            }
        };
        self.release(key, &flight);
        result
    }

    /// Returns the value together with its encoded form.
    async fn load_locked<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        mode: Load,
        compute: F,
    ) -> Result<(T, serde_json::Value), CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let previous = self.read(key).await;
        let now = self.clock.now();

        if mode == Load::ReadThrough {
            if let Some(entry) = previous.as_ref().filter(|e| e.is_fresh(now)) {
                if let Some(value) = decode::<T>(entry) {
                    debug!(key, "cache filled while waiting");
                    return Ok((value, entry.value.clone()));
                }
            }
        }

        let value = match compute().await {
            Ok(value) => value,
            Err(cause) => {
                let stale = match mode {
                    Load::ReadThrough => previous.and_then(|e| decode::<T>(&e).map(|v| (v, e.value))),
                    Load::Refresh => None,
                };
                return match stale {
                    Some(stale) => {
                        warn!(key, error = %format!("{cause:#}"), "compute failed, serving stale value");
                        Ok(stale)
                    }
                    None => Err(CacheError::Compute {
                        key: key.to_string(),
                        cause,
                    }),
                };
            }
        };

        let encoded = serde_json::to_value(&value).map_err(|cause| CacheError::Encode {
            key: key.to_string(),
            cause,
        })?;
        let stored_at = self.clock.now();
        let entry = CacheEntry {
            key: key.to_string(),
            value: encoded.clone(),
            stored_at,
            expires_at: clock::add(stored_at, ttl),
        };
        if let Err(e) = self.store.save(&entry, ttl + self.stale_grace).await {
            warn!(key, error = %e, "cache write failed");
        } else {
            info!(key, ttl_secs = ttl.as_secs(), ?mode, "cache entry stored");
        }
        Ok((value, encoded))
    }

    async fn fresh<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.read(key).await?;
        if !entry.is_fresh(self.clock.now()) {
            return None;
        }
        decode(&entry)
    }

    /// Store failures count as a miss.
    async fn read(&self, key: &str) -> Option<CacheEntry> {
        match self.store.load(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "cache read failed");
                None
            }
        }
    }

    fn flight_for(&self, key: &str) -> Arc<Flight> {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Drop the key's flight once nobody else holds a handle to it, so the
    /// next miss starts a new one.
    fn release(&self, key: &str, flight: &Arc<Flight>) {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        // One handle in the table, one held by the caller.
        if Arc::strong_count(flight) <= 2 {
            flights.remove(key);
        }
    }

    #[cfg(test)]
    fn flight_count(&self) -> usize {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn decode<T: DeserializeOwned>(entry: &CacheEntry) -> Option<T> {
    match serde_json::from_value(entry.value.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %entry.key, error = %e, "cached value has an unexpected shape");
            None
        }
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
