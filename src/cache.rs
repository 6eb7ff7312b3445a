use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::time::Instant;

use crate::Error;

/// Produces the wire bytes for a cache miss.
pub type Generator = BoxFuture<'static, Result<Bytes, Error>>;

/// Result shared by every caller resolving the same key.
pub type SharedResult = Result<Option<Bytes>, Arc<Error>>;

/// Fetch-or-compute store for serialized mock responses.
///
/// Implementations must run at most one generator per key at a time:
/// concurrent callers for a missing key wait for the in-flight generation and
/// observe its result or its error.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Returns the cached bytes for `key`, running `generate` on a miss and
    /// storing its output for `expiration`.
    async fn fetch_or_compute(
        &self,
        key: &str,
        expiration: Duration,
        generate: Generator,
    ) -> SharedResult;
}

type InFlight = Shared<BoxFuture<'static, Result<Bytes, Arc<Error>>>>;

enum Slot {
    Ready { value: Bytes, expires_at: Instant },
    Pending(InFlight),
}

/// In-process [`ResponseCache`] with per-entry expiration.
#[derive(Default)]
pub struct MemoryCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, ready or in flight. Expired entries are evicted on
    /// the next miss.
    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry. In-flight generations still complete for their waiters.
    pub fn clear(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.clear();
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Slot>>, Arc<Error>> {
        self.slots
            .lock()
            .map_err(|_| Arc::new(Error::CachePoisoned))
    }

    /// Finds a live entry or joins or starts the generation for `key`.
    fn resolve(&self, key: &str, generate: Generator) -> Result<Resolution, Arc<Error>> {
        let mut slots = self.lock()?;
        let now = Instant::now();
        match slots.get(key) {
            Some(Slot::Ready { value, expires_at }) if *expires_at > now => {
                return Ok(Resolution::Hit(value.clone()));
            }
            Some(Slot::Pending(in_flight)) => return Ok(Resolution::Wait(in_flight.clone())),
            _ => {}
        }

        slots.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::Pending(_) => true,
        });

        #[cfg(feature = "tracing")]
        tracing::trace!(key, "mock cache miss, generating");

        // Panics become errors so the slot is released.
        let in_flight = AssertUnwindSafe(generate)
            .catch_unwind()
            .map(|outcome| match outcome {
                Ok(result) => result.map_err(Arc::new),
                Err(_) => Err(Arc::new(Error::GeneratorPanicked)),
            })
            .boxed()
            .shared();
        slots.insert(key.to_owned(), Slot::Pending(in_flight.clone()));
        Ok(Resolution::Wait(in_flight))
    }

    /// Publishes the outcome of `in_flight` if it is still the pending entry.
    fn settle(
        &self,
        key: &str,
        in_flight: &InFlight,
        outcome: &Result<Bytes, Arc<Error>>,
        expiration: Duration,
    ) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let current = matches!(slots.get(key), Some(Slot::Pending(p)) if p.ptr_eq(in_flight));
        if !current {
            return;
        }
        match outcome {
            Ok(value) => {
                slots.insert(
                    key.to_owned(),
                    Slot::Ready {
                        value: value.clone(),
                        expires_at: Instant::now() + expiration,
                    },
                );
            }
            Err(_) => {
                slots.remove(key);
            }
        }
    }
}

enum Resolution {
    Hit(Bytes),
    Wait(InFlight),
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn fetch_or_compute(
        &self,
        key: &str,
        expiration: Duration,
        generate: Generator,
    ) -> SharedResult {
        let in_flight = match self.resolve(key, generate)? {
            Resolution::Hit(value) => return Ok(Some(value)),
            Resolution::Wait(in_flight) => in_flight,
        };
        let outcome = in_flight.clone().await;
        self.settle(key, &in_flight, &outcome, expiration);
        outcome.map(Some)
    }
}
