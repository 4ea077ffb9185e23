//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use super::key::QueryKey;

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was written to the cache
  pub updated_at: DateTime<Utc>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from data that was just loaded.
  pub fn from_network(data: T, updated_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      updated_at,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, updated_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      updated_at,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      updated_at: self.updated_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Loaded by this call (or by the in-flight load it joined)
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, stale; a background refresh has been started
  CacheStale,
}

/// Per-request cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
  /// How long a written value stays fresh
  pub stale_time: Duration,
  /// Mirror writes of this key to durable storage
  pub persist: bool,
  /// Speculative load; not reported as a user-visible loading state
  pub background: bool,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::minutes(5),
      persist: false,
      background: false,
    }
  }
}

impl FetchOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn persisted(mut self, persist: bool) -> Self {
    self.persist = persist;
    self
  }

  pub fn in_background(mut self) -> Self {
    self.background = true;
    self
  }
}

/// Read-only view of a cache entry handed to hooks and inspectors.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: QueryKey,
  pub value: Arc<Value>,
  pub updated_at: DateTime<Utc>,
  pub stale_time: Duration,
  pub persist: bool,
  /// Explicitly invalidated since the last write
  pub invalidated: bool,
}

impl CacheEntry {
  /// Fresh iff not invalidated and `now - updated_at < stale_time`.
  pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
    !self.invalidated && now - self.updated_at < self.stale_time
  }
}

/// Hook invoked after the cache changes an entry.
///
/// Every method runs under the cache lock, so calls arrive in the order the
/// changes were made. Implementations must return quickly and must not call
/// back into the cache.
pub trait CacheWriteHook: Send + Sync {
  /// After every write of a persistable entry.
  fn on_write(&self, _entry: &CacheEntry) {}

  /// After every key under `prefix` was marked stale.
  fn on_invalidate(&self, _prefix: &QueryKey) {}

  /// After every key under `prefix` was removed.
  fn on_evict(&self, _prefix: &QueryKey) {}
}

/// Default no-op hook used when no persistence is configured.
#[derive(Debug, Default)]
pub struct NoopHook;

impl CacheWriteHook for NoopHook {}

/// Source of wall-clock time for staleness and expiry decisions.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn advance(&self, by: Duration) {
    if let Ok(mut now) = self.now.lock() {
      *now += by;
    }
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    self.now.lock().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
  }
}
