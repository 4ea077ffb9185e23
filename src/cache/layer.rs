//! Query cache that orchestrates freshness, load de-duplication and invalidation.

use chrono::{DateTime, Duration, Utc};
use color_eyre::eyre::{eyre, Report};
use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::key::QueryKey;
use super::traits::{
  CacheEntry, CacheResult, CacheWriteHook, Clock, FetchOptions, NoopHook, SystemClock,
};

/// Loader failure shared by every caller that waited on the same load.
#[derive(Debug, Clone)]
pub struct LoadError(Arc<Report>);

impl LoadError {
  fn new(report: Report) -> Self {
    Self(Arc::new(report))
  }

  /// The report produced by the loader.
  pub fn report(&self) -> &Report {
    &self.0
  }
}

impl fmt::Display for LoadError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#}", self.0)
  }
}

impl std::error::Error for LoadError {}

type LoadOutcome = std::result::Result<(Arc<Value>, DateTime<Utc>), LoadError>;
type SharedLoad = Shared<BoxFuture<'static, LoadOutcome>>;

struct InFlight {
  id: u64,
  /// Slot generation the load started under
  generation: u64,
  load: SharedLoad,
  /// Set once any non-background caller starts or joins the load
  foreground: bool,
}

#[derive(Default)]
struct Slot {
  entry: Option<CacheEntry>,
  in_flight: Option<InFlight>,
  /// Bumped by invalidate/evict/set; a load that started under an older
  /// generation lands already stale.
  generation: u64,
  subscribers: usize,
  last_active: DateTime<Utc>,
}

impl Slot {
  fn is_idle(&self) -> bool {
    self.subscribers == 0 && self.in_flight.is_none()
  }
}

#[derive(Default)]
struct Counters {
  hits: AtomicU64,
  stale_hits: AtomicU64,
  misses: AtomicU64,
}

/// Read counters of a [`QueryCache`], foreground reads only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// Served a fresh value without loading
  pub hits: u64,
  /// Served a stale value while a refresh ran in the background
  pub stale_hits: u64,
  /// Had to wait for a load
  pub misses: u64,
}

impl CacheStats {
  /// Share of reads answered from the cache, `None` before the first read.
  pub fn hit_rate(&self) -> Option<f64> {
    let served = self.hits + self.stale_hits;
    let total = served + self.misses;
    (total > 0).then(|| served as f64 / total as f64)
  }
}

struct Inner {
  slots: Mutex<HashMap<QueryKey, Slot>>,
  clock: Arc<dyn Clock>,
  hook: Mutex<Arc<dyn CacheWriteHook>>,
  gc_time: Duration,
  next_load_id: AtomicU64,
  counters: Counters,
}

/// In-memory query cache shared by every consumer in the process.
///
/// Cloning is cheap; clones share the same state. All mutation goes through
/// the methods below and the internal lock is never held across an await.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

impl QueryCache {
  /// Create a cache that collects idle entries after `gc_time`.
  pub fn new(gc_time: Duration) -> Self {
    Self::with_clock(gc_time, Arc::new(SystemClock))
  }

  pub fn with_clock(gc_time: Duration, clock: Arc<dyn Clock>) -> Self {
    Self {
      inner: Arc::new(Inner {
        slots: Mutex::new(HashMap::new()),
        clock,
        hook: Mutex::new(Arc::new(NoopHook)),
        gc_time,
        next_load_id: AtomicU64::new(1),
        counters: Counters::default(),
      }),
    }
  }

  /// Install the hook notified after persistable writes, replacing any previous one.
  pub fn set_write_hook(&self, hook: Arc<dyn CacheWriteHook>) {
    *self
      .inner
      .hook
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = hook;
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  /// Return the cached value if fresh, otherwise load it.
  ///
  /// Concurrent calls for a key that is already loading join the in-flight
  /// load instead of invoking their own loader. Loader errors are returned
  /// to every waiter and never cached; an existing stale value is kept.
  pub async fn get_or_fetch<F, Fut>(
    &self,
    key: &QueryKey,
    loader: F,
    options: FetchOptions,
  ) -> Result<CacheResult<Arc<Value>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let load = {
      let mut slots = self.lock();
      let now = self.now();
      let slot = slots.entry(key.clone()).or_default();
      slot.last_active = now;

      if let Some(entry) = &slot.entry {
        if entry.is_fresh_at(now) {
          trace!(key = %key, "cache hit");
          self.count(&self.inner.counters.hits, options);
          return Ok(CacheResult::from_cache(
            Arc::clone(&entry.value),
            entry.updated_at,
            false,
          ));
        }
      }

      self.count(&self.inner.counters.misses, options);
      self.join_or_start(key, slot, loader, options)
    };

    Self::await_load(load).await
  }

  /// Stale-while-revalidate read.
  ///
  /// A stale value is returned immediately while a background refresh runs;
  /// only a missing value makes the caller wait for the loader.
  pub async fn get_revalidating<F, Fut>(
    &self,
    key: &QueryKey,
    loader: F,
    options: FetchOptions,
  ) -> Result<CacheResult<Arc<Value>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let load = {
      let mut slots = self.lock();
      let now = self.now();
      let slot = slots.entry(key.clone()).or_default();
      slot.last_active = now;

      let cached = slot
        .entry
        .as_ref()
        .map(|e| (Arc::clone(&e.value), e.updated_at, e.is_fresh_at(now)));

      if let Some((value, updated_at, fresh)) = cached {
        if fresh {
          self.count(&self.inner.counters.hits, options);
        } else {
          debug!(key = %key, "serving stale value while revalidating");
          self.count(&self.inner.counters.stale_hits, options);
          // The refresh drives itself; its result lands in the cache.
          let _ = self.join_or_start(key, slot, loader, options.in_background());
        }
        return Ok(CacheResult::from_cache(value, updated_at, !fresh));
      }

      self.count(&self.inner.counters.misses, options);
      self.join_or_start(key, slot, loader, options)
    };

    Self::await_load(load).await
  }

  /// Invalidate `key`, then load it again.
  ///
  /// Unlike [`get_or_fetch`](Self::get_or_fetch) this never joins a load
  /// that started before the invalidation; such a load still completes for
  /// its own waiters and lands stale.
  pub async fn refetch<F, Fut>(
    &self,
    key: &QueryKey,
    loader: F,
    options: FetchOptions,
  ) -> Result<CacheResult<Arc<Value>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    self.invalidate(key);
    let load = {
      let mut slots = self.lock();
      let slot = slots.entry(key.clone()).or_default();
      slot.last_active = self.now();
      if slot
        .in_flight
        .as_ref()
        .is_some_and(|in_flight| in_flight.generation != slot.generation)
      {
        debug!(key = %key, "superseding load started before invalidation");
        slot.in_flight = None;
      }
      self.count(&self.inner.counters.misses, options);
      self.join_or_start(key, slot, loader, options)
    };

    Self::await_load(load).await
  }

  /// Mark every entry under `prefix` stale without dropping its value.
  ///
  /// Loads in flight for matching keys will land stale. Returns the number of
  /// cached entries marked.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    let marked = {
      let mut slots = self.lock();
      let mut marked = 0;
      for (_, slot) in slots.iter_mut().filter(|(k, _)| k.starts_with(prefix)) {
        slot.generation += 1;
        if let Some(entry) = &mut slot.entry {
          entry.invalidated = true;
          marked += 1;
        }
      }
      self.hook().on_invalidate(prefix);
      marked
    };
    debug!(prefix = %prefix, marked, "invalidated");
    marked
  }

  /// Remove every entry under `prefix`. Returns the number of values dropped.
  pub fn evict(&self, prefix: &QueryKey) -> usize {
    let removed = {
      let mut slots = self.lock();
      let mut removed = 0;
      slots.retain(|key, slot| {
        if !key.starts_with(prefix) {
          return true;
        }
        if slot.entry.take().is_some() {
          removed += 1;
        }
        slot.generation += 1;
        !slot.is_idle()
      });
      self.hook().on_evict(prefix);
      removed
    };
    debug!(prefix = %prefix, removed, "evicted");
    removed
  }

  /// Write a value directly, e.g. the row returned by a mutation.
  pub fn set(&self, key: &QueryKey, value: Value, options: FetchOptions) -> CacheEntry {
    let mut slots = self.lock();
    let now = self.now();
    let slot = slots.entry(key.clone()).or_default();
    slot.generation += 1;
    slot.last_active = now;
    let entry = CacheEntry {
      key: key.clone(),
      value: Arc::new(value),
      updated_at: now,
      stale_time: options.stale_time,
      persist: options.persist,
      invalidated: false,
    };
    slot.entry = Some(entry.clone());
    self.notify_write(&entry);
    entry
  }

  /// Install an already-resolved entry with its original timestamp and
  /// invalidation mark.
  ///
  /// Used when replaying durable snapshots. Does not notify the write hook and
  /// never replaces an entry written at or after `updated_at`.
  pub fn hydrate(
    &self,
    key: &QueryKey,
    value: Value,
    updated_at: DateTime<Utc>,
    stale_time: Duration,
    invalidated: bool,
  ) -> bool {
    let mut slots = self.lock();
    let slot = slots.entry(key.clone()).or_default();
    if slot
      .entry
      .as_ref()
      .is_some_and(|existing| existing.updated_at >= updated_at)
    {
      return false;
    }
    slot.last_active = self.now();
    slot.entry = Some(CacheEntry {
      key: key.clone(),
      value: Arc::new(value),
      updated_at,
      stale_time,
      persist: true,
      invalidated,
    });
    true
  }

  /// Current entry for `key`, fresh or not, without loading.
  pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.lock().get(key).and_then(|slot| slot.entry.clone())
  }

  pub fn is_fresh(&self, key: &QueryKey) -> bool {
    let now = self.now();
    self
      .lock()
      .get(key)
      .and_then(|slot| slot.entry.as_ref())
      .is_some_and(|entry| entry.is_fresh_at(now))
  }

  /// Whether any load (foreground or background) is in flight for `key`.
  pub fn is_fetching(&self, key: &QueryKey) -> bool {
    self
      .lock()
      .get(key)
      .is_some_and(|slot| slot.in_flight.is_some())
  }

  /// Whether a user-visible load is in flight for `key`.
  ///
  /// Background (prefetch) loads are not a loading state until a foreground
  /// caller joins them.
  pub fn is_loading(&self, key: &QueryKey) -> bool {
    self
      .lock()
      .get(key)
      .and_then(|slot| slot.in_flight.as_ref())
      .is_some_and(|in_flight| in_flight.foreground)
  }

  /// Number of cached values.
  pub fn len(&self) -> usize {
    self
      .lock()
      .values()
      .filter(|slot| slot.entry.is_some())
      .count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    let counters = &self.inner.counters;
    CacheStats {
      hits: counters.hits.load(Ordering::Relaxed),
      stale_hits: counters.stale_hits.load(Ordering::Relaxed),
      misses: counters.misses.load(Ordering::Relaxed),
    }
  }

  /// Keys that currently hold a value.
  pub fn keys(&self) -> Vec<QueryKey> {
    self
      .lock()
      .iter()
      .filter(|(_, slot)| slot.entry.is_some())
      .map(|(key, _)| key.clone())
      .collect()
  }

  /// Register interest in `key`; the entry is not collected while any
  /// subscription is alive.
  pub fn subscribe(&self, key: &QueryKey) -> Subscription {
    let mut slots = self.lock();
    let slot = slots.entry(key.clone()).or_default();
    slot.subscribers += 1;
    slot.last_active = self.now();
    Subscription {
      cache: self.clone(),
      key: key.clone(),
    }
  }

  /// Drop entries that have had no subscriber, no load and no access for
  /// longer than the idle budget. Returns the number of keys removed.
  pub fn collect_garbage(&self) -> usize {
    let now = self.now();
    let gc_time = self.inner.gc_time;
    let mut slots = self.lock();
    let before = slots.len();
    slots.retain(|_, slot| !slot.is_idle() || now - slot.last_active < gc_time);
    let removed = before - slots.len();
    if removed > 0 {
      debug!(removed, "collected idle cache entries");
    }
    removed
  }

  /// Run [`collect_garbage`](Self::collect_garbage) every `interval` until the
  /// cache is dropped.
  pub fn spawn_gc(&self, interval: std::time::Duration) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        QueryCache { inner }.collect_garbage();
      }
    })
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, Slot>> {
    self
      .inner
      .slots
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Join the load in flight for this slot or start a new one.
  ///
  /// The loader only builds the future; it runs on its own task so that the
  /// result is cached even if every caller goes away.
  fn join_or_start<F, Fut>(
    &self,
    key: &QueryKey,
    slot: &mut Slot,
    loader: F,
    options: FetchOptions,
  ) -> SharedLoad
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    if let Some(in_flight) = &mut slot.in_flight {
      trace!(key = %key, "joining in-flight load");
      in_flight.foreground |= !options.background;
      return in_flight.load.clone();
    }

    let id = self.inner.next_load_id.fetch_add(1, Ordering::Relaxed);
    let generation = slot.generation;
    let fut = loader();
    let cache = self.clone();
    let task_key = key.clone();

    debug!(key = %key, background = options.background, "starting load");
    let handle = tokio::spawn(async move {
      let result = fut.await;
      cache.complete(task_key, id, generation, result, options)
    });

    let load = async move {
      match handle.await {
        Ok(outcome) => outcome,
        Err(e) => Err(LoadError::new(eyre!("Load task failed: {}", e))),
      }
    }
    .boxed()
    .shared();

    slot.in_flight = Some(InFlight {
      id,
      generation,
      load: load.clone(),
      foreground: !options.background,
    });
    load
  }

  /// Record the outcome of load `id` and release the in-flight marker.
  fn complete(
    &self,
    key: QueryKey,
    id: u64,
    generation: u64,
    result: Result<Value>,
    options: FetchOptions,
  ) -> LoadOutcome {
    let now = self.now();
    let mut slots = self.lock();
    let slot = slots.entry(key.clone()).or_default();
    if slot.in_flight.as_ref().map(|f| f.id) == Some(id) {
      slot.in_flight = None;
    }
    slot.last_active = now;

    match result {
      Ok(value) => {
        let value = Arc::new(value);
        let outdated = slot.generation != generation;
        if outdated && slot.entry.as_ref().is_some_and(|e| !e.invalidated) {
          // A newer write landed while this load ran.
          debug!(key = %key, "load superseded by a newer write; result not stored");
        } else {
          let entry = CacheEntry {
            key,
            value: Arc::clone(&value),
            updated_at: now,
            stale_time: options.stale_time,
            persist: options.persist,
            invalidated: outdated,
          };
          if outdated {
            debug!(key = %entry.key, "load landed after invalidation; stored as stale");
          }
          self.notify_write(&entry);
          slot.entry = Some(entry);
        }
        Ok((value, now))
      }
      Err(report) => {
        debug!(key = %key, error = %report, "load failed");
        Err(LoadError::new(report))
      }
    }
  }

  fn notify_write(&self, entry: &CacheEntry) {
    if entry.persist {
      self.hook().on_write(entry);
    }
  }

  fn hook(&self) -> Arc<dyn CacheWriteHook> {
    Arc::clone(&self.inner.hook.lock().unwrap_or_else(PoisonError::into_inner))
  }

  fn count(&self, counter: &AtomicU64, options: FetchOptions) {
    if !options.background {
      counter.fetch_add(1, Ordering::Relaxed);
    }
  }

  async fn await_load(load: SharedLoad) -> Result<CacheResult<Arc<Value>>> {
    let (value, updated_at) = load.await.map_err(Report::new)?;
    Ok(CacheResult::from_network(value, updated_at))
  }
}

/// Keeps a cache entry alive while held. See [`QueryCache::subscribe`].
pub struct Subscription {
  cache: QueryCache,
  key: QueryKey,
}

impl Subscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let now = self.cache.now();
    let mut slots = self.cache.lock();
    if let Some(slot) = slots.get_mut(&self.key) {
      slot.subscribers = slot.subscribers.saturating_sub(1);
      slot.last_active = now;
    }
  }
}

impl fmt::Debug for QueryCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryCache")
      .field("entries", &self.len())
      .field("gc_time", &self.inner.gc_time)
      .finish_non_exhaustive()
  }
}
