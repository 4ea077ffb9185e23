//! Best-effort mirror of persistable cache entries into a durable store.

use chrono::Duration;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::storage::{DurableRecord, DurableStore};
use crate::cache::{CacheEntry, CacheWriteHook, Clock, QueryCache, QueryKey, SystemClock};

/// Limits applied to the durable mirror.
#[derive(Debug, Clone)]
pub struct PersistOptions {
  /// Records expire this long after the write they mirror
  pub max_age: Duration,
  /// Upper bound on stored records; oldest writes go first
  pub max_records: usize,
  /// Version tag; records written under another tag are discarded on restore
  pub buster: String,
}

impl Default for PersistOptions {
  fn default() -> Self {
    Self {
      max_age: Duration::hours(24),
      max_records: 500,
      buster: "1".to_string(),
    }
  }
}

/// A change to mirror, applied in the order the cache made it.
enum StoreOp {
  Put(DurableRecord),
  Invalidate(QueryKey),
  Evict(QueryKey),
  Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
struct StoreWriter {
  store: Arc<dyn DurableStore>,
  max_records: usize,
}

impl StoreWriter {
  fn apply(&self, op: StoreOp) {
    match op {
      StoreOp::Put(record) => {
        if let Err(e) = self.store.put(&record) {
          warn!(key = %record.key, error = %e, "could not persist cache entry");
          return;
        }
        if let Err(e) = self.store.enforce_budget(self.max_records) {
          warn!(error = %e, "could not enforce snapshot budget");
        }
      }
      StoreOp::Invalidate(prefix) => match self.store.invalidate_prefix(&prefix) {
        Ok(marked) => debug!(prefix = %prefix, marked, "marked snapshots stale"),
        Err(e) => warn!(prefix = %prefix, error = %e, "could not mark snapshots stale"),
      },
      StoreOp::Evict(prefix) => match self.store.delete_prefix(&prefix) {
        Ok(removed) => debug!(prefix = %prefix, removed, "deleted evicted snapshots"),
        Err(e) => warn!(prefix = %prefix, error = %e, "could not delete evicted snapshots"),
      },
      StoreOp::Flush(done) => {
        let _ = done.send(());
      }
    }
  }

  /// Apply ops one at a time on the blocking pool until every sender is gone.
  async fn run(self, mut ops: mpsc::UnboundedReceiver<StoreOp>) {
    while let Some(op) = ops.recv().await {
      if let StoreOp::Flush(done) = op {
        let _ = done.send(());
        continue;
      }
      let writer = self.clone();
      if let Err(e) = tokio::task::spawn_blocking(move || writer.apply(op)).await {
        warn!(error = %e, "snapshot write task failed");
      }
    }
  }
}

/// Keeps persistable cache entries alive across restarts.
///
/// The bridge only talks to the cache through `hydrate` and the write hook,
/// and nothing else touches the store. Every store failure is logged and
/// swallowed: the in-memory cache stays the source of truth.
///
/// Once attached inside a runtime, mirrored changes are queued and written
/// off the caller's thread in order; [`flush`](Self::flush) waits for them.
pub struct PersistenceBridge {
  store: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  options: PersistOptions,
  queue: OnceLock<mpsc::UnboundedSender<StoreOp>>,
}

impl PersistenceBridge {
  pub fn new(store: Arc<dyn DurableStore>, options: PersistOptions) -> Self {
    Self::with_clock(store, options, Arc::new(SystemClock))
  }

  pub fn with_clock(
    store: Arc<dyn DurableStore>,
    options: PersistOptions,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      store,
      clock,
      options,
      queue: OnceLock::new(),
    }
  }

  /// Restore live snapshots into `cache`, then mirror its future changes.
  pub fn attach(self: &Arc<Self>, cache: &QueryCache) -> usize {
    let restored = self.restore(cache);
    self.start_writer();
    cache.set_write_hook(Arc::clone(self) as Arc<dyn CacheWriteHook>);
    restored
  }

  /// Pre-populate `cache` with every non-expired snapshot.
  ///
  /// Entries keep their original timestamps and invalidation marks, so a
  /// snapshot that was stale before the restart comes back stale and is
  /// refreshed on next read. Returns the number of entries hydrated.
  pub fn restore(&self, cache: &QueryCache) -> usize {
    let now = self.clock.now();
    let records = match self.store.load_live(now) {
      Ok(records) => records,
      Err(e) => {
        warn!(error = %e, "could not read cache snapshots; starting cold");
        return 0;
      }
    };

    let mut restored = 0;
    for record in records {
      if record.buster != self.options.buster {
        debug!(key = %record.key, buster = %record.buster, "dropping snapshot from another cache version");
        if let Err(e) = self.store.delete(&record.key) {
          warn!(key = %record.key, error = %e, "could not delete outdated snapshot");
        }
        continue;
      }
      if cache.hydrate(
        &record.key,
        record.value,
        record.updated_at,
        record.stale_time,
        record.invalidated,
      ) {
        restored += 1;
      }
    }

    info!(restored, "restored cache snapshots");
    restored
  }

  /// Wait until every change queued so far has reached the store.
  pub async fn flush(&self) {
    let Some(queue) = self.queue.get() else {
      return;
    };
    let (done, flushed) = oneshot::channel();
    if queue.send(StoreOp::Flush(done)).is_ok() {
      let _ = flushed.await;
    }
  }

  /// Delete expired snapshots. Returns the number removed.
  pub fn sweep(&self) -> usize {
    match self.store.delete_expired(self.clock.now()) {
      Ok(removed) => {
        if removed > 0 {
          debug!(removed, "swept expired snapshots");
        }
        removed
      }
      Err(e) => {
        warn!(error = %e, "snapshot sweep failed");
        0
      }
    }
  }

  /// Run [`sweep`](Self::sweep) every `interval`.
  pub fn spawn_sweeper(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
    let bridge = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        bridge.sweep();
      }
    })
  }

  fn writer(&self) -> StoreWriter {
    StoreWriter {
      store: Arc::clone(&self.store),
      max_records: self.options.max_records,
    }
  }

  /// Outside a runtime the queue is never started and ops apply inline.
  fn start_writer(&self) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return;
    };
    let (tx, rx) = mpsc::unbounded_channel();
    if self.queue.set(tx).is_ok() {
      runtime.spawn(self.writer().run(rx));
    }
  }

  fn submit(&self, op: StoreOp) {
    match self.queue.get() {
      Some(queue) => {
        if let Err(mpsc::error::SendError(op)) = queue.send(op) {
          self.writer().apply(op);
        }
      }
      None => self.writer().apply(op),
    }
  }

  fn record_for(&self, entry: &CacheEntry) -> DurableRecord {
    DurableRecord {
      key: entry.key.clone(),
      value: (*entry.value).clone(),
      updated_at: entry.updated_at,
      stale_time: entry.stale_time,
      expires_at: entry.updated_at + self.options.max_age,
      buster: self.options.buster.clone(),
      invalidated: entry.invalidated,
    }
  }
}

impl CacheWriteHook for PersistenceBridge {
  fn on_write(&self, entry: &CacheEntry) {
    self.submit(StoreOp::Put(self.record_for(entry)));
  }

  fn on_invalidate(&self, prefix: &QueryKey) {
    self.submit(StoreOp::Invalidate(prefix.clone()));
  }

  fn on_evict(&self, prefix: &QueryKey) {
    self.submit(StoreOp::Evict(prefix.clone()));
  }
}
