//! Change-feed subscriber that invalidates cached queries.

use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, BoxStream, SelectAll};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::KeyMappingRegistry;
use crate::backend::{Backend, ChangeEvent};
use crate::cache::QueryCache;

/// Reconnect backoff for the change feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
  pub initial_ms: u64,
  pub multiplier: f64,
  pub max_ms: u64,
  pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
  fn default() -> Self {
    Self {
      initial_ms: 1_000,
      multiplier: 2.0,
      max_ms: 30_000,
      jitter_ms: 500,
    }
  }
}

impl ReconnectConfig {
  fn next_backoff(&self, current_ms: u64) -> u64 {
    let next = (current_ms as f64 * self.multiplier) as u64;
    next.clamp(self.initial_ms, self.max_ms)
  }
}

/// Connection state of the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
  Connecting,
  Connected,
  /// No live subscription; only staleness timers keep the cache honest
  Disconnected,
}

type MergedFeed = SelectAll<BoxStream<'static, Result<ChangeEvent>>>;

/// Maps change events to cache invalidations.
#[derive(Clone)]
pub struct InvalidationRouter {
  cache: QueryCache,
  registry: Arc<KeyMappingRegistry>,
}

impl InvalidationRouter {
  pub fn new(cache: QueryCache, registry: Arc<KeyMappingRegistry>) -> Self {
    Self { cache, registry }
  }

  /// Invalidate every key mapped to `event`. Returns the number of cached
  /// entries marked stale; unmapped tables are a no-op.
  pub fn handle(&self, event: &ChangeEvent) -> usize {
    let keys = self.registry.keys_for(event);
    if keys.is_empty() {
      debug!(table = %event.table, "change on unmapped table ignored");
      return 0;
    }

    let marked: usize = keys.iter().map(|key| self.cache.invalidate(key)).sum();
    debug!(
      table = %event.table,
      op = %event.op,
      row = ?event.row_id,
      marked,
      "applied change event"
    );
    marked
  }

  /// Subscribe to `tables` on a background task and route their events until
  /// the returned handle is shut down or dropped.
  ///
  /// Fails immediately if a watched table has no mapping.
  pub fn spawn(
    self,
    backend: Arc<dyn Backend>,
    tables: Vec<String>,
    reconnect: ReconnectConfig,
  ) -> Result<RouterHandle> {
    self.registry.validate(&tables)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
    let task = tokio::spawn(self.run(backend, tables, reconnect, shutdown_rx, status_tx));

    Ok(RouterHandle {
      shutdown: Some(shutdown_tx),
      status: status_rx,
      task,
    })
  }

  async fn run(
    self,
    backend: Arc<dyn Backend>,
    tables: Vec<String>,
    reconnect: ReconnectConfig,
    mut shutdown: oneshot::Receiver<()>,
    status: watch::Sender<FeedStatus>,
  ) {
    let mut backoff = reconnect.initial_ms;

    'session: loop {
      status.send_replace(FeedStatus::Connecting);
      let opened = tokio::select! {
        _ = &mut shutdown => break 'session,
        opened = open_feed(backend.as_ref(), &tables) => opened,
      };

      match opened {
        Ok(mut feed) => {
          status.send_replace(FeedStatus::Connected);
          info!(tables = ?tables, "change feed connected");
          backoff = reconnect.initial_ms;

          loop {
            tokio::select! {
              _ = &mut shutdown => break 'session,
              item = feed.next() => match item {
                Some(Ok(event)) => {
                  self.handle(&event);
                }
                Some(Err(e)) => {
                  warn!(error = %e, "change feed dropped");
                  break;
                }
                None => {
                  warn!("change feed ended");
                  break;
                }
              }
            }
          }
        }
        Err(e) => warn!(error = %e, "could not subscribe to change feed"),
      }

      status.send_replace(FeedStatus::Disconnected);
      let delay = jittered_backoff(backoff, reconnect.jitter_ms);
      debug!(delay_ms = delay, "reconnecting change feed");
      tokio::select! {
        _ = &mut shutdown => break 'session,
        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
      }
      backoff = reconnect.next_backoff(backoff);
    }

    status.send_replace(FeedStatus::Disconnected);
    info!("change feed stopped");
  }
}

/// Open one stream per table and merge them.
///
/// Each stream yields an error when it ends, so losing any single table's
/// channel restarts the whole feed.
async fn open_feed(backend: &dyn Backend, tables: &[String]) -> Result<MergedFeed> {
  let mut streams = Vec::with_capacity(tables.len());
  for table in tables {
    let ended = table.clone();
    let stream = backend
      .subscribe(table)
      .await?
      .chain(stream::once(async move {
        Err(eyre!("change feed for {} ended", ended))
      }))
      .boxed();
    streams.push(stream);
  }
  Ok(stream::select_all(streams))
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
  if jitter_ms == 0 {
    return base_ms;
  }
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_else(|_| Duration::from_nanos(0))
    .subsec_nanos() as u64;
  let jitter = nanos % jitter_ms;
  base_ms.saturating_add(jitter)
}

/// Handle to a running router task.
///
/// Dropping the handle also stops the task.
pub struct RouterHandle {
  shutdown: Option<oneshot::Sender<()>>,
  status: watch::Receiver<FeedStatus>,
  task: JoinHandle<()>,
}

impl RouterHandle {
  pub fn status(&self) -> FeedStatus {
    *self.status.borrow()
  }

  pub fn status_updates(&self) -> watch::Receiver<FeedStatus> {
    self.status.clone()
  }

  /// Stop the router and wait until its subscriptions are released.
  pub async fn shutdown(mut self) {
    if let Some(tx) = self.shutdown.take() {
      let _ = tx.send(());
    }
    if let Err(e) = (&mut self.task).await {
      warn!(error = %e, "router task ended abnormally");
    }
  }
}
