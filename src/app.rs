//! Wiring of the cache, persistence, realtime and prefetch pieces.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, RestBackend};
use crate::cache::{CacheStats, QueryCache};
use crate::config::{Config, PersistenceConfig};
use crate::persist::{DurableRecord, DurableStore, NoopStore, PersistenceBridge, SqliteStore};
use crate::prefetch::{Prefetcher, Signal};
use crate::realtime::{FeedStatus, InvalidationRouter, KeyMappingRegistry, RouterHandle};
use crate::resources::{CachedClient, QuerySpec};

/// Main application state
pub struct App {
  config: Config,
  backend: Arc<dyn Backend>,
  cache: QueryCache,
  client: CachedClient,
  registry: Arc<KeyMappingRegistry>,
  bridge: Arc<PersistenceBridge>,
}

/// Background tasks of a started [`App`].
pub struct Running {
  cache: QueryCache,
  router: Option<RouterHandle>,
  gc: JoinHandle<()>,
  sweeper: Option<JoinHandle<()>>,
  bridge: Arc<PersistenceBridge>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let backend = Arc::new(RestBackend::new(&config.backend)?);
    let store = open_store(&config.persistence);
    Self::with_parts(config, backend, store)
  }

  /// Build an app over an explicit backend and durable store.
  ///
  /// Fails if a watched realtime table has no key mapping.
  pub fn with_parts(
    config: Config,
    backend: Arc<dyn Backend>,
    store: Arc<dyn DurableStore>,
  ) -> Result<Self> {
    let registry = Arc::new(KeyMappingRegistry::property_management());
    if config.realtime.enabled {
      registry.validate(&config.realtime.tables)?;
    }

    let cache = QueryCache::new(config.cache.gc_time());
    let client = CachedClient::new(Arc::clone(&backend), cache.clone(), Arc::clone(&registry));
    let bridge = Arc::new(PersistenceBridge::new(store, config.persistence.options()));

    Ok(Self {
      config,
      backend,
      cache,
      client,
      registry,
      bridge,
    })
  }

  pub fn client(&self) -> &CachedClient {
    &self.client
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// Restore snapshots and start the background tasks: idle collection,
  /// snapshot sweeps, the change feed and dashboard warm-up.
  pub async fn start(&self) -> Result<Running> {
    let restored = if self.config.persistence.enabled {
      self.bridge.attach(&self.cache)
    } else {
      0
    };

    let gc = self
      .cache
      .spawn_gc(Duration::from_secs(self.config.cache.gc_interval_secs));
    let sweeper = self.config.persistence.enabled.then(|| {
      self
        .bridge
        .spawn_sweeper(Duration::from_secs(self.config.persistence.sweep_interval_secs))
    });

    let router = if self.config.realtime.enabled {
      let router = InvalidationRouter::new(self.cache.clone(), Arc::clone(&self.registry));
      Some(router.spawn(
        Arc::clone(&self.backend),
        self.config.realtime.tables.clone(),
        self.config.realtime.reconnect.clone(),
      )?)
    } else {
      None
    };

    if self.config.prefetch.enabled {
      let prefetcher = Prefetcher::from_config(self.client.clone(), &self.config.prefetch);
      let decisions = prefetcher.on_signal(&Signal::OpenedDashboard);
      debug!(?decisions, "dashboard warm-up submitted");
    }

    match self.client.fetch_revalidating(&QuerySpec::dashboard_stats()).await {
      Ok(stats) => debug!(source = ?stats.source, "dashboard stats ready"),
      Err(e) => warn!(error = %e, "could not load dashboard stats"),
    }

    info!(
      restored,
      realtime = router.is_some(),
      cached = self.cache.len(),
      "propsync started"
    );

    Ok(Running {
      cache: self.cache.clone(),
      router,
      gc,
      sweeper,
      bridge: Arc::clone(&self.bridge),
    })
  }

  /// Start, then keep running until Ctrl-C.
  pub async fn run(&self) -> Result<()> {
    let running = self.start().await?;

    if let Some(router) = &running.router {
      let mut updates = router.status_updates();
      tokio::spawn(async move {
        while updates.changed().await.is_ok() {
          let status = *updates.borrow();
          match status {
            FeedStatus::Disconnected => warn!("change feed disconnected; relying on staleness timers"),
            status => debug!(?status, "change feed status"),
          }
        }
      });
    }

    tokio::signal::ctrl_c()
      .await
      .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    info!("shutting down");
    running.stop().await;
    Ok(())
  }
}

impl Running {
  pub fn feed_status(&self) -> Option<FeedStatus> {
    self.router.as_ref().map(RouterHandle::status)
  }

  pub fn stats(&self) -> CacheStats {
    self.cache.stats()
  }

  /// Release the change feed, stop the timers, drain pending snapshot writes
  /// and run a final sweep.
  pub async fn stop(self) {
    if let Some(router) = self.router {
      router.shutdown().await;
    }
    self.gc.abort();
    self.bridge.flush().await;
    if let Some(sweeper) = self.sweeper {
      sweeper.abort();
      self.bridge.sweep();
    }

    let stats = self.cache.stats();
    info!(
      hits = stats.hits,
      stale_hits = stats.stale_hits,
      misses = stats.misses,
      hit_rate = stats.hit_rate().unwrap_or_default(),
      "cache statistics"
    );
  }
}

/// Open the configured durable store, falling back to a no-op store so a
/// broken disk never prevents startup.
pub fn open_store(config: &PersistenceConfig) -> Arc<dyn DurableStore> {
  if !config.enabled {
    return Arc::new(NoopStore);
  }
  let opened = match &config.path {
    Some(path) => SqliteStore::open(path),
    None => SqliteStore::open_default(),
  };
  match opened {
    Ok(store) => Arc::new(store),
    Err(e) => {
      warn!(error = %e, "durable cache unavailable; continuing in memory only");
      Arc::new(NoopStore)
    }
  }
}

/// One row of `propsync inspect`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSummary {
  pub key: String,
  pub age: chrono::Duration,
  pub expires_in: chrono::Duration,
  pub current: bool,
  /// Marked stale since it was written
  pub invalidated: bool,
}

impl RecordSummary {
  pub fn new(record: &DurableRecord, now: DateTime<Utc>, buster: &str) -> Self {
    Self {
      key: record.key.to_string(),
      age: now - record.updated_at,
      expires_in: record.expires_at - now,
      current: record.buster == buster,
      invalidated: record.invalidated,
    }
  }
}

/// Summaries of every durable record, newest first.
pub fn inspect(store: &dyn DurableStore, now: DateTime<Utc>, buster: &str) -> Result<Vec<RecordSummary>> {
  Ok(
    store
      .list()?
      .iter()
      .map(|record| RecordSummary::new(record, now, buster))
      .collect(),
  )
}
