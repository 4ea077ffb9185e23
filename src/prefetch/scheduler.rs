//! Gate between predictions and background loads: confidence threshold,
//! bounded pending queue and skip rules for fresh or loading keys.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::predict::{predict, PrefetchCandidate, Signal};
use crate::config::PrefetchConfig;
use crate::resources::CachedClient;

/// What [`Prefetcher::submit`] did with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchDecision {
  /// A background load was started
  Started,
  BelowThreshold,
  /// The key already holds a fresh value
  Fresh,
  /// A load for the key is already running
  InFlight,
  /// Too many background loads outstanding
  QueueFull,
}

/// Warms cache entries from predicted candidates, bounded by a confidence
/// threshold and a cap on outstanding loads.
#[derive(Clone)]
pub struct Prefetcher {
  client: CachedClient,
  threshold: f32,
  max_pending: usize,
  pending: Arc<AtomicUsize>,
}

impl Prefetcher {
  pub fn new(client: CachedClient, threshold: f32, max_pending: usize) -> Self {
    Self {
      client,
      threshold,
      max_pending,
      pending: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn from_config(client: CachedClient, config: &PrefetchConfig) -> Self {
    Self::new(client, config.threshold, config.max_pending)
  }

  /// Background loads currently outstanding.
  pub fn pending(&self) -> usize {
    self.pending.load(Ordering::SeqCst)
  }

  /// Predict from `signal` and submit every candidate.
  pub fn on_signal(&self, signal: &Signal) -> Vec<PrefetchDecision> {
    predict(signal)
      .iter()
      .map(|candidate| self.submit(candidate))
      .collect()
  }

  /// Start a background load for `candidate` if it clears the threshold, is
  /// not already cached fresh or loading, and the queue has room.
  pub fn submit(&self, candidate: &PrefetchCandidate) -> PrefetchDecision {
    let key = &candidate.spec.key;
    let cache = self.client.cache();

    if candidate.confidence < self.threshold {
      trace!(key = %key, confidence = candidate.confidence, "prefetch below threshold");
      return PrefetchDecision::BelowThreshold;
    }
    if cache.is_fresh(key) {
      return PrefetchDecision::Fresh;
    }
    if cache.is_fetching(key) {
      return PrefetchDecision::InFlight;
    }

    let max_pending = self.max_pending;
    let reserved = self
      .pending
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
        (n < max_pending).then_some(n + 1)
      });
    if reserved.is_err() {
      debug!(key = %key, max_pending, "prefetch queue full");
      return PrefetchDecision::QueueFull;
    }

    let guard = PendingSlot(Arc::clone(&self.pending));
    let client = self.client.clone();
    let spec = candidate.spec.clone();
    let signal = candidate.signal.clone();
    debug!(key = %key, confidence = candidate.confidence, "prefetching");
    tokio::spawn(async move {
      let _guard = guard;
      match client.prefetch(&spec).await {
        Ok(_) => trace!(key = %spec.key, "prefetch landed"),
        Err(e) => debug!(key = %spec.key, signal = ?signal, error = %e, "prefetch failed"),
      }
    });
    PrefetchDecision::Started
  }
}

/// Releases a queue slot when the load finishes, however it finishes.
struct PendingSlot(Arc<AtomicUsize>);

impl Drop for PendingSlot {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::QueryCache;
  use crate::realtime::KeyMappingRegistry;
  use crate::resources::QuerySpec;
  use crate::testing::{eventually, MockBackend};
  use serde_json::json;
  use std::time::Duration;

  fn prefetcher(backend: &Arc<MockBackend>, threshold: f32, max_pending: usize) -> Prefetcher {
    let client = CachedClient::new(
      backend.clone(),
      QueryCache::new(chrono::Duration::minutes(10)),
      Arc::new(KeyMappingRegistry::property_management()),
    );
    Prefetcher::new(client, threshold, max_pending)
  }

  fn candidate(spec: QuerySpec, confidence: f32) -> PrefetchCandidate {
    PrefetchCandidate {
      spec,
      confidence,
      signal: Signal::OpenedDashboard,
    }
  }

  #[tokio::test]
  async fn test_low_confidence_issues_no_fetch() {
    let backend = Arc::new(MockBackend::new());
    let prefetcher = prefetcher(&backend, 0.85, 4);

    let decision = prefetcher.submit(&candidate(QuerySpec::properties(), 0.6));
    assert_eq!(decision, PrefetchDecision::BelowThreshold);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.total_queries(), 0);
  }

  #[tokio::test]
  async fn test_threshold_is_inclusive() {
    let backend = Arc::new(MockBackend::new().with_rows("vendors", json!([])));
    let prefetcher = prefetcher(&backend, 0.85, 4);

    let decision = prefetcher.submit(&candidate(QuerySpec::vendors(), 0.85));
    assert_eq!(decision, PrefetchDecision::Started);
    eventually(|| prefetcher.pending() == 0).await;
    assert_eq!(backend.queries("vendors"), 1);
    assert!(prefetcher.client.cache().is_fresh(&QuerySpec::vendors().key));
  }

  #[tokio::test]
  async fn test_queue_is_bounded() {
    let backend = Arc::new(MockBackend::new().with_latency(Duration::from_millis(50)));
    let prefetcher = prefetcher(&backend, 0.5, 2);

    let decisions: Vec<_> = [
      QuerySpec::guests(),
      QuerySpec::vendors(),
      QuerySpec::expenses(),
    ]
    .into_iter()
    .map(|spec| prefetcher.submit(&candidate(spec, 0.9)))
    .collect();

    assert_eq!(
      decisions,
      vec![
        PrefetchDecision::Started,
        PrefetchDecision::Started,
        PrefetchDecision::QueueFull
      ]
    );
    assert_eq!(prefetcher.pending(), 2);
    eventually(|| prefetcher.pending() == 0).await;
    assert_eq!(backend.total_queries(), 2);
  }

  #[tokio::test]
  async fn test_fresh_and_in_flight_keys_are_skipped() {
    let backend = Arc::new(
      MockBackend::new()
        .with_rows("invoices", json!([]))
        .with_latency(Duration::from_millis(30)),
    );
    let prefetcher = prefetcher(&backend, 0.5, 4);
    let spec = QuerySpec::invoices();

    let foreground = {
      let client = prefetcher.client.clone();
      let spec = spec.clone();
      tokio::spawn(async move { client.fetch(&spec).await })
    };
    eventually(|| prefetcher.client.cache().is_fetching(&spec.key)).await;
    assert_eq!(
      prefetcher.submit(&candidate(spec.clone(), 0.9)),
      PrefetchDecision::InFlight
    );

    foreground.await.unwrap().unwrap();
    assert_eq!(
      prefetcher.submit(&candidate(spec.clone(), 0.9)),
      PrefetchDecision::Fresh
    );
    assert_eq!(backend.queries("invoices"), 1);
  }

  #[tokio::test]
  async fn test_failed_prefetch_is_swallowed() {
    let backend = Arc::new(MockBackend::new());
    backend.fail_resource("expenses", true);
    let prefetcher = prefetcher(&backend, 0.5, 1);

    assert_eq!(
      prefetcher.submit(&candidate(QuerySpec::expenses(), 0.9)),
      PrefetchDecision::Started
    );
    eventually(|| prefetcher.pending() == 0).await;
    assert!(prefetcher
      .client
      .cache()
      .peek(&QuerySpec::expenses().key)
      .is_none());
  }

  #[tokio::test]
  async fn test_on_signal_applies_threshold_per_candidate() {
    let backend = Arc::new(MockBackend::new());
    let prefetcher = prefetcher(&backend, 0.85, 4);

    let decisions = prefetcher.on_signal(&Signal::OpenedDashboard);
    assert_eq!(
      decisions,
      vec![
        PrefetchDecision::Started,
        PrefetchDecision::Started,
        PrefetchDecision::BelowThreshold,
        PrefetchDecision::BelowThreshold
      ]
    );
    eventually(|| prefetcher.pending() == 0).await;
    assert_eq!(backend.queries("bookings"), 1);
    assert_eq!(backend.queries("properties"), 1);
    assert_eq!(backend.queries("invoices"), 0);
  }
}
