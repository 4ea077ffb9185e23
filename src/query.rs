//! Hook-style observer over a cached query.
//!
//! A `Query` binds one [`QuerySpec`] to a [`CachedClient`] and exposes the
//! loading, success and error states a UI renders from. Loads run on the
//! runtime; the owner drives state changes by calling [`Query::poll`] from its
//! event loop.
//!
//! # Example
//!
//! ```ignore
//! let mut query = Query::new(client.clone(), QuerySpec::bookings(None));
//!
//! // Start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(rows) => render_rows(rows),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::{CacheResult, CacheSource, Subscription};
use crate::resources::{CachedClient, QuerySpec};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type Outcome = Result<CacheResult<Arc<Value>>, String>;

/// Observer of one cached query.
///
/// Holds a cache subscription for its whole lifetime, so the observed entry
/// is never garbage-collected while the query exists.
pub struct Query {
  client: CachedClient,
  spec: QuerySpec,
  state: QueryState<Arc<Value>>,
  source: Option<CacheSource>,
  receiver: Option<mpsc::UnboundedReceiver<Outcome>>,
  _subscription: Subscription,
}

impl Query {
  pub fn new(client: CachedClient, spec: QuerySpec) -> Self {
    let subscription = client.cache().subscribe(&spec.key);
    Self {
      client,
      spec,
      state: QueryState::Idle,
      source: None,
      receiver: None,
      _subscription: subscription,
    }
  }

  pub fn spec(&self) -> &QuerySpec {
    &self.spec
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<Arc<Value>> {
    &self.state
  }

  pub fn data(&self) -> Option<&Arc<Value>> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Where the last successful result came from.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  /// Whether the data shown is no longer fresh in the cache, either because
  /// its staleness window passed or because it was invalidated.
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => !self.client.cache().is_fresh(&self.spec.key),
      _ => false,
    }
  }

  /// Start fetching data if not already loading.
  ///
  /// A fresh cached value resolves without a backend call.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch(false);
  }

  /// Invalidate the cached value and fetch again, discarding any pending
  /// result. Never resolves with a load that started before this call.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.start_fetch(true);
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed (data arrived or error occurred).
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(Ok(result)) => {
        self.source = Some(result.source);
        self.state = QueryState::Success(result.data);
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error);
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.state = QueryState::Error("Query was cancelled".to_string());
        self.receiver = None;
        true
      }
    }
  }

  fn start_fetch(&mut self, refetch: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let client = self.client.clone();
    let spec = self.spec.clone();
    tokio::spawn(async move {
      let result = if refetch {
        client.refetch(&spec).await
      } else {
        client.fetch(&spec).await
      };
      let result = result.map_err(|e| format!("{:#}", e));
      // Receiver may have been dropped by a refetch
      let _ = tx.send(result);
    });
  }
}

impl std::fmt::Debug for Query {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.spec.key)
      .field("state", &self.state)
      .field("source", &self.source)
      .finish_non_exhaustive()
  }
}
