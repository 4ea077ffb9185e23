//! Scripted in-process backend for unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::backend::{
  Backend, ChangeEvent, ChangeStream, FilterOp, Mutation, MutationOp, ResourceQuery,
};

#[derive(Default)]
pub struct MockBackend {
  rows: Mutex<HashMap<String, Value>>,
  queries: Mutex<HashMap<String, usize>>,
  failing: Mutex<HashSet<String>>,
  mutations: Mutex<Vec<Mutation>>,
  latency: Mutex<Option<Duration>>,
  feeds: Mutex<Vec<(String, mpsc::UnboundedSender<Result<ChangeEvent>>)>>,
  subscriptions: AtomicUsize,
  subscribe_attempts: AtomicUsize,
  fail_subscribe: AtomicBool,
}

impl MockBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Rows returned for `resource`; single-row queries pick the element
  /// whose `id` matches the query's `id=eq.` filter.
  pub fn with_rows(self, resource: &str, rows: Value) -> Self {
    self.set_rows(resource, rows);
    self
  }

  pub fn with_latency(self, latency: Duration) -> Self {
    *self.latency.lock().unwrap() = Some(latency);
    self
  }

  pub fn set_rows(&self, resource: &str, rows: Value) {
    self.rows.lock().unwrap().insert(resource.to_string(), rows);
  }

  pub fn fail_resource(&self, resource: &str, fail: bool) {
    let mut failing = self.failing.lock().unwrap();
    if fail {
      failing.insert(resource.to_string());
    } else {
      failing.remove(resource);
    }
  }

  pub fn fail_subscribe(&self, fail: bool) {
    self.fail_subscribe.store(fail, Ordering::SeqCst);
  }

  /// Number of queries issued against `resource`.
  pub fn queries(&self, resource: &str) -> usize {
    self
      .queries
      .lock()
      .unwrap()
      .get(resource)
      .copied()
      .unwrap_or(0)
  }

  pub fn total_queries(&self) -> usize {
    self.queries.lock().unwrap().values().sum()
  }

  pub fn mutations(&self) -> Vec<Mutation> {
    self.mutations.lock().unwrap().clone()
  }

  /// Successful subscriptions so far.
  pub fn subscriptions(&self) -> usize {
    self.subscriptions.load(Ordering::SeqCst)
  }

  pub fn subscribe_attempts(&self) -> usize {
    self.subscribe_attempts.load(Ordering::SeqCst)
  }

  /// Feeds whose consumer is still alive.
  pub fn open_feeds(&self) -> usize {
    self
      .feeds
      .lock()
      .unwrap()
      .iter()
      .filter(|(_, tx)| !tx.is_closed())
      .count()
  }

  /// Push `event` to every live feed for its table.
  pub fn emit(&self, event: ChangeEvent) {
    self
      .feeds
      .lock()
      .unwrap()
      .retain(|(table, tx)| table != &event.table || tx.send(Ok(event.clone())).is_ok());
  }

  /// End every open feed as a server disconnect would.
  pub fn drop_feeds(&self) {
    self.feeds.lock().unwrap().clear();
  }

  async fn delay(&self) {
    let latency = *self.latency.lock().unwrap();
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }
  }

  fn check_failing(&self, resource: &str) -> Result<()> {
    if self.failing.lock().unwrap().contains(resource) {
      return Err(eyre!("{} unavailable", resource));
    }
    Ok(())
  }
}

#[async_trait]
impl Backend for MockBackend {
  async fn query(&self, query: &ResourceQuery) -> Result<Value> {
    *self
      .queries
      .lock()
      .unwrap()
      .entry(query.resource.clone())
      .or_default() += 1;
    self.delay().await;
    self.check_failing(&query.resource)?;

    let rows = self
      .rows
      .lock()
      .unwrap()
      .get(&query.resource)
      .cloned()
      .unwrap_or_else(|| Value::Array(Vec::new()));
    if !query.single {
      return Ok(rows);
    }

    let id = query
      .filters
      .iter()
      .find(|f| f.column == "id" && f.op == FilterOp::Eq)
      .map(|f| f.value.clone());
    match rows {
      Value::Array(rows) => rows
        .into_iter()
        .find(|row| id.is_none() || row.get("id").and_then(Value::as_str) == id.as_deref())
        .ok_or_else(|| eyre!("no {} row matches", query.resource)),
      row => Ok(row),
    }
  }

  async fn mutate(&self, mutation: &Mutation) -> Result<Value> {
    self.delay().await;
    self.check_failing(&mutation.resource)?;
    self.mutations.lock().unwrap().push(mutation.clone());

    let mut row = match &mutation.payload {
      Value::Object(_) => mutation.payload.clone(),
      _ => Value::Object(Default::default()),
    };
    if let (MutationOp::Update { id } | MutationOp::Delete { id }, Value::Object(map)) =
      (&mutation.op, &mut row)
    {
      map.insert("id".to_string(), Value::String(id.clone()));
    }
    Ok(row)
  }

  async fn subscribe(&self, table: &str) -> Result<ChangeStream> {
    self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
    if self.fail_subscribe.load(Ordering::SeqCst) {
      return Err(eyre!("realtime unavailable"));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    self.feeds.lock().unwrap().push((table.to_string(), tx));
    self.subscriptions.fetch_add(1, Ordering::SeqCst);

    Ok(
      futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
      })
      .boxed(),
    )
  }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
  while !condition() {
    assert!(
      tokio::time::Instant::now() < deadline,
      "condition not met in time"
    );
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}
