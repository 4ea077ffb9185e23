//! Property-management queries and a backend client that reads through the
//! cache.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{Backend, ChangeEvent, Filter, Mutation, ResourceQuery};
use crate::cache::{CacheResult, FetchOptions, QueryCache, QueryKey};
use crate::query_key;
use crate::realtime::KeyMappingRegistry;

/// Resource families with their own cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
  Properties,
  Bookings,
  Guests,
  Invoices,
  Expenses,
  Vendors,
  Documents,
  Media,
  Dashboard,
  Reports,
  Calendar,
}

impl Resource {
  pub fn stale_time(self) -> Duration {
    match self {
      Self::Dashboard => Duration::minutes(1),
      Self::Bookings | Self::Calendar => Duration::minutes(2),
      Self::Guests | Self::Invoices | Self::Expenses => Duration::minutes(5),
      Self::Properties | Self::Documents | Self::Media => Duration::minutes(10),
      Self::Reports => Duration::minutes(15),
      Self::Vendors => Duration::minutes(30),
    }
  }

  /// Media (signed URLs) and report aggregates stay in memory only.
  pub fn persisted(self) -> bool {
    !matches!(self, Self::Media | Self::Reports)
  }

  pub fn options(self) -> FetchOptions {
    FetchOptions::default()
      .with_stale_time(self.stale_time())
      .persisted(self.persisted())
  }
}

/// A cacheable read: the key it is stored under, the backend query that
/// loads it and its cache policy.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
  pub key: QueryKey,
  pub query: ResourceQuery,
  pub options: FetchOptions,
}

impl QuerySpec {
  pub fn new(key: QueryKey, query: ResourceQuery, resource: Resource) -> Self {
    Self {
      key,
      query,
      options: resource.options(),
    }
  }

  /// Filtered list keyed `[prefix, "list", fingerprint]`.
  fn filtered(prefix: &str, query: ResourceQuery, resource: Resource) -> Self {
    Self::new(
      query_key![prefix, "list", query.fingerprint()],
      query,
      resource,
    )
  }

  fn row(table: &str, row_prefix: &str, id: &str, resource: Resource) -> Self {
    Self::new(
      query_key![row_prefix, id],
      ResourceQuery::table(table).filter(Filter::eq("id", id)).single(),
      resource,
    )
  }

  pub fn properties() -> Self {
    Self::new(
      query_key!["properties", "list"],
      ResourceQuery::table("properties").order_by("name", true),
      Resource::Properties,
    )
  }

  pub fn property(id: &str) -> Self {
    Self::row("properties", "property", id, Resource::Properties)
  }

  /// Bookings, optionally restricted to one property.
  pub fn bookings(property_id: Option<&str>) -> Self {
    let query = ResourceQuery::table("bookings").order_by("check_in", false);
    match property_id {
      Some(property_id) => Self::filtered(
        "bookings",
        query.filter(Filter::eq("property_id", property_id)),
        Resource::Bookings,
      ),
      None => Self::new(query_key!["bookings", "list"], query, Resource::Bookings),
    }
  }

  pub fn booking(id: &str) -> Self {
    Self::row("bookings", "booking", id, Resource::Bookings)
  }

  pub fn guests() -> Self {
    Self::new(
      query_key!["guests", "list"],
      ResourceQuery::table("guests").order_by("last_name", true),
      Resource::Guests,
    )
  }

  pub fn guest(id: &str) -> Self {
    Self::row("guests", "guest", id, Resource::Guests)
  }

  pub fn invoices() -> Self {
    Self::new(
      query_key!["invoices", "list"],
      ResourceQuery::table("invoices").order_by("issued_at", false),
      Resource::Invoices,
    )
  }

  pub fn invoice(id: &str) -> Self {
    Self::row("invoices", "invoice", id, Resource::Invoices)
  }

  pub fn expenses() -> Self {
    Self::new(
      query_key!["expenses", "list"],
      ResourceQuery::table("expenses").order_by("incurred_at", false),
      Resource::Expenses,
    )
  }

  pub fn expense(id: &str) -> Self {
    Self::row("expenses", "expense", id, Resource::Expenses)
  }

  pub fn vendors() -> Self {
    Self::new(
      query_key!["vendors", "list"],
      ResourceQuery::table("vendors").order_by("name", true),
      Resource::Vendors,
    )
  }

  pub fn vendor(id: &str) -> Self {
    Self::row("vendors", "vendor", id, Resource::Vendors)
  }

  pub fn documents() -> Self {
    Self::new(
      query_key!["documents", "list"],
      ResourceQuery::table("documents").order_by("created_at", false),
      Resource::Documents,
    )
  }

  pub fn document(id: &str) -> Self {
    Self::row("documents", "document", id, Resource::Documents)
  }

  /// Photos and attachments of one property.
  pub fn media(property_id: &str) -> Self {
    Self::filtered(
      "media",
      ResourceQuery::table("media")
        .filter(Filter::eq("property_id", property_id))
        .order_by("position", true),
      Resource::Media,
    )
  }

  pub fn dashboard_stats() -> Self {
    Self::new(
      query_key!["dashboard", "stats"],
      ResourceQuery::table("dashboard_stats").single(),
      Resource::Dashboard,
    )
  }

  pub fn reports_summary() -> Self {
    Self::new(
      query_key!["reports", "summary"],
      ResourceQuery::table("report_summary"),
      Resource::Reports,
    )
  }

  /// Occupancy calendar of one property.
  pub fn calendar(property_id: &str) -> Self {
    Self::filtered(
      "calendar",
      ResourceQuery::table("bookings")
        .select("id,check_in,check_out,status")
        .filter(Filter::eq("property_id", property_id))
        .filter(Filter::one_of(
          "status",
          ["confirmed", "checked_in", "pending"],
        ))
        .order_by("check_in", true),
      Resource::Calendar,
    )
  }
}

/// Backend client with transparent caching.
///
/// Reads go through the shared [`QueryCache`]; writes go straight to the
/// backend and then invalidate the keys the registry maps to the written
/// table, so the local view does not wait for the change feed.
#[derive(Clone)]
pub struct CachedClient {
  backend: Arc<dyn Backend>,
  cache: QueryCache,
  registry: Arc<KeyMappingRegistry>,
}

impl CachedClient {
  pub fn new(
    backend: Arc<dyn Backend>,
    cache: QueryCache,
    registry: Arc<KeyMappingRegistry>,
  ) -> Self {
    Self {
      backend,
      cache,
      registry,
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// Cached value if fresh, otherwise load it (joining any load in flight).
  pub async fn fetch(&self, spec: &QuerySpec) -> Result<CacheResult<Arc<Value>>> {
    self
      .cache
      .get_or_fetch(&spec.key, self.loader(spec), spec.options)
      .await
  }

  /// Invalidate the cached value and load it again, ignoring any load that
  /// started before the invalidation.
  pub async fn refetch(&self, spec: &QuerySpec) -> Result<CacheResult<Arc<Value>>> {
    self
      .cache
      .refetch(&spec.key, self.loader(spec), spec.options)
      .await
  }

  /// Serve a stale value immediately and refresh it in the background.
  pub async fn fetch_revalidating(&self, spec: &QuerySpec) -> Result<CacheResult<Arc<Value>>> {
    self
      .cache
      .get_revalidating(&spec.key, self.loader(spec), spec.options)
      .await
  }

  /// Speculative load that is not reported as a loading state.
  pub async fn prefetch(&self, spec: &QuerySpec) -> Result<CacheResult<Arc<Value>>> {
    self
      .cache
      .get_or_fetch(&spec.key, self.loader(spec), spec.options.in_background())
      .await
  }

  /// [`fetch`](Self::fetch) and decode the rows into `T`.
  pub async fn fetch_as<T: DeserializeOwned>(&self, spec: &QuerySpec) -> Result<CacheResult<T>> {
    let result = self.fetch(spec).await?;
    let data = T::deserialize(result.data.as_ref())
      .map_err(|e| eyre!("Failed to decode {}: {}", spec.key, e))?;
    Ok(result.map(|_| data))
  }

  /// Apply a write, then invalidate every cached query it affects.
  pub async fn mutate(&self, mutation: &Mutation) -> Result<Value> {
    let row = self.backend.mutate(mutation).await?;

    let row_id = mutation
      .row_id()
      .map(String::from)
      .or_else(|| row_id_of(&row));
    let event = ChangeEvent {
      table: mutation.resource.clone(),
      op: mutation.change_op(),
      row_id,
    };
    let keys = self.registry.keys_for(&event);
    if keys.is_empty() {
      debug!(table = %mutation.resource, "mutation on table without key mapping");
    }
    let marked: usize = keys.iter().map(|key| self.cache.invalidate(key)).sum();
    info!(
      table = %mutation.resource,
      op = %event.op,
      marked,
      "mutation applied"
    );
    Ok(row)
  }

  fn loader(&self, spec: &QuerySpec) -> impl FnOnce() -> BoxFuture<'static, Result<Value>> {
    let backend = Arc::clone(&self.backend);
    let query = spec.query.clone();
    move || async move { backend.query(&query).await }.boxed()
  }
}

fn row_id_of(row: &Value) -> Option<String> {
  match row.get("id")? {
    Value::String(id) => Some(id.clone()),
    Value::Number(id) => Some(id.to_string()),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::testing::MockBackend;
  use serde::Deserialize;
  use serde_json::json;

  fn client(backend: MockBackend) -> (CachedClient, Arc<MockBackend>) {
    let backend = Arc::new(backend);
    let client = CachedClient::new(
      backend.clone(),
      QueryCache::new(Duration::minutes(10)),
      Arc::new(KeyMappingRegistry::property_management()),
    );
    (client, backend)
  }

  #[test]
  fn test_media_and_reports_are_not_persisted() {
    assert!(!QuerySpec::media("p1").options.persist);
    assert!(!QuerySpec::reports_summary().options.persist);
    assert!(QuerySpec::properties().options.persist);
    assert!(QuerySpec::booking("b1").options.persist);
  }

  #[test]
  fn test_keys_follow_registry_scheme() {
    let registry = KeyMappingRegistry::property_management();
    let event = ChangeEvent::new("bookings", crate::backend::ChangeOp::Update).with_row("b1");
    let keys = registry.keys_for(&event);

    for spec in [
      QuerySpec::booking("b1"),
      QuerySpec::bookings(None),
      QuerySpec::bookings(Some("p1")),
      QuerySpec::calendar("p1"),
      QuerySpec::dashboard_stats(),
      QuerySpec::reports_summary(),
    ] {
      assert!(
        keys.iter().any(|prefix| spec.key.starts_with(prefix)),
        "{} not covered",
        spec.key
      );
    }
    assert!(!keys
      .iter()
      .any(|prefix| QuerySpec::booking("b2").key.starts_with(prefix)));
  }

  #[test]
  fn test_filtered_keys_end_with_query_fingerprint() {
    let spec = QuerySpec::bookings(Some("p1"));
    assert_eq!(
      spec.key,
      query_key!["bookings", "list", spec.query.fingerprint()]
    );
    assert_ne!(spec.key, QuerySpec::bookings(Some("p2")).key);
    assert_ne!(QuerySpec::calendar("p1").key, QuerySpec::calendar("p2").key);
    assert!(QuerySpec::media("p1").key.starts_with(&query_key!["media", "list"]));
  }

  #[tokio::test]
  async fn test_properties_miss_loads_once() {
    let (client, backend) = client(
      MockBackend::new().with_rows("properties", json!([{"id": "p1", "name": "Loft"}])),
    );

    let first = client.fetch(&QuerySpec::properties()).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(*first.data, json!([{"id": "p1", "name": "Loft"}]));

    let second = client.fetch(&QuerySpec::properties()).await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(backend.queries("properties"), 1);

    let entry = client.cache().peek(&query_key!["properties", "list"]).unwrap();
    assert_eq!(entry.updated_at, first.updated_at);
  }

  #[tokio::test]
  async fn test_single_row_lookup() {
    let (client, _) = client(MockBackend::new().with_rows(
      "guests",
      json!([{"id": "g1", "last_name": "Ode"}, {"id": "g2", "last_name": "Ray"}]),
    ));
    let guest = client.fetch(&QuerySpec::guest("g2")).await.unwrap();
    assert_eq!(guest.data["last_name"], "Ray");
  }

  #[derive(Debug, Deserialize, PartialEq)]
  struct Vendor {
    id: String,
    name: String,
  }

  #[tokio::test]
  async fn test_fetch_as_decodes_rows() {
    let (client, _) = client(
      MockBackend::new().with_rows("vendors", json!([{"id": "v1", "name": "Plumbing Co"}])),
    );
    let vendors = client
      .fetch_as::<Vec<Vendor>>(&QuerySpec::vendors())
      .await
      .unwrap();
    assert_eq!(
      vendors.data,
      vec![Vendor {
        id: "v1".to_string(),
        name: "Plumbing Co".to_string()
      }]
    );

    let err = client
      .fetch_as::<Vec<u32>>(&QuerySpec::vendors())
      .await
      .unwrap_err();
    assert!(err.to_string().contains("vendors:list"));
  }

  #[tokio::test]
  async fn test_mutation_invalidates_mapped_keys() {
    let (client, backend) = client(
      MockBackend::new()
        .with_rows("invoices", json!([{"id": "i1", "status": "draft"}]))
        .with_rows("vendors", json!([])),
    );
    client.fetch(&QuerySpec::invoices()).await.unwrap();
    client.fetch(&QuerySpec::invoice("i1")).await.unwrap();
    client.fetch(&QuerySpec::vendors()).await.unwrap();

    client
      .mutate(&Mutation::update("invoices", "i1", json!({"status": "sent"})))
      .await
      .unwrap();

    assert!(!client.cache().is_fresh(&QuerySpec::invoices().key));
    assert!(!client.cache().is_fresh(&QuerySpec::invoice("i1").key));
    assert!(client.cache().is_fresh(&QuerySpec::vendors().key));

    client.fetch(&QuerySpec::invoices()).await.unwrap();
    assert_eq!(backend.queries("invoices"), 3);
    assert_eq!(backend.mutations().len(), 1);
  }

  #[tokio::test]
  async fn test_failed_mutation_leaves_cache_untouched() {
    let (client, backend) = client(MockBackend::new().with_rows("expenses", json!([])));
    client.fetch(&QuerySpec::expenses()).await.unwrap();
    backend.fail_resource("expenses", true);

    let result = client
      .mutate(&Mutation::insert("expenses", json!({"amount": 12})))
      .await;
    assert!(result.is_err());
    assert!(client.cache().is_fresh(&QuerySpec::expenses().key));
  }

  #[tokio::test]
  async fn test_prefetch_is_background() {
    let (client, backend) = client(
      MockBackend::new()
        .with_rows("documents", json!([]))
        .with_latency(std::time::Duration::from_millis(30)),
    );
    let spec = QuerySpec::documents();
    let prefetch = {
      let client = client.clone();
      let spec = spec.clone();
      tokio::spawn(async move { client.prefetch(&spec).await })
    };
    crate::testing::eventually(|| client.cache().is_fetching(&spec.key)).await;
    assert!(!client.cache().is_loading(&spec.key));

    prefetch.await.unwrap().unwrap();
    assert_eq!(backend.queries("documents"), 1);
  }
}
