//! Narrow interface to the hosted backend.
//!
//! The cache layer only depends on [`Backend`]: row queries, row mutations and
//! a per-table change feed. [`RestBackend`] implements it against a
//! PostgREST-style HTTP API with a phoenix-channel realtime socket.

mod realtime;
mod rest;

pub use rest::RestBackend;

use async_trait::async_trait;
use color_eyre::Result;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of row change reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
  Insert,
  Update,
  Delete,
}

impl ChangeOp {
  /// Parse the upper-case operation names used on the realtime wire.
  pub fn from_wire(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "INSERT" => Some(Self::Insert),
      "UPDATE" => Some(Self::Update),
      "DELETE" => Some(Self::Delete),
      _ => None,
    }
  }
}

impl fmt::Display for ChangeOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Insert => "insert",
      Self::Update => "update",
      Self::Delete => "delete",
    })
  }
}

/// Notification that a row in `table` changed on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
  pub table: String,
  pub op: ChangeOp,
  pub row_id: Option<String>,
}

impl ChangeEvent {
  pub fn new(table: impl Into<String>, op: ChangeOp) -> Self {
    Self {
      table: table.into(),
      op,
      row_id: None,
    }
  }

  pub fn with_row(mut self, row_id: impl Into<String>) -> Self {
    self.row_id = Some(row_id.into());
    self
  }
}

/// Stream of change events for one table. Dropping it releases the channel.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
  Eq,
  In,
}

impl FilterOp {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Eq => "eq",
      Self::In => "in",
    }
  }
}

/// A single column filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
  pub column: String,
  pub op: FilterOp,
  pub value: String,
}

impl Filter {
  pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
    Self {
      column: column.into(),
      op,
      value: value.into(),
    }
  }

  pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
    Self::new(column, FilterOp::Eq, value)
  }

  pub fn one_of<I, S>(column: impl Into<String>, values: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let joined = values
      .into_iter()
      .map(|v| v.as_ref().to_string())
      .collect::<Vec<_>>()
      .join(",");
    Self::new(column, FilterOp::In, format!("({})", joined))
  }

  /// Value in `op.value` form, e.g. `eq.confirmed`.
  pub fn expression(&self) -> String {
    format!("{}.{}", self.op.as_str(), self.value)
  }
}

/// Sort order for a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Order {
  pub column: String,
  pub ascending: bool,
}

/// A read against one backend table or view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceQuery {
  pub resource: String,
  pub select: Option<String>,
  pub filters: Vec<Filter>,
  pub order: Option<Order>,
  pub limit: Option<u32>,
  /// Expect exactly one row and return it as an object
  pub single: bool,
}

impl ResourceQuery {
  pub fn table(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      select: None,
      filters: Vec::new(),
      order: None,
      limit: None,
      single: false,
    }
  }

  pub fn select(mut self, columns: impl Into<String>) -> Self {
    self.select = Some(columns.into());
    self
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
    self.order = Some(Order {
      column: column.into(),
      ascending,
    });
    self
  }

  pub fn limit(mut self, limit: u32) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn single(mut self) -> Self {
    self.single = true;
    self
  }

  /// Stable textual identity of the filters, order and shape of this query.
  ///
  /// Filtered list keys end with it, so two spellings of the same query share
  /// one cache entry.
  pub fn fingerprint(&self) -> String {
    let mut filters: Vec<String> = self
      .filters
      .iter()
      .map(|f| format!("{}={}", f.column, f.expression()))
      .collect();
    filters.sort();

    let mut parts = vec![filters.join("&")];
    if let Some(select) = &self.select {
      parts.push(format!("select={}", select));
    }
    if let Some(order) = &self.order {
      parts.push(format!(
        "order={}.{}",
        order.column,
        if order.ascending { "asc" } else { "desc" }
      ));
    }
    if let Some(limit) = self.limit {
      parts.push(format!("limit={}", limit));
    }
    if self.single {
      parts.push("single".to_string());
    }
    parts.join(";")
  }
}

/// Kind of write sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
  Insert,
  Update { id: String },
  Delete { id: String },
}

/// A write against one backend table.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
  pub resource: String,
  pub op: MutationOp,
  pub payload: Value,
}

impl Mutation {
  pub fn insert(resource: impl Into<String>, payload: Value) -> Self {
    Self {
      resource: resource.into(),
      op: MutationOp::Insert,
      payload,
    }
  }

  pub fn update(resource: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
    Self {
      resource: resource.into(),
      op: MutationOp::Update { id: id.into() },
      payload,
    }
  }

  pub fn delete(resource: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      op: MutationOp::Delete { id: id.into() },
      payload: Value::Null,
    }
  }

  pub fn change_op(&self) -> ChangeOp {
    match self.op {
      MutationOp::Insert => ChangeOp::Insert,
      MutationOp::Update { .. } => ChangeOp::Update,
      MutationOp::Delete { .. } => ChangeOp::Delete,
    }
  }

  /// Row id targeted by the mutation, if known before it runs.
  pub fn row_id(&self) -> Option<&str> {
    match &self.op {
      MutationOp::Insert => None,
      MutationOp::Update { id } | MutationOp::Delete { id } => Some(id),
    }
  }
}

/// The backend operations the cache layer relies on.
#[async_trait]
pub trait Backend: Send + Sync {
  /// Read rows (or a single row when `query.single`).
  async fn query(&self, query: &ResourceQuery) -> Result<Value>;

  /// Apply a write and return the affected row.
  async fn mutate(&self, mutation: &Mutation) -> Result<Value>;

  /// Open a change feed for `table`.
  async fn subscribe(&self, table: &str) -> Result<ChangeStream>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fingerprint_ignores_filter_order() {
    let a = ResourceQuery::table("bookings")
      .filter(Filter::eq("property_id", "p1"))
      .filter(Filter::eq("status", "confirmed"))
      .order_by("check_in", true);
    let b = ResourceQuery::table("bookings")
      .filter(Filter::eq("status", "confirmed"))
      .filter(Filter::eq("property_id", "p1"))
      .order_by("check_in", true);
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_ne!(a.fingerprint(), b.limit(10).fingerprint());
  }

  #[test]
  fn test_filter_expressions() {
    assert_eq!(Filter::eq("status", "paid").expression(), "eq.paid");
    assert_eq!(
      Filter::one_of("status", ["draft", "sent"]).expression(),
      "in.(draft,sent)"
    );
  }

  #[test]
  fn test_mutation_row_and_op() {
    let update = Mutation::update("bookings", "b1", serde_json::json!({"status": "cancelled"}));
    assert_eq!(update.row_id(), Some("b1"));
    assert_eq!(update.change_op(), ChangeOp::Update);
    assert_eq!(
      Mutation::insert("guests", Value::Null).row_id(),
      None
    );
  }

  #[test]
  fn test_change_op_from_wire() {
    assert_eq!(ChangeOp::from_wire("UPDATE"), Some(ChangeOp::Update));
    assert_eq!(ChangeOp::from_wire("delete"), Some(ChangeOp::Delete));
    assert_eq!(ChangeOp::from_wire("TRUNCATE"), None);
  }
}
