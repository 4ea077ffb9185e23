//! Table to cache-key mapping rules.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;

use crate::backend::ChangeEvent;
use crate::cache::QueryKey;
use crate::query_key;

/// Cache keys affected by changes to one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMapping {
  /// Prefixes of aggregate queries (lists, stats) that any row change touches
  pub list_prefixes: Vec<QueryKey>,
  /// Prefix of per-row keys; the row id is appended as the next segment
  pub row_prefix: Option<QueryKey>,
}

impl TableMapping {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn list(mut self, prefix: QueryKey) -> Self {
    self.list_prefixes.push(prefix);
    self
  }

  pub fn rows(mut self, prefix: QueryKey) -> Self {
    self.row_prefix = Some(prefix);
    self
  }
}

/// Registry of [`TableMapping`]s keyed by table name.
#[derive(Debug, Clone, Default)]
pub struct KeyMappingRegistry {
  tables: HashMap<String, TableMapping>,
}

impl KeyMappingRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(mut self, table: impl Into<String>, mapping: TableMapping) -> Self {
    self.tables.insert(table.into(), mapping);
    self
  }

  pub fn contains(&self, table: &str) -> bool {
    self.tables.contains_key(table)
  }

  /// Fail if any watched table has no mapping, naming all of them.
  pub fn validate(&self, watched: &[String]) -> Result<()> {
    let mut missing: Vec<&str> = watched
      .iter()
      .map(String::as_str)
      .filter(|table| !self.contains(table))
      .collect();
    if missing.is_empty() {
      return Ok(());
    }
    missing.sort_unstable();
    missing.dedup();
    Err(eyre!(
      "No cache key mapping for watched table(s): {}",
      missing.join(", ")
    ))
  }

  /// Keys to invalidate for `event`.
  ///
  /// With a row id, only that row's key is targeted alongside the list
  /// prefixes; without one, every row of the table is.
  pub fn keys_for(&self, event: &ChangeEvent) -> Vec<QueryKey> {
    let Some(mapping) = self.tables.get(&event.table) else {
      return Vec::new();
    };

    let mut keys = Vec::with_capacity(mapping.list_prefixes.len() + 1);
    if let Some(row_prefix) = &mapping.row_prefix {
      keys.push(match &event.row_id {
        Some(id) => row_prefix.clone().with(id),
        None => row_prefix.clone(),
      });
    }
    keys.extend(mapping.list_prefixes.iter().cloned());
    keys
  }

  /// Mapping for the property-management tables, matching the key scheme in
  /// [`crate::resources`].
  pub fn property_management() -> Self {
    Self::new()
      .register(
        "properties",
        TableMapping::new()
          .rows(query_key!["property"])
          .list(query_key!["properties"])
          .list(query_key!["dashboard"])
          .list(query_key!["reports"]),
      )
      .register(
        "bookings",
        TableMapping::new()
          .rows(query_key!["booking"])
          .list(query_key!["bookings"])
          .list(query_key!["calendar"])
          .list(query_key!["dashboard"])
          .list(query_key!["reports"]),
      )
      .register(
        "guests",
        TableMapping::new()
          .rows(query_key!["guest"])
          .list(query_key!["guests"]),
      )
      .register(
        "invoices",
        TableMapping::new()
          .rows(query_key!["invoice"])
          .list(query_key!["invoices"])
          .list(query_key!["dashboard"])
          .list(query_key!["reports"]),
      )
      .register(
        "expenses",
        TableMapping::new()
          .rows(query_key!["expense"])
          .list(query_key!["expenses"])
          .list(query_key!["dashboard"])
          .list(query_key!["reports"]),
      )
      .register(
        "vendors",
        TableMapping::new()
          .rows(query_key!["vendor"])
          .list(query_key!["vendors"]),
      )
      .register(
        "documents",
        TableMapping::new()
          .rows(query_key!["document"])
          .list(query_key!["documents"]),
      )
      .register("media", TableMapping::new().list(query_key!["media"]))
  }
}
