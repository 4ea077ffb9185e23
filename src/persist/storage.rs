//! Durable store trait and SQLite implementation.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::cache::QueryKey;

/// A persisted snapshot of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DurableRecord {
  pub key: QueryKey,
  pub value: Value,
  /// Timestamp of the cache write this snapshot mirrors
  pub updated_at: DateTime<Utc>,
  pub stale_time: Duration,
  /// Absolute expiry; a record is expired once `now >= expires_at`
  pub expires_at: DateTime<Utc>,
  /// Cache version tag the record was written under
  pub buster: String,
  /// The mirrored entry was marked stale after this write
  pub invalidated: bool,
}

impl DurableRecord {
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.expires_at <= now
  }
}

/// Trait for durable store backends.
///
/// Implementations are best-effort mirrors; callers log and ignore errors.
pub trait DurableStore: Send + Sync {
  /// Get the record stored under `key`, expired or not.
  fn get(&self, key: &QueryKey) -> Result<Option<DurableRecord>>;

  /// Insert or overwrite the record for its key.
  fn put(&self, record: &DurableRecord) -> Result<()>;

  /// All records not yet expired at `now`.
  fn load_live(&self, now: DateTime<Utc>) -> Result<Vec<DurableRecord>>;

  /// Remove the record for `key`. Returns whether one existed.
  fn delete(&self, key: &QueryKey) -> Result<bool>;

  /// Mark every record under `prefix` stale. Returns the number marked.
  fn invalidate_prefix(&self, prefix: &QueryKey) -> Result<usize>;

  /// Remove every record under `prefix`. Returns the number removed.
  fn delete_prefix(&self, prefix: &QueryKey) -> Result<usize>;

  /// Remove every record expired at `now`. Returns the number removed.
  fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize>;

  /// Keep at most `max_records`, dropping the oldest writes first.
  fn enforce_budget(&self, max_records: usize) -> Result<usize>;

  /// Every stored record, newest write first.
  fn list(&self) -> Result<Vec<DurableRecord>>;

  /// Remove everything. Returns the number removed.
  fn clear(&self) -> Result<usize>;
}

/// Store that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStore;

impl DurableStore for NoopStore {
  fn get(&self, _key: &QueryKey) -> Result<Option<DurableRecord>> {
    Ok(None)
  }

  fn put(&self, _record: &DurableRecord) -> Result<()> {
    Ok(()) // Discard
  }

  fn load_live(&self, _now: DateTime<Utc>) -> Result<Vec<DurableRecord>> {
    Ok(Vec::new())
  }

  fn delete(&self, _key: &QueryKey) -> Result<bool> {
    Ok(false)
  }

  fn invalidate_prefix(&self, _prefix: &QueryKey) -> Result<usize> {
    Ok(0)
  }

  fn delete_prefix(&self, _prefix: &QueryKey) -> Result<usize> {
    Ok(0)
  }

  fn delete_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }

  fn enforce_budget(&self, _max_records: usize) -> Result<usize> {
    Ok(0)
  }

  fn list(&self) -> Result<Vec<DurableRecord>> {
    Ok(Vec::new())
  }

  fn clear(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read cache schema version: {}", e))?;
    if version != SCHEMA_VERSION {
      // Snapshots are disposable; rebuild rather than migrate.
      conn
        .execute_batch("DROP TABLE IF EXISTS query_snapshots;")
        .map_err(|e| eyre!("Failed to drop outdated snapshots: {}", e))?;
    }
    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    conn
      .pragma_update(None, "user_version", SCHEMA_VERSION)
      .map_err(|e| eyre!("Failed to record cache schema version: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("propsync").join("cache.db"))
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Hashes of stored keys under `prefix`.
  fn hashes_under(conn: &Connection, prefix: &QueryKey) -> Result<Vec<String>> {
    let mut stmt = conn
      .prepare("SELECT key_hash, query_key FROM query_snapshots")
      .map_err(|e| eyre!("Failed to prepare snapshot key scan: {}", e))?;

    let hashes = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
      .map_err(|e| eyre!("Failed to scan snapshot keys: {}", e))?
      .filter_map(|row| row.ok())
      .filter(|(_, key)| {
        serde_json::from_str::<QueryKey>(key).is_ok_and(|key| key.starts_with(prefix))
      })
      .map(|(hash, _)| hash)
      .collect();

    Ok(hashes)
  }

  fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
  ) -> Result<Vec<DurableRecord>> {
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare snapshot query: {}", e))?;

    let records = stmt
      .query_map(params, RawRecord::from_row)
      .map_err(|e| eyre!("Failed to query snapshots: {}", e))?
      .filter_map(|row| row.ok())
      .filter_map(|raw| match raw.decode() {
        Ok(record) => Some(record),
        Err(e) => {
          warn!(error = %e, "skipping undecodable snapshot");
          None
        }
      })
      .collect();

    Ok(records)
  }
}

/// Bumped whenever the snapshot layout changes.
const SCHEMA_VERSION: i64 = 2;

/// Schema for snapshot tables.
const SNAPSHOT_SCHEMA: &str = r#"
-- One row per persisted query result (timestamps in unix nanoseconds)
CREATE TABLE IF NOT EXISTS query_snapshots (
    key_hash TEXT PRIMARY KEY,
    query_key TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    stale_ms INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    buster TEXT NOT NULL,
    invalidated INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_query_snapshots_expires
    ON query_snapshots(expires_at);

CREATE INDEX IF NOT EXISTS idx_query_snapshots_updated
    ON query_snapshots(updated_at);
"#;

const SELECT_COLUMNS: &str = "SELECT query_key, data, updated_at, stale_ms, expires_at, buster, invalidated
   FROM query_snapshots";

/// Row as stored, before JSON and timestamp decoding.
struct RawRecord {
  query_key: String,
  data: Vec<u8>,
  updated_at: i64,
  stale_ms: i64,
  expires_at: i64,
  buster: String,
  invalidated: bool,
}

impl RawRecord {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      query_key: row.get(0)?,
      data: row.get(1)?,
      updated_at: row.get(2)?,
      stale_ms: row.get(3)?,
      expires_at: row.get(4)?,
      buster: row.get(5)?,
      invalidated: row.get(6)?,
    })
  }

  fn decode(self) -> Result<DurableRecord> {
    let key: QueryKey = serde_json::from_str(&self.query_key)
      .map_err(|e| eyre!("Failed to deserialize key '{}': {}", self.query_key, e))?;
    let value: Value = serde_json::from_slice(&self.data)
      .map_err(|e| eyre!("Failed to deserialize snapshot {}: {}", key, e))?;

    Ok(DurableRecord {
      key,
      value,
      updated_at: from_nanos(self.updated_at),
      stale_time: Duration::milliseconds(self.stale_ms),
      expires_at: from_nanos(self.expires_at),
      buster: self.buster,
      invalidated: self.invalidated,
    })
  }
}

impl DurableStore for SqliteStore {
  fn get(&self, key: &QueryKey) -> Result<Option<DurableRecord>> {
    let conn = self.conn()?;
    let sql = format!("{} WHERE key_hash = ?", SELECT_COLUMNS);

    let raw = conn
      .query_row(&sql, params![key.storage_hash()], RawRecord::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to read snapshot {}: {}", key, e))?;

    raw.map(RawRecord::decode).transpose()
  }

  fn put(&self, record: &DurableRecord) -> Result<()> {
    let conn = self.conn()?;
    let query_key = serde_json::to_string(&record.key)
      .map_err(|e| eyre!("Failed to serialize key {}: {}", record.key, e))?;
    let data = serde_json::to_vec(&record.value)
      .map_err(|e| eyre!("Failed to serialize snapshot {}: {}", record.key, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO query_snapshots
           (key_hash, query_key, data, updated_at, stale_ms, expires_at, buster, invalidated)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          record.key.storage_hash(),
          query_key,
          data,
          to_nanos(record.updated_at)?,
          record.stale_time.num_milliseconds(),
          to_nanos(record.expires_at)?,
          record.buster,
          record.invalidated,
        ],
      )
      .map_err(|e| eyre!("Failed to store snapshot {}: {}", record.key, e))?;

    Ok(())
  }

  fn load_live(&self, now: DateTime<Utc>) -> Result<Vec<DurableRecord>> {
    let conn = self.conn()?;
    let sql = format!("{} WHERE expires_at > ? ORDER BY updated_at", SELECT_COLUMNS);
    Self::query_records(&conn, &sql, params![to_nanos(now)?])
  }

  fn delete(&self, key: &QueryKey) -> Result<bool> {
    let conn = self.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM query_snapshots WHERE key_hash = ?",
        params![key.storage_hash()],
      )
      .map_err(|e| eyre!("Failed to delete snapshot {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn invalidate_prefix(&self, prefix: &QueryKey) -> Result<usize> {
    let mut conn = self.conn()?;
    let hashes = Self::hashes_under(&conn, prefix)?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin snapshot update: {}", e))?;
    let mut marked = 0;
    for hash in &hashes {
      marked += tx
        .execute(
          "UPDATE query_snapshots SET invalidated = 1 WHERE key_hash = ? AND invalidated = 0",
          params![hash],
        )
        .map_err(|e| eyre!("Failed to invalidate snapshots under {}: {}", prefix, e))?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit snapshot update: {}", e))?;
    Ok(marked)
  }

  fn delete_prefix(&self, prefix: &QueryKey) -> Result<usize> {
    let mut conn = self.conn()?;
    let hashes = Self::hashes_under(&conn, prefix)?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin snapshot delete: {}", e))?;
    let mut removed = 0;
    for hash in &hashes {
      removed += tx
        .execute("DELETE FROM query_snapshots WHERE key_hash = ?", params![hash])
        .map_err(|e| eyre!("Failed to delete snapshots under {}: {}", prefix, e))?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit snapshot delete: {}", e))?;
    Ok(removed)
  }

  fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute(
        "DELETE FROM query_snapshots WHERE expires_at <= ?",
        params![to_nanos(now)?],
      )
      .map_err(|e| eyre!("Failed to delete expired snapshots: {}", e))
  }

  fn enforce_budget(&self, max_records: usize) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute(
        "DELETE FROM query_snapshots WHERE key_hash IN (
           SELECT key_hash FROM query_snapshots
           ORDER BY updated_at DESC
           LIMIT -1 OFFSET ?
         )",
        params![max_records as i64],
      )
      .map_err(|e| eyre!("Failed to enforce snapshot budget: {}", e))
  }

  fn list(&self) -> Result<Vec<DurableRecord>> {
    let conn = self.conn()?;
    let sql = format!("{} ORDER BY updated_at DESC", SELECT_COLUMNS);
    Self::query_records(&conn, &sql, [])
  }

  fn clear(&self) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM query_snapshots", [])
      .map_err(|e| eyre!("Failed to clear snapshots: {}", e))
  }
}

fn to_nanos(at: DateTime<Utc>) -> Result<i64> {
  at.timestamp_nanos_opt()
    .ok_or_else(|| eyre!("Timestamp out of range: {}", at))
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_nanos(nanos)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;
  use chrono::TimeZone;
  use serde_json::json;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap()
  }

  fn record(key: QueryKey, updated_at: DateTime<Utc>, ttl_minutes: i64) -> DurableRecord {
    DurableRecord {
      key,
      value: json!({"rows": [1, 2, 3]}),
      updated_at,
      stale_time: Duration::minutes(5),
      expires_at: updated_at + Duration::minutes(ttl_minutes),
      buster: "v1".to_string(),
      invalidated: false,
    }
  }

  #[test]
  fn test_put_overwrites_and_get_round_trips() {
    let store = SqliteStore::open_in_memory().unwrap();
    let key = query_key!["properties", "list"];

    store.put(&record(key.clone(), t0(), 60)).unwrap();
    let newer = DurableRecord {
      value: json!(["replaced"]),
      ..record(key.clone(), t0() + Duration::seconds(5), 60)
    };
    store.put(&newer).unwrap();

    assert_eq!(store.list().unwrap().len(), 1);
    assert_eq!(store.get(&key).unwrap(), Some(newer));
    assert_eq!(store.get(&query_key!["missing"]).unwrap(), None);
  }

  #[test]
  fn test_expiry_boundary_counts_as_expired() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .put(&record(query_key!["booking", "b1"], t0(), 10))
      .unwrap();
    store
      .put(&record(query_key!["booking", "b2"], t0(), 20))
      .unwrap();

    let boundary = t0() + Duration::minutes(10);
    let live = store.load_live(boundary).unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].key, query_key!["booking", "b2"]);

    let just_before = boundary - Duration::nanoseconds(1);
    assert_eq!(store.load_live(just_before).unwrap().len(), 2);

    assert_eq!(store.delete_expired(boundary).unwrap(), 1);
    assert!(store.get(&query_key!["booking", "b1"]).unwrap().is_none());
  }

  #[test]
  fn test_budget_drops_oldest_writes() {
    let store = SqliteStore::open_in_memory().unwrap();
    for i in 0..5i64 {
      store
        .put(&record(
          query_key!["invoice", i],
          t0() + Duration::seconds(i),
          60,
        ))
        .unwrap();
    }

    assert_eq!(store.enforce_budget(3).unwrap(), 2);
    let keys: Vec<QueryKey> = store.list().unwrap().into_iter().map(|r| r.key).collect();
    assert_eq!(
      keys,
      vec![
        query_key!["invoice", 4i64],
        query_key!["invoice", 3i64],
        query_key!["invoice", 2i64],
      ]
    );
    assert_eq!(store.enforce_budget(3).unwrap(), 0);
  }

  #[test]
  fn test_delete_and_clear() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put(&record(query_key!["a"], t0(), 60)).unwrap();
    store.put(&record(query_key!["b"], t0(), 60)).unwrap();

    assert!(store.delete(&query_key!["a"]).unwrap());
    assert!(!store.delete(&query_key!["a"]).unwrap());
    assert_eq!(store.clear().unwrap(), 1);
    assert!(store.list().unwrap().is_empty());
  }

  #[test]
  fn test_timestamps_keep_nanosecond_precision() {
    let store = SqliteStore::open_in_memory().unwrap();
    let written = t0() + Duration::nanoseconds(361_778_175);
    let original = record(query_key!["booking", "b1"], written, 60);
    store.put(&original).unwrap();

    let stored = store.get(&original.key).unwrap().unwrap();
    assert_eq!(stored.updated_at, written);
    assert_eq!(stored, original);
  }

  #[test]
  fn test_prefix_operations_match_whole_segments() {
    let store = SqliteStore::open_in_memory().unwrap();
    for key in [
      query_key!["booking", "b1"],
      query_key!["booking", "b2"],
      query_key!["bookings", "list"],
    ] {
      store.put(&record(key, t0(), 60)).unwrap();
    }

    assert_eq!(store.invalidate_prefix(&query_key!["booking"]).unwrap(), 2);
    // Already marked records are not counted twice.
    assert_eq!(store.invalidate_prefix(&query_key!["booking"]).unwrap(), 0);
    assert!(store.get(&query_key!["booking", "b1"]).unwrap().unwrap().invalidated);
    assert!(!store.get(&query_key!["bookings", "list"]).unwrap().unwrap().invalidated);

    assert_eq!(store.delete_prefix(&query_key!["booking", "b2"]).unwrap(), 1);
    assert_eq!(store.list().unwrap().len(), 2);
  }

  #[test]
  fn test_outdated_layout_is_rebuilt_on_open() {
    let dir = std::env::temp_dir().join(format!("propsync-schema-{}", std::process::id()));
    let path = dir.join("cache.db");
    let _ = std::fs::remove_file(&path);
    std::fs::create_dir_all(&dir).unwrap();
    {
      let conn = Connection::open(&path).unwrap();
      conn
        .execute_batch(
          "CREATE TABLE query_snapshots (key_hash TEXT PRIMARY KEY, query_key TEXT NOT NULL);
           INSERT INTO query_snapshots VALUES ('h', '[\"old\"]');",
        )
        .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert!(store.list().unwrap().is_empty());
    store.put(&record(query_key!["a"], t0(), 60)).unwrap();
    drop(store);

    let reopened = SqliteStore::open(&path).unwrap();
    assert_eq!(reopened.list().unwrap().len(), 1);
    drop(reopened);
    let _ = std::fs::remove_dir_all(&dir);
  }
}
