//! Durable mirror of the query cache.
//!
//! Selected cache entries are written to a local SQLite database on every
//! write and replayed into the cache at startup, so the first screen after a
//! restart can render before any network call completes. The mirror is
//! best-effort: failures are logged and never surface to cache callers.

mod bridge;
mod storage;

pub use bridge::{PersistOptions, PersistenceBridge};
pub use storage::{DurableRecord, DurableStore, NoopStore, SqliteStore};
