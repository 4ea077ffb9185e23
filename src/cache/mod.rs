//! In-memory query cache.
//!
//! This module provides the process-wide cache that:
//! - Stores fetched payloads under structured keys with a staleness window
//! - Shares a single in-flight load between concurrent callers of the same key
//! - Marks entries stale by key prefix (stale-while-revalidate) or evicts them
//! - Collects entries nobody has observed for an idle budget
//! - Notifies a write hook so durable mirroring can live outside the cache

mod key;
mod layer;
mod traits;

pub use key::{KeySegment, QueryKey};
pub use layer::{CacheStats, LoadError, QueryCache, Subscription};
pub use traits::{
  CacheEntry, CacheResult, CacheSource, CacheWriteHook, Clock, FetchOptions, ManualClock,
  NoopHook, SystemClock,
};
