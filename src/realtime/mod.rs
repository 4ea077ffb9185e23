//! Realtime invalidation: turns backend change events into cache
//! invalidations.

mod registry;
mod router;

pub use registry::{KeyMappingRegistry, TableMapping};
pub use router::{FeedStatus, InvalidationRouter, ReconnectConfig, RouterHandle};
