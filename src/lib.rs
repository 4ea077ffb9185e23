//! Client-side data layer for a property-management back office: a keyed
//! query cache with stale-while-revalidate reads, a durable snapshot mirror,
//! realtime invalidation from the backend's change feed and speculative
//! prefetching.

pub mod app;
pub mod backend;
pub mod cache;
pub mod config;
pub mod logging;
pub mod persist;
pub mod prefetch;
pub mod query;
pub mod realtime;
pub mod resources;

#[cfg(test)]
pub(crate) mod testing;
