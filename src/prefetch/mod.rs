//! Speculative cache warming driven by navigation signals.
//!
//! Prediction ([`predict`]) is a pure function of the signal; scheduling
//! ([`Prefetcher`]) decides which candidates actually load.

mod predict;
mod scheduler;

pub use predict::{predict, PrefetchCandidate, Signal};
pub use scheduler::{PrefetchDecision, Prefetcher};
