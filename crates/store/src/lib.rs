//! Fleet store: in-RAM watch caches and the per-cluster cache manager.

#![forbid(unsafe_code)]

pub mod manager;
pub mod state;
pub mod watch_cache;

pub use manager::{CacheManager, ReconcileReport};
pub use state::{ApplyOutcome, CacheSnapshot, CacheState};
pub use watch_cache::WatchCache;
