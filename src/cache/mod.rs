//! Versioned response stores for offline serving.
//!
//! This module provides:
//! - Named stores, one per generation, holding response snapshots keyed by
//!   request identity
//! - Install-time population of the current generation from a manifest
//! - Activation-time pruning of every generation that is not current
//! - Lookup across all generations, so a not-yet-pruned store can still serve

mod lifecycle;
mod storage;
mod traits;

pub use lifecycle::{Ready, StoreLifecycleManager};
pub use storage::{SqliteStore, VersionedStore};
pub use traits::{CacheMatch, CachedEntry, FetchOutcome, ResponseSource};
