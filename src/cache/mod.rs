//! Network interception and response caching for offline support.
//!
//! This module provides the caching proxy that sits between pages and the network:
//! - Classifies same-origin GET responses into static, dynamic and image partitions
//! - Serves hits immediately and refreshes them in the background
//! - Bounds every partition with FIFO eviction
//! - Namespaces partitions by version and drops old generations on activation
//! - Falls back to an offline page (or an empty 503) when the network is gone

mod fetch;
mod layer;
mod storage;
mod traits;
mod worker;

pub use fetch::HttpFetcher;
pub use layer::{CacheLayer, CachePolicy, PartitionLimits};
pub use storage::{CacheStorage, NoopStorage, SqliteCacheStorage};
pub use traits::Request;
pub use worker::{spawn_worker, ClientMessage, WorkerHandle};
