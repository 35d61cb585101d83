//! Caches that sit between queries and the tile source.

pub mod eviction;
pub mod feature_cache;
pub mod tile_cache;

pub use eviction::{EvictionPolicy, FixedDelay, JitteredTtl};
pub use feature_cache::{FeatureCache, FeatureCacheRecord, MemoryFeatureCache, spawn_pruner};
pub use tile_cache::{PruneStats, TileCacheStats, TileIndexCache, TileIndexLease};
