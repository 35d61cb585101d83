//! Database builder for wiring collaborators into a [`TileDatabase`].
//!
//! The builder takes the [`Config`] plus the pluggable parts of the
//! database: where tiles come from, how per-tile indexes are created, where
//! decoded feature bodies are kept and when idle indexes are evicted.

use crate::cache::{
    EvictionPolicy, FeatureCache, JitteredTtl, MemoryFeatureCache, TileIndexCache, spawn_pruner,
};
use crate::config::Config;
use crate::db::{DatabaseInner, TileDatabase};
use crate::decode::TileDecoder;
use crate::error::{Result, TilepipError};
use crate::index::{IndexFactory, RTreeIndexFactory};
use crate::source::TileSource;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builder for a [`TileDatabase`].
pub struct TileDatabaseBuilder {
    config: Config,
    source: Option<Arc<dyn TileSource>>,
    factory: Option<Arc<dyn IndexFactory>>,
    feature_cache: Option<Arc<dyn FeatureCache>>,
    policy: Option<Arc<dyn EvictionPolicy>>,
    sweep_interval: Option<Duration>,
}

impl std::fmt::Debug for TileDatabaseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileDatabaseBuilder")
            .field("config", &self.config)
            .field("has_source", &self.source.is_some())
            .field("has_feature_cache", &self.feature_cache.is_some())
            .field("policy", &self.policy)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl TileDatabaseBuilder {
    /// Create a builder with the default index factory and eviction policy.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            source: None,
            factory: None,
            feature_cache: None,
            policy: None,
            sweep_interval: None,
        }
    }

    /// Set where tiles are fetched from. Required.
    pub fn tile_source(mut self, source: Arc<dyn TileSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set how per-tile indexes are created (default: R-tree).
    pub fn index_factory(mut self, factory: Arc<dyn IndexFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use `cache` for feature bodies. Enables the feature cache.
    pub fn feature_cache(mut self, cache: Arc<dyn FeatureCache>) -> Self {
        self.config.enable_feature_cache = true;
        self.feature_cache = Some(cache);
        self
    }

    /// Set when unreferenced indexes become eligible for eviction
    /// (default: [`JitteredTtl`]).
    pub fn eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set how often the eviction sweep runs (default: the database TTL).
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Validate the configuration, start the eviction sweeper (and the
    /// feature cache pruner, when a feature cache is in use) and return the
    /// database. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<TileDatabase> {
        self.config.validate().map_err(TilepipError::InvalidConfig)?;

        let source = self
            .source
            .ok_or_else(|| TilepipError::InvalidConfig("a tile source is required".to_string()))?;

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TilepipError::InvalidConfig(
                "TileDatabase must be built inside a tokio runtime".to_string(),
            ));
        }

        let sweep_interval = self
            .sweep_interval
            .unwrap_or_else(|| self.config.database_ttl());
        if sweep_interval.is_zero() {
            return Err(TilepipError::InvalidConfig(
                "sweep interval must be greater than 0".to_string(),
            ));
        }

        let feature_cache = match self.feature_cache {
            Some(cache) => Some(cache),
            None if self.config.enable_feature_cache => Some(Arc::new(MemoryFeatureCache::new(
                self.config.feature_cache_ttl(),
            )) as Arc<dyn FeatureCache>),
            None => None,
        };

        let cache = Arc::new(TileIndexCache::new(
            self.config.database_ttl(),
            self.policy.unwrap_or_else(|| Arc::new(JitteredTtl)),
            self.config.recheck_references_on_sweep,
        ));

        let shutdown = CancellationToken::new();
        let mut workers = vec![cache.spawn_sweeper(sweep_interval, shutdown.clone())];
        if let Some(feature_cache) = &feature_cache {
            workers.push(spawn_pruner(
                Arc::clone(feature_cache),
                self.config.feature_cache_ttl(),
                shutdown.clone(),
            ));
        }

        log::debug!(
            "Opened tile database {} (layer {}, zoom {}, sweep every {:?})",
            self.config.database,
            self.config.layer_name(),
            self.config.zoom,
            sweep_interval
        );

        let inner = DatabaseInner {
            decoder: TileDecoder::new(self.config.layer_name()),
            config: self.config,
            source,
            factory: self.factory.unwrap_or_else(|| Arc::new(RTreeIndexFactory)),
            feature_cache,
            cache,
            point_in_polygon_queries: AtomicU64::new(0),
            intersects_queries: AtomicU64::new(0),
            shutdown,
            workers: parking_lot::Mutex::new(workers),
            closed: AtomicBool::new(false),
        };

        Ok(TileDatabase {
            inner: Arc::new(inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryTileSource;

    #[test]
    fn test_build_requires_runtime() {
        let err = TileDatabaseBuilder::new(Config::new("sf"))
            .tile_source(Arc::new(MemoryTileSource::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, TilepipError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_build_requires_source() {
        let err = TileDatabaseBuilder::new(Config::new("sf")).build().unwrap_err();
        assert!(matches!(err, TilepipError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let err = TileDatabaseBuilder::new(Config::new("sf").with_zoom(30))
            .tile_source(Arc::new(MemoryTileSource::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, TilepipError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_feature_cache_defaults() {
        let db = TileDatabaseBuilder::new(Config::new("sf"))
            .tile_source(Arc::new(MemoryTileSource::new()))
            .build()
            .unwrap();
        assert!(!db.stats().feature_cache_enabled);

        let db = TileDatabaseBuilder::new(Config::new("sf").with_feature_cache(true))
            .tile_source(Arc::new(MemoryTileSource::new()))
            .build()
            .unwrap();
        assert!(db.stats().feature_cache_enabled);

        let db = TileDatabaseBuilder::new(Config::new("sf"))
            .tile_source(Arc::new(MemoryTileSource::new()))
            .feature_cache(Arc::new(MemoryFeatureCache::new(Duration::from_secs(60))))
            .build()
            .unwrap();
        assert!(db.config().enable_feature_cache);
        db.disconnect().await.unwrap();
    }
}
