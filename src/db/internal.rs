use crate::cache::{FeatureCache, TileIndexCache};
use crate::config::Config;
use crate::decode::TileDecoder;
use crate::error::{Result, TilepipError};
use crate::feature::Feature;
use crate::index::{IndexFactory, SpatialIndex};
use crate::source::{STATUS_NO_CONTENT, STATUS_OK, TileSource, fetch_with_timeout};
use crate::tile::TileId;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared state behind a [`TileDatabase`](super::TileDatabase). Fan-out
/// tasks hold their own `Arc` to it.
pub(crate) struct DatabaseInner {
    pub(crate) config: Config,
    pub(crate) source: Arc<dyn TileSource>,
    pub(crate) factory: Arc<dyn IndexFactory>,
    pub(crate) decoder: TileDecoder,
    pub(crate) feature_cache: Option<Arc<dyn FeatureCache>>,
    pub(crate) cache: Arc<TileIndexCache>,
    pub(crate) point_in_polygon_queries: AtomicU64,
    pub(crate) intersects_queries: AtomicU64,
    pub(crate) shutdown: CancellationToken,
    /// Eviction sweeper and feature cache pruner.
    pub(crate) workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    pub(crate) closed: AtomicBool,
}

impl DatabaseInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TilepipError::Disconnected(self.config.database.clone()));
        }
        Ok(())
    }

    /// Fetch and decode one tile. A tile the source has no content for
    /// yields no features.
    pub(crate) async fn features_for_tile(&self, tile: &TileId) -> Result<Vec<Feature>> {
        let path = tile.path();
        let response =
            fetch_with_timeout(self.source.as_ref(), &path, self.config.fetch_timeout()).await?;

        match response.status {
            STATUS_OK => self.decoder.decode(&response.body, tile),
            STATUS_NO_CONTENT => {
                log::debug!("No content for {}", path);
                Ok(Vec::new())
            }
            status => Err(TilepipError::UnexpectedStatus { path, status }),
        }
    }

    /// Build a fresh index holding every feature of `tile`.
    ///
    /// Repeated features within the tile are indexed once. When the feature
    /// cache is enabled every indexed feature's body is stored in it.
    pub(crate) async fn build_index(&self, tile: &TileId) -> Result<Box<dyn SpatialIndex>> {
        let features = self.features_for_tile(tile).await?;
        let mut index = self.factory.create(tile)?;

        let mut seen = FxHashSet::default();
        let mut bodies = Vec::new();

        for (offset, feature) in features.iter().enumerate() {
            if let Some(key) = feature.cache_key()
                && !seen.insert(key)
            {
                continue;
            }

            index
                .index_feature(feature)
                .map_err(|e| TilepipError::IndexBuild {
                    feature: describe(feature),
                    offset,
                    message: e.to_string(),
                })?;

            if self.feature_cache.is_some() {
                match feature.to_body() {
                    Ok(body) => bodies.push(body),
                    Err(e) => log::warn!(
                        "Failed to serialize feature {} for feature cache: {}",
                        describe(feature),
                        e
                    ),
                }
            }
        }

        self.cache_features(bodies).await;
        Ok(index)
    }

    /// Store feature bodies in the feature cache, if enabled. Failures are
    /// logged and otherwise ignored.
    pub(crate) async fn cache_features(&self, bodies: Vec<Bytes>) {
        let Some(cache) = self.feature_cache.as_ref() else {
            return;
        };
        if bodies.is_empty() {
            return;
        }

        let results = futures::future::join_all(bodies.into_iter().map(|body| cache.put(body))).await;
        for result in results {
            if let Err(e) = result {
                log::warn!("Failed to store feature in feature cache: {}", e);
            }
        }
    }
}

/// Short human-readable identity of a feature for error messages.
pub(crate) fn describe(feature: &Feature) -> String {
    match feature.cache_key() {
        Some(key) => key,
        None => "<no id>".to_string(),
    }
}
