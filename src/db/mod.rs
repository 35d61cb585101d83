//! Query engine over a tiled dataset.
//!
//! This module defines [`TileDatabase`], which answers point-in-polygon and
//! intersection queries by decoding the vector tiles that cover the query
//! and caching one small spatial index per tile.

use crate::cache::{FeatureCache, PruneStats, TileCacheStats, TileIndexCache};
use crate::config::Config;
use crate::error::{Result, TilepipError};
use crate::feature::Feature;
use crate::filter::{PlaceResult, ResultFilter};
use crate::tile::TileId;
use crate::uri::WofUri;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use geo::{Geometry, Point};
use std::sync::Arc;
use std::sync::atomic::Ordering;

mod internal;
mod intersects;

pub(crate) use internal::DatabaseInner;

/// Database statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub tiles: TileCacheStats,
    pub point_in_polygon_queries: u64,
    pub intersects_queries: u64,
    pub feature_cache_enabled: bool,
}

/// A read-only spatial database backed by vector tiles.
///
/// Tiles are fetched from a [`TileSource`](crate::source::TileSource) at the
/// configured zoom. Point-in-polygon queries build (or reuse) a spatial index
/// for the single tile containing the point; indexes no longer in use are
/// evicted by a background sweep. Intersection queries decode every covering
/// tile concurrently and merge places split across tile boundaries.
///
/// A `TileDatabase` must be created inside a tokio runtime. It is `Send` and
/// `Sync`; share it behind an `Arc`.
///
/// # Examples
///
/// ```rust
/// use geo::{Point, polygon, Geometry};
/// use serde_json::{Map, json};
/// use std::sync::Arc;
/// use tilepip::{Config, Feature, TileDatabaseBuilder, TileEncoder, TileId};
/// use tilepip::source::MemoryTileSource;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> tilepip::Result<()> {
/// let point = Point::new(-122.414647, 37.759415);
/// let tile = TileId::for_lon_lat("whosonfirst", point.x(), point.y(), 12);
///
/// let mut properties = Map::new();
/// properties.insert("wof:id".into(), json!(1108830809));
/// properties.insert("wof:name".into(), json!("Mission"));
/// properties.insert("wof:placetype".into(), json!("neighbourhood"));
///
/// let bounds = tile.coord.bounds();
/// let square = polygon![
///     (x: bounds.min().x, y: bounds.min().y),
///     (x: bounds.max().x, y: bounds.min().y),
///     (x: bounds.max().x, y: bounds.max().y),
///     (x: bounds.min().x, y: bounds.max().y),
/// ];
/// let body = TileEncoder::new("whosonfirst")
///     .with_feature(Feature::new(Some(1108830809), Geometry::Polygon(square), properties))
///     .encode(&tile.coord)?;
///
/// let source = Arc::new(MemoryTileSource::new());
/// source.insert_tile(&tile, body);
///
/// let db = TileDatabaseBuilder::new(Config::new("whosonfirst"))
///     .tile_source(source)
///     .build()?;
///
/// let places = db.point_in_polygon(&point, &[]).await?;
/// assert_eq!(places[0].id, 1108830809);
///
/// db.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct TileDatabase {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for TileDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileDatabase")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TileDatabase {
    /// Start building a database for `config`.
    pub fn builder(config: Config) -> crate::builder::TileDatabaseBuilder {
        crate::builder::TileDatabaseBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Fetch and decode the features of a single tile.
    ///
    /// A tile the source has no content for (status 204) has no features;
    /// any status other than 200 or 204 is an error.
    pub async fn features_for_tile(&self, tile: &TileId) -> Result<Vec<Feature>> {
        self.inner.features_for_tile(tile).await
    }

    /// Places containing `point` (longitude, latitude) that pass every
    /// filter, ordered by id.
    pub async fn point_in_polygon(
        &self,
        point: &Point<f64>,
        filters: &[&dyn ResultFilter],
    ) -> Result<Vec<PlaceResult>> {
        self.inner.ensure_open()?;
        validate_point(point)?;

        let config = &self.inner.config;
        let tile = TileId::for_lon_lat(config.database.clone(), point.x(), point.y(), config.zoom);

        let result = self.query_tile(&tile, point, filters).await;
        self.inner
            .point_in_polygon_queries
            .fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn query_tile(
        &self,
        tile: &TileId,
        point: &Point<f64>,
        filters: &[&dyn ResultFilter],
    ) -> Result<Vec<PlaceResult>> {
        let inner = &self.inner;
        let lease = inner
            .cache
            .acquire(tile, || inner.build_index(tile))
            .await
            .map_err(|e| e.in_tile(tile))?;

        lease.point_in_polygon(point, filters)
    }

    /// Streaming form of [`point_in_polygon`](Self::point_in_polygon).
    pub fn point_in_polygon_stream<'a>(
        &'a self,
        point: Point<f64>,
        filters: &'a [&'a dyn ResultFilter],
    ) -> BoxStream<'a, Result<PlaceResult>> {
        stream::once(async move { self.point_in_polygon(&point, filters).await })
            .flat_map(|result| match result {
                Ok(places) => stream::iter(places.into_iter().map(Ok)).left_stream(),
                Err(e) => stream::iter(std::iter::once(Err(e))).right_stream(),
            })
            .boxed()
    }

    /// Places whose geometry intersects `geometry` and that pass every
    /// filter, ordered by id.
    ///
    /// Fails with the first tile error; no tile task outlives the call.
    pub async fn intersects(
        &self,
        geometry: &Geometry<f64>,
        filters: &[&dyn ResultFilter],
    ) -> Result<Vec<PlaceResult>> {
        self.intersects_stream(geometry, filters).try_collect().await
    }

    /// Streaming form of [`intersects`](Self::intersects). All covering
    /// tiles are fetched before the first result is produced.
    pub fn intersects_stream<'a>(
        &'a self,
        geometry: &'a Geometry<f64>,
        filters: &'a [&'a dyn ResultFilter],
    ) -> BoxStream<'a, Result<PlaceResult>> {
        intersects::intersects_stream(&self.inner, geometry, filters)
    }

    /// Read a feature body by record path (`1108830809.geojson`,
    /// `110/883/080/9/1108830809.geojson`, `1108830809-alt-label.geojson`
    /// or a bare id).
    ///
    /// Records are only served from the feature cache; a disabled cache or
    /// an unknown record is [`TilepipError::NotFound`].
    pub async fn read(&self, path: &str) -> Result<Bytes> {
        let cache = self.feature_cache(path)?;
        let uri = WofUri::parse(path)?;
        let record = cache.get(&uri.cache_key()).await?;
        Ok(record.body)
    }

    /// Whether the feature cache holds the record at `path`.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let cache = self.feature_cache(path)?;
        let uri = WofUri::parse(path)?;

        match cache.get(&uri.cache_key()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn feature_cache(&self, path: &str) -> Result<&Arc<dyn FeatureCache>> {
        self.inner.ensure_open()?;
        self.inner
            .feature_cache
            .as_ref()
            .ok_or_else(|| TilepipError::NotFound(path.to_string()))
    }

    /// Tiles are immutable; always [`TilepipError::NotImplemented`].
    pub async fn index_feature(&self, _body: &[u8]) -> Result<()> {
        Err(TilepipError::NotImplemented("index_feature"))
    }

    /// Tiles are immutable; always [`TilepipError::NotImplemented`].
    pub async fn remove_feature(&self, _id: i64) -> Result<()> {
        Err(TilepipError::NotImplemented("remove_feature"))
    }

    /// Run one eviction sweep now.
    pub async fn prune_expired(&self) -> PruneStats {
        self.inner.cache.prune_expired().await
    }

    pub fn stats(&self) -> DatabaseStats {
        let inner = &self.inner;

        DatabaseStats {
            tiles: inner.cache.stats(),
            point_in_polygon_queries: inner.point_in_polygon_queries.load(Ordering::Relaxed),
            intersects_queries: inner.intersects_queries.load(Ordering::Relaxed),
            feature_cache_enabled: self.inner.feature_cache.is_some(),
        }
    }

    /// Stop the background tasks, disconnect every cached index and close the
    /// feature cache. Later queries fail with
    /// [`TilepipError::Disconnected`]. Calling this more than once is a
    /// no-op.
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.shutdown.cancel();

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                log::warn!("Background task ended abnormally: {}", e);
            }
        }

        let disconnected = self.inner.cache.disconnect_all().await;
        log::info!(
            "Disconnected {} tile indexes for {}",
            disconnected,
            self.inner.config.database
        );

        if let Some(cache) = self.inner.feature_cache.as_ref() {
            cache.close().await?;
        }

        Ok(())
    }
}

impl Drop for TileDatabase {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn validate_point(point: &Point<f64>) -> Result<()> {
    let (lon, lat) = (point.x(), point.y());

    if !lon.is_finite() || !lat.is_finite() {
        return Err(TilepipError::InvalidInput(format!(
            "Coordinate ({}, {}) is not finite",
            lon, lat
        )));
    }
    if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return Err(TilepipError::InvalidInput(format!(
            "Coordinate ({}, {}) is out of range",
            lon, lat
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_point() {
        assert!(validate_point(&Point::new(-122.4, 37.7)).is_ok());
        assert!(validate_point(&Point::new(180.0, -90.0)).is_ok());
        assert!(validate_point(&Point::new(f64::NAN, 0.0)).is_err());
        assert!(validate_point(&Point::new(0.0, f64::INFINITY)).is_err());
        assert!(validate_point(&Point::new(181.0, 0.0)).is_err());
        assert!(validate_point(&Point::new(0.0, -91.0)).is_err());
    }

    #[tokio::test]
    async fn test_query_counts_pass_i32_max() {
        let db = TileDatabase::builder(Config::new("sf"))
            .tile_source(Arc::new(crate::source::MemoryTileSource::new()))
            .build()
            .unwrap();

        let start = i32::MAX as u64;
        db.inner
            .point_in_polygon_queries
            .store(start, Ordering::Relaxed);
        db.inner.intersects_queries.store(start, Ordering::Relaxed);

        let point = Point::new(-122.414647, 37.759415);
        assert!(db.point_in_polygon(&point, &[]).await.unwrap().is_empty());
        assert!(db.intersects(&Geometry::Point(point), &[]).await.unwrap().is_empty());

        let stats = db.stats();
        assert_eq!(stats.point_in_polygon_queries, start + 1);
        assert_eq!(stats.intersects_queries, start + 1);
    }
}
