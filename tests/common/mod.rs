#![allow(dead_code)]

use bytes::Bytes;
use futures::future::BoxFuture;
use geo::{Geometry, LineString, Polygon};
use serde_json::{Map, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tilepip::filter::ResultFilter;
use tilepip::index::{IndexFactory, RTreeIndex, SpatialIndex};
use tilepip::source::MemoryTileSource;
use tilepip::{Feature, PlaceResult, TileCoord, TileEncoder, TileId, TileResponse, TileSource};

pub const DATASET: &str = "whosonfirst";
pub const ZOOM: u8 = 12;

/// Mission District, San Francisco.
pub const ORIGIN: (f64, f64) = (-122.414647, 37.759415);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn origin_tile() -> TileCoord {
    TileCoord::from_lon_lat(ORIGIN.0, ORIGIN.1, ZOOM)
}

pub fn offset(coord: TileCoord, dx: u32, dy: u32) -> TileCoord {
    TileCoord::new(coord.z, coord.x + dx, coord.y + dy)
}

pub fn tile_id(coord: TileCoord) -> TileId {
    TileId::new(DATASET, coord)
}

/// Longitude/latitude at a fraction of `coord`'s width and height,
/// measured from its north-west corner.
pub fn at(coord: TileCoord, fx: f64, fy: f64) -> geo::Point<f64> {
    geo::Point::from(coord.to_lon_lat(fx, fy, 1))
}

/// Rectangle spanning fractions of a tile, from `(fx0, fy0)` to `(fx1, fy1)`.
pub fn tile_rect(coord: TileCoord, fx0: f64, fy0: f64, fx1: f64, fy1: f64) -> Polygon<f64> {
    let corners = [(fx0, fy0), (fx1, fy0), (fx1, fy1), (fx0, fy1), (fx0, fy0)];
    let ring: Vec<geo::Coord<f64>> = corners
        .iter()
        .map(|&(fx, fy)| coord.to_lon_lat(fx, fy, 1))
        .collect();
    Polygon::new(LineString::from(ring), vec![])
}

/// Query rectangle from the middle of `from` to the middle of `to`, a
/// little taller than a single row so that it never degenerates.
pub fn query_box(from: TileCoord, to: TileCoord) -> Geometry<f64> {
    let a = at(from, 0.5, 0.4);
    let b = at(to, 0.5, 0.6);
    Geometry::Rect(geo::Rect::new(a.0, b.0))
}

pub fn place(id: i64, placetype: &str, polygon: Polygon<f64>) -> Feature {
    let mut properties = Map::new();
    properties.insert("wof:id".into(), json!(id));
    properties.insert("wof:name".into(), json!(format!("place {}", id)));
    properties.insert("wof:placetype".into(), json!(placetype));
    properties.insert("wof:parent_id".into(), json!(85922583));
    properties.insert("wof:belongsto".into(), json!([85633793, 85922583]));
    properties.insert("mz:is_current".into(), json!(1));

    Feature::new(Some(id), Geometry::Polygon(polygon), properties)
}

pub fn encode(coord: TileCoord, features: Vec<Feature>) -> Bytes {
    let mut encoder = TileEncoder::new(DATASET);
    for feature in features {
        encoder.push(feature);
    }
    encoder.encode(&coord).unwrap()
}

/// Store a tile holding `features` in `source`.
pub fn insert(source: &MemoryTileSource, coord: TileCoord, features: Vec<Feature>) {
    source.insert_tile(&tile_id(coord), encode(coord, features));
}

pub fn ids(results: &[PlaceResult]) -> Vec<i64> {
    results.iter().map(|r| r.id).collect()
}

pub fn no_filters() -> &'static [&'static dyn ResultFilter] {
    &[]
}

/// An index that counts how often it is disconnected.
pub struct CountingIndex {
    inner: RTreeIndex,
    disconnects: Arc<AtomicUsize>,
}

impl SpatialIndex for CountingIndex {
    fn index_feature(&mut self, feature: &Feature) -> tilepip::Result<()> {
        self.inner.index_feature(feature)
    }

    fn point_in_polygon(
        &self,
        point: &geo::Point<f64>,
        filters: &[&dyn ResultFilter],
    ) -> tilepip::Result<Vec<PlaceResult>> {
        self.inner.point_in_polygon(point, filters)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.disconnect();
    }
}

#[derive(Default)]
pub struct CountingFactory {
    pub created: AtomicUsize,
    pub disconnects: Arc<AtomicUsize>,
}

impl CountingFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl IndexFactory for CountingFactory {
    fn create(&self, tile: &TileId) -> tilepip::Result<Box<dyn SpatialIndex>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingIndex {
            inner: RTreeIndex::new(tile.to_string()),
            disconnects: Arc::clone(&self.disconnects),
        }))
    }
}

/// Decrements the in-flight count when a fetch finishes or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A source that fails one path at once and holds every other fetch for
/// `delay` before answering from `tiles`.
pub struct SlowSource {
    pub tiles: MemoryTileSource,
    pub failing: String,
    pub delay: Duration,
    pub in_flight: Arc<AtomicUsize>,
    pub started: AtomicUsize,
}

impl SlowSource {
    pub fn new(failing: &TileId, delay: Duration) -> Self {
        Self {
            tiles: MemoryTileSource::new(),
            failing: failing.path(),
            delay,
            in_flight: Arc::new(AtomicUsize::new(0)),
            started: AtomicUsize::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl TileSource for SlowSource {
    fn fetch<'a>(
        &'a self,
        path: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, tilepip::Result<TileResponse>> {
        Box::pin(async move {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.started.fetch_add(1, Ordering::SeqCst);
            let _guard = InFlight(Arc::clone(&self.in_flight));

            if path == self.failing {
                return Ok(TileResponse::status(500));
            }

            tokio::time::sleep(self.delay).await;
            self.tiles.fetch(path, timeout).await
        })
    }
}
