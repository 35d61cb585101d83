//! Per-tile spatial indexes.
//!
//! An index holds the polygonal features of a single tile and answers
//! point-in-polygon queries against them. Indexes are filled once while a
//! tile is built and are read-only afterwards.

use crate::error::{Result, TilepipError};
use crate::feature::Feature;
use crate::filter::{PlaceResult, ResultFilter, matches_all};
use crate::tile::TileId;
use geo::{BoundingRect, Geometry, Intersects, Point};
use parking_lot::RwLock;
use rstar::{AABB, RTree, RTreeObject};
use std::sync::atomic::{AtomicBool, Ordering};

/// A spatial index over one tile's features.
pub trait SpatialIndex: Send + Sync {
    /// Add a feature. Features that cannot contain a point are ignored.
    fn index_feature(&mut self, feature: &Feature) -> Result<()>;

    /// Places whose geometry contains `point` (boundaries included) and
    /// that pass every filter.
    fn point_in_polygon(
        &self,
        point: &Point<f64>,
        filters: &[&dyn ResultFilter],
    ) -> Result<Vec<PlaceResult>>;

    /// Number of indexed features.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release the index's storage. Later queries fail.
    fn disconnect(&self);
}

/// Creates empty indexes for tiles.
pub trait IndexFactory: Send + Sync {
    fn create(&self, tile: &TileId) -> Result<Box<dyn SpatialIndex>>;
}

/// A feature stored in the R-tree with its precomputed result record.
#[derive(Debug, Clone)]
pub struct IndexedFeature {
    pub result: PlaceResult,
    pub geometry: Geometry<f64>,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedFeature {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Default [`SpatialIndex`]: an R-tree of feature bounding boxes refined
/// with exact geometry tests.
#[derive(Debug)]
pub struct RTreeIndex {
    name: String,
    tree: RwLock<RTree<IndexedFeature>>,
    disconnected: AtomicBool,
}

impl RTreeIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tree: RwLock::new(RTree::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

fn is_polygonal(geometry: &Geometry<f64>) -> bool {
    matches!(
        geometry,
        Geometry::Polygon(_) | Geometry::MultiPolygon(_) | Geometry::Rect(_) | Geometry::Triangle(_)
    )
}

impl SpatialIndex for RTreeIndex {
    fn index_feature(&mut self, feature: &Feature) -> Result<()> {
        if self.is_disconnected() {
            return Err(TilepipError::Disconnected(self.name.clone()));
        }

        if !is_polygonal(&feature.geometry) {
            log::debug!(
                "Not indexing non-polygonal feature {:?} in {}",
                feature.wof_id(),
                self.name
            );
            return Ok(());
        }

        let rect = feature.geometry.bounding_rect().ok_or_else(|| {
            TilepipError::InvalidInput(format!("feature {:?} has empty geometry", feature.wof_id()))
        })?;

        let envelope = AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);

        self.tree.get_mut().insert(IndexedFeature {
            result: PlaceResult::from_feature(feature)?,
            geometry: feature.geometry.clone(),
            envelope,
        });

        Ok(())
    }

    fn point_in_polygon(
        &self,
        point: &Point<f64>,
        filters: &[&dyn ResultFilter],
    ) -> Result<Vec<PlaceResult>> {
        if self.is_disconnected() {
            return Err(TilepipError::Disconnected(self.name.clone()));
        }

        let tree = self.tree.read();
        let query = AABB::from_point([point.x(), point.y()]);

        let mut results: Vec<PlaceResult> = tree
            .locate_in_envelope_intersecting(&query)
            .filter(|candidate| candidate.geometry.intersects(point))
            .filter(|candidate| matches_all(&candidate.result, filters))
            .map(|candidate| candidate.result.clone())
            .collect();

        results.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.alt_label.cmp(&b.alt_label)));
        Ok(results)
    }

    fn len(&self) -> usize {
        self.tree.read().size()
    }

    fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            *self.tree.write() = RTree::new();
        }
    }
}

/// Creates [`RTreeIndex`]es.
#[derive(Debug, Clone, Copy, Default)]
pub struct RTreeIndexFactory;

impl IndexFactory for RTreeIndexFactory {
    fn create(&self, tile: &TileId) -> Result<Box<dyn SpatialIndex>> {
        Ok(Box::new(RTreeIndex::new(tile.to_string())))
    }
}
