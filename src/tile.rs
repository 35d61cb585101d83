//! Tile identities within a dataset and tile cover enumeration.

use crate::error::{Result, TilepipError};
use geo::{BoundingRect, Geometry, Intersects};
use std::fmt;
use tilepip_types::tile::{MAX_LATITUDE, MAX_ZOOM, TileCoord};

/// A tile of a named dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    pub dataset: String,
    pub coord: TileCoord,
}

impl TileId {
    pub fn new(dataset: impl Into<String>, coord: TileCoord) -> Self {
        Self {
            dataset: dataset.into(),
            coord,
        }
    }

    /// The tile of `dataset` containing a longitude/latitude at `zoom`.
    pub fn for_lon_lat(dataset: impl Into<String>, lon: f64, lat: f64, zoom: u8) -> Self {
        Self::new(dataset, TileCoord::from_lon_lat(lon, lat, zoom))
    }

    /// Path the tile is fetched from: `/{dataset}/{z}/{x}/{y}.mvt`.
    pub fn path(&self) -> String {
        format!(
            "/{}/{}/{}/{}.mvt",
            self.dataset, self.coord.z, self.coord.x, self.coord.y
        )
    }

    /// Key used for the index cache and its reference counter:
    /// `{dataset}-{z}-{x}-{y}.db`.
    pub fn cache_key(&self) -> String {
        format!(
            "{}-{}-{}-{}.db",
            self.dataset, self.coord.z, self.coord.x, self.coord.y
        )
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.coord)
    }
}

/// Tiles at `zoom` whose footprint intersects `geometry`.
///
/// Tiles are enumerated over the geometry's bounding box (latitudes clamped
/// to the web-mercator limit) and kept when their bounds intersect the
/// geometry itself. Output is sorted by column, then row.
///
/// ```rust
/// use geo::{Geometry, Rect, coord};
/// use tilepip::tile::tile_cover;
///
/// let rect = Rect::new(coord! { x: -1.0, y: -1.0 }, coord! { x: 1.0, y: 1.0 });
/// let tiles = tile_cover(&Geometry::Rect(rect), 1).unwrap();
/// assert_eq!(tiles.len(), 4);
/// ```
pub fn tile_cover(geometry: &Geometry<f64>, zoom: u8) -> Result<Vec<TileCoord>> {
    tile_cover_bounded(geometry, zoom, 0)
}

/// Like [`tile_cover`], but fails when the geometry's bounding box spans
/// more than `max_tiles` tiles. A `max_tiles` of 0 means no limit.
pub fn tile_cover_bounded(
    geometry: &Geometry<f64>,
    zoom: u8,
    max_tiles: usize,
) -> Result<Vec<TileCoord>> {
    if zoom > MAX_ZOOM {
        return Err(TilepipError::TileCover(format!(
            "zoom {} exceeds maximum of {}",
            zoom, MAX_ZOOM
        )));
    }

    let bounds = geometry
        .bounding_rect()
        .ok_or_else(|| TilepipError::TileCover("geometry has no bounds".to_string()))?;

    let (min, max) = (bounds.min(), bounds.max());
    if ![min.x, min.y, max.x, max.y].iter().all(|v| v.is_finite()) {
        return Err(TilepipError::TileCover(
            "geometry bounds are not finite".to_string(),
        ));
    }

    let west = min.x.clamp(-180.0, 180.0);
    let east = max.x.clamp(-180.0, 180.0);
    let south = min.y.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let north = max.y.clamp(-MAX_LATITUDE, MAX_LATITUDE);

    let top_left = TileCoord::from_lon_lat(west, north, zoom);
    let bottom_right = TileCoord::from_lon_lat(east, south, zoom);

    let columns = (bottom_right.x - top_left.x + 1) as usize;
    let rows = (bottom_right.y - top_left.y + 1) as usize;
    let span = columns.saturating_mul(rows);
    if max_tiles > 0 && span > max_tiles {
        return Err(TilepipError::TileCover(format!(
            "{} tiles at zoom {} exceeds the maximum cover of {}",
            span, zoom, max_tiles
        )));
    }

    let mut tiles = Vec::with_capacity(span);
    for x in top_left.x..=bottom_right.x {
        for y in top_left.y..=bottom_right.y {
            let tile = TileCoord::new(zoom, x, y);
            if geometry.intersects(&tile.bounds()) {
                tiles.push(tile);
            }
        }
    }

    Ok(tiles)
}
