use geo::{Coord, Rect};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Deepest zoom level a [`TileCoord`] may address.
pub const MAX_ZOOM: u8 = 24;

/// Latitude limit of the web-mercator projection, in degrees.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// A web-mercator (XYZ / "slippy map") tile address.
///
/// `x` grows eastwards from the antimeridian and `y` grows southwards from
/// the northern projection limit, matching the scheme used by vector tile
/// archives.
///
/// # Examples
///
/// ```
/// use tilepip_types::tile::TileCoord;
///
/// let tile = TileCoord::from_lon_lat(-122.414647, 37.759415, 12);
/// assert_eq!(tile, TileCoord::new(12, 655, 1583));
///
/// let bounds = tile.bounds();
/// assert!(bounds.min().x <= -122.414647 && bounds.max().x >= -122.414647);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    /// Zoom level
    pub z: u8,
    /// Column
    pub x: u32,
    /// Row
    pub y: u32,
}

impl TileCoord {
    /// Create a tile address. Zoom levels beyond [`MAX_ZOOM`] are clamped.
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self {
            z: z.min(MAX_ZOOM),
            x,
            y,
        }
    }

    /// Number of tiles along one side of the grid at `zoom`.
    pub fn grid_size(zoom: u8) -> u32 {
        1u32 << zoom.min(MAX_ZOOM)
    }

    /// The tile containing a longitude/latitude at `zoom`.
    ///
    /// Latitudes are clamped to the projection limit and coordinates on the
    /// far east/south edges are folded into the last column/row.
    pub fn from_lon_lat(lon: f64, lat: f64, zoom: u8) -> Self {
        let zoom = zoom.min(MAX_ZOOM);
        let (wx, wy) = world_position(lon, lat, zoom);
        let last = f64::from(Self::grid_size(zoom) - 1);

        Self {
            z: zoom,
            x: wx.floor().clamp(0.0, last) as u32,
            y: wy.floor().clamp(0.0, last) as u32,
        }
    }

    /// Geographic bounds of this tile (west, south, east, north).
    pub fn bounds(&self) -> Rect<f64> {
        let north_west = self.to_lon_lat(0.0, 0.0, 1);
        let south_east = self.to_lon_lat(1.0, 1.0, 1);
        Rect::new(
            Coord {
                x: north_west.x,
                y: south_east.y,
            },
            Coord {
                x: south_east.x,
                y: north_west.y,
            },
        )
    }

    /// Project a tile-local pixel position into longitude/latitude.
    ///
    /// `extent` is the size of the tile's local coordinate space (4096 for
    /// most vector tiles). Positions outside `0..extent` are valid and land
    /// in the tile's buffer area.
    pub fn to_lon_lat(&self, px: f64, py: f64, extent: u32) -> Coord<f64> {
        let n = f64::from(Self::grid_size(self.z));
        let extent = f64::from(extent.max(1));

        let lon = (f64::from(self.x) + px / extent) / n * 360.0 - 180.0;
        let lat = (PI * (1.0 - 2.0 * (f64::from(self.y) + py / extent) / n))
            .sinh()
            .atan()
            .to_degrees();

        Coord { x: lon, y: lat }
    }

    /// Inverse of [`TileCoord::to_lon_lat`]: the tile-local pixel position of
    /// a longitude/latitude, unrounded.
    pub fn to_tile_pixel(&self, coord: Coord<f64>, extent: u32) -> (f64, f64) {
        let (wx, wy) = world_position(coord.x, coord.y, self.z);
        let extent = f64::from(extent.max(1));

        (
            (wx - f64::from(self.x)) * extent,
            (wy - f64::from(self.y)) * extent,
        )
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Fractional position in the tile grid at `zoom`.
fn world_position(lon: f64, lat: f64, zoom: u8) -> (f64, f64) {
    let n = f64::from(TileCoord::grid_size(zoom));
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();

    let wx = (lon + 180.0) / 360.0 * n;
    let wy = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n;

    (wx, wy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lon_lat_origin() {
        assert_eq!(TileCoord::from_lon_lat(0.0, 0.0, 0), TileCoord::new(0, 0, 0));
        assert_eq!(TileCoord::from_lon_lat(0.1, 0.1, 1), TileCoord::new(1, 1, 0));
        assert_eq!(TileCoord::from_lon_lat(-0.1, -0.1, 1), TileCoord::new(1, 0, 1));
    }

    #[test]
    fn test_from_lon_lat_edges_are_clamped() {
        let tile = TileCoord::from_lon_lat(180.0, -90.0, 3);
        assert_eq!(tile, TileCoord::new(3, 7, 7));

        let tile = TileCoord::from_lon_lat(-180.0, 90.0, 3);
        assert_eq!(tile, TileCoord::new(3, 0, 0));
    }

    #[test]
    fn test_bounds_contain_source_coordinate() {
        let (lon, lat) = (-122.414647, 37.759415);
        let tile = TileCoord::from_lon_lat(lon, lat, 13);
        let bounds = tile.bounds();

        assert!(bounds.min().x <= lon && lon <= bounds.max().x);
        assert!(bounds.min().y <= lat && lat <= bounds.max().y);
    }

    #[test]
    fn test_pixel_projection_round_trip() {
        let tile = TileCoord::new(12, 655, 1583);
        let coord = tile.to_lon_lat(1024.0, 3000.0, 4096);
        let (px, py) = tile.to_tile_pixel(coord, 4096);

        assert!((px - 1024.0).abs() < 1e-6);
        assert!((py - 3000.0).abs() < 1e-6);
    }

    #[test]
    fn test_zoom_is_clamped() {
        let tile = TileCoord::new(40, 1, 1);
        assert_eq!(tile.z, MAX_ZOOM);
    }

    #[test]
    fn test_display() {
        assert_eq!(TileCoord::new(12, 655, 1583).to_string(), "12/655/1583");
    }
}
