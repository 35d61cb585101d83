//! # tilepip-types
//!
//! Tile addressing types shared by the tilepip query engine.
//!
//! - **Tile coordinates**: [`tile::TileCoord`], web-mercator XYZ addresses with
//!   conversions between geographic coordinates and tile-local pixel space.
//!
//! ## Examples
//!
//! ```rust
//! use tilepip_types::tile::TileCoord;
//!
//! let tile = TileCoord::from_lon_lat(-74.0060, 40.7128, 12);
//! let centre = tile.to_lon_lat(2048.0, 2048.0, 4096);
//! assert_eq!(TileCoord::from_lon_lat(centre.x, centre.y, 12), tile);
//! ```

pub mod tile;

pub use geo;
