//! Point-in-polygon and intersection queries over vector-tiled place data.
//!
//! Features are read from gzip-compressed Mapbox vector tiles on demand. Each
//! tile touched by a point query gets a small spatial index, cached while in
//! use and evicted some time after its last use.
//!
//! ```rust,no_run
//! use geo::Point;
//! use std::sync::Arc;
//! use tilepip::source::DirectoryTileSource;
//! use tilepip::{Config, PlaceFilter, TileDatabaseBuilder};
//!
//! # async fn run() -> tilepip::Result<()> {
//! let config = Config::new("whosonfirst").with_zoom(12);
//! let db = TileDatabaseBuilder::new(config)
//!     .tile_source(Arc::new(DirectoryTileSource::new("/var/tiles")))
//!     .build()?;
//!
//! let neighbourhoods = PlaceFilter::new().with_placetypes(["neighbourhood"]);
//! let places = db
//!     .point_in_polygon(&Point::new(-122.414647, 37.759415), &[&neighbourhoods])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod counter;
pub mod db;
pub mod decode;
pub mod encode;
pub mod error;
pub mod feature;
pub mod filter;
pub mod index;
pub mod properties;
pub mod source;
pub mod tile;
pub mod uri;

pub use builder::TileDatabaseBuilder;
pub use cache::{
    EvictionPolicy, FeatureCache, FeatureCacheRecord, FixedDelay, JitteredTtl, MemoryFeatureCache,
    TileIndexCache, TileIndexLease,
};
pub use config::Config;
pub use counter::NamedCounter;
pub use db::{DatabaseStats, TileDatabase};
pub use decode::TileDecoder;
pub use encode::TileEncoder;
pub use error::{Result, TilepipError};
pub use feature::Feature;
pub use filter::{PlaceFilter, PlaceResult, ResultFilter};
pub use index::{IndexFactory, RTreeIndex, RTreeIndexFactory, SpatialIndex};
pub use source::{TileResponse, TileSource};
pub use tile::{TileId, tile_cover, tile_cover_bounded};
pub use uri::WofUri;

pub use tilepip_types::tile::TileCoord;

pub use geo::{Geometry, Point, Polygon};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{Config, Result, TileDatabase, TileDatabaseBuilder, TilepipError};

    pub use geo::{Geometry, Point, Polygon};

    pub use crate::{PlaceFilter, PlaceResult, ResultFilter};

    pub use crate::source::{DirectoryTileSource, MemoryTileSource, TileSource};

    pub use crate::{TileCoord, TileId};
}
