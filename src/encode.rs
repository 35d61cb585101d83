//! Vector tile encoding.
//!
//! [`TileEncoder`] is the write-side inverse of [`TileDecoder`]: it projects
//! longitude/latitude features into one tile's coordinate space and packs
//! them into a gzip-compressed single-layer vector tile. Structured property
//! values are flattened into JSON strings.
//!
//! [`TileDecoder`]: crate::decode::TileDecoder

use crate::decode::{
    CMD_CLOSE_PATH, CMD_LINE_TO, CMD_MOVE_TO, DEFAULT_EXTENT, command_encode, zigzag_encode,
};
use crate::error::Result;
use crate::feature::Feature;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use geo::{Coord, Geometry, LineString, Polygon};
use geozero::mvt::{Message, TagsBuilder, Tile, TileValue, tile};
use serde_json::Value;
use std::io::Write;
use tilepip_types::tile::TileCoord;

/// Builds single-layer vector tiles from features.
///
/// ```rust
/// use geo::{Geometry, Point};
/// use serde_json::Map;
/// use tilepip::decode::TileDecoder;
/// use tilepip::encode::TileEncoder;
/// use tilepip::feature::Feature;
/// use tilepip::tile::TileId;
///
/// let tile = TileId::for_lon_lat("sf", -122.4, 37.76, 12);
/// let body = TileEncoder::new("sf")
///     .with_feature(Feature::new(Some(1), Geometry::Point(Point::new(-122.4, 37.76)), Map::new()))
///     .encode(&tile.coord)
///     .unwrap();
///
/// let features = TileDecoder::new("sf").decode(&body, &tile).unwrap();
/// assert_eq!(features.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct TileEncoder {
    layer: String,
    extent: u32,
    features: Vec<Feature>,
}

impl TileEncoder {
    pub fn new(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            extent: DEFAULT_EXTENT,
            features: Vec::new(),
        }
    }

    pub fn with_extent(mut self, extent: u32) -> Self {
        self.extent = extent.max(1);
        self
    }

    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    pub fn push(&mut self, feature: Feature) {
        self.features.push(feature);
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Encode the layer for `coord` and gzip it.
    pub fn encode(&self, coord: &TileCoord) -> Result<Bytes> {
        let raw = self.encode_uncompressed(coord);

        let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
        encoder.write_all(&raw)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    /// Encode the layer for `coord` as a bare protobuf message.
    ///
    /// Features whose geometry collapses at this tile's resolution, or whose
    /// type has no vector tile equivalent, are left out.
    pub fn encode_uncompressed(&self, coord: &TileCoord) -> Vec<u8> {
        let mut tags = TagsBuilder::<String>::new();
        let mut features = Vec::with_capacity(self.features.len());

        for feature in &self.features {
            let Some((geom_type, geometry)) = encode_geometry(&feature.geometry, coord, self.extent)
            else {
                log::debug!("Skipping feature {:?} with no encodable geometry", feature.id);
                continue;
            };

            let mut feature_tags = Vec::with_capacity(feature.properties.len() * 2);
            for (key, value) in &feature.properties {
                if value.is_null() {
                    continue;
                }
                let (key_idx, value_idx) = tags.insert(key.clone(), tile_value_from_json(value));
                feature_tags.push(key_idx);
                feature_tags.push(value_idx);
            }

            features.push(tile::Feature {
                id: feature.id.and_then(|id| u64::try_from(id).ok()),
                tags: feature_tags,
                r#type: Some(geom_type as i32),
                geometry,
            });
        }

        let (keys, values) = tags.into_tags();
        let layer = tile::Layer {
            version: 2,
            name: self.layer.clone(),
            features,
            keys,
            values: values.into_iter().map(Into::into).collect(),
            extent: Some(self.extent),
        };

        Tile {
            layers: vec![layer],
        }
        .encode_to_vec()
    }
}

fn tile_value_from_json(value: &Value) -> TileValue {
    match value {
        Value::String(s) => TileValue::Str(s.clone()),
        Value::Bool(b) => TileValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                TileValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                TileValue::Uint(u)
            } else {
                TileValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        other => TileValue::Str(other.to_string()),
    }
}

/// Command stream for a geometry; `None` when nothing survives projection.
fn encode_geometry(
    geometry: &Geometry<f64>,
    coord: &TileCoord,
    extent: u32,
) -> Option<(tile::GeomType, Vec<u32>)> {
    let mut writer = CommandWriter::new(coord, extent);

    let geom_type = match geometry {
        Geometry::Point(p) => {
            writer.points(&[p.0]);
            tile::GeomType::Point
        }
        Geometry::MultiPoint(mp) => {
            let coords: Vec<Coord<f64>> = mp.iter().map(|p| p.0).collect();
            writer.points(&coords);
            tile::GeomType::Point
        }
        Geometry::Line(line) => {
            writer.line(&LineString::new(vec![line.start, line.end]));
            tile::GeomType::Linestring
        }
        Geometry::LineString(ls) => {
            writer.line(ls);
            tile::GeomType::Linestring
        }
        Geometry::MultiLineString(mls) => {
            mls.iter().for_each(|ls| writer.line(ls));
            tile::GeomType::Linestring
        }
        Geometry::Polygon(polygon) => {
            writer.polygon(polygon);
            tile::GeomType::Polygon
        }
        Geometry::MultiPolygon(mp) => {
            mp.iter().for_each(|polygon| writer.polygon(polygon));
            tile::GeomType::Polygon
        }
        Geometry::Rect(rect) => {
            writer.polygon(&rect.to_polygon());
            tile::GeomType::Polygon
        }
        Geometry::Triangle(triangle) => {
            writer.polygon(&triangle.to_polygon());
            tile::GeomType::Polygon
        }
        Geometry::GeometryCollection(_) => return None,
    };

    let commands = writer.finish();
    (!commands.is_empty()).then_some((geom_type, commands))
}

struct CommandWriter<'a> {
    coord: &'a TileCoord,
    extent: u32,
    cursor: (i32, i32),
    commands: Vec<u32>,
}

impl<'a> CommandWriter<'a> {
    fn new(coord: &'a TileCoord, extent: u32) -> Self {
        Self {
            coord,
            extent,
            cursor: (0, 0),
            commands: Vec::new(),
        }
    }

    fn project(&self, c: Coord<f64>) -> (i32, i32) {
        let (px, py) = self.coord.to_tile_pixel(c, self.extent);
        (px.round() as i32, py.round() as i32)
    }

    /// Projected coordinates with consecutive duplicates removed.
    fn project_all<'c>(&self, coords: impl Iterator<Item = &'c Coord<f64>>) -> Vec<(i32, i32)> {
        let mut projected: Vec<(i32, i32)> = Vec::new();
        for c in coords {
            let p = self.project(*c);
            if projected.last() != Some(&p) {
                projected.push(p);
            }
        }
        projected
    }

    fn push_point(&mut self, (x, y): (i32, i32)) {
        self.commands.push(zigzag_encode(x - self.cursor.0));
        self.commands.push(zigzag_encode(y - self.cursor.1));
        self.cursor = (x, y);
    }

    fn points(&mut self, coords: &[Coord<f64>]) {
        if coords.is_empty() {
            return;
        }
        self.commands
            .push(command_encode(CMD_MOVE_TO, coords.len() as u32));
        for c in coords {
            let p = self.project(*c);
            self.push_point(p);
        }
    }

    fn line(&mut self, line: &LineString<f64>) {
        let projected = self.project_all(line.coords());
        if projected.len() < 2 {
            return;
        }

        self.commands.push(command_encode(CMD_MOVE_TO, 1));
        self.push_point(projected[0]);
        self.commands
            .push(command_encode(CMD_LINE_TO, (projected.len() - 1) as u32));
        for &p in &projected[1..] {
            self.push_point(p);
        }
    }

    fn polygon(&mut self, polygon: &Polygon<f64>) {
        let Some(exterior) = self.ring(polygon.exterior(), true) else {
            return;
        };
        self.write_ring(&exterior);

        for interior in polygon.interiors() {
            if let Some(ring) = self.ring(interior, false) {
                self.write_ring(&ring);
            }
        }
    }

    /// Open ring in tile coordinates, wound positive for exteriors and
    /// negative for holes.
    fn ring(&self, ring: &LineString<f64>, exterior: bool) -> Option<Vec<(i32, i32)>> {
        let mut projected = self.project_all(ring.coords());
        if projected.len() > 1 && projected.first() == projected.last() {
            projected.pop();
        }
        if projected.len() < 3 {
            return None;
        }

        let area = signed_area(&projected);
        if area == 0 {
            return None;
        }
        if (area > 0) != exterior {
            projected.reverse();
        }
        Some(projected)
    }

    fn write_ring(&mut self, ring: &[(i32, i32)]) {
        self.commands.push(command_encode(CMD_MOVE_TO, 1));
        self.push_point(ring[0]);
        self.commands
            .push(command_encode(CMD_LINE_TO, (ring.len() - 1) as u32));
        for &p in &ring[1..] {
            self.push_point(p);
        }
        self.commands.push(command_encode(CMD_CLOSE_PATH, 1));
    }

    fn finish(self) -> Vec<u32> {
        self.commands
    }
}

/// Twice the signed area of an open ring.
fn signed_area(ring: &[(i32, i32)]) -> i64 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let (x1, y1) = ring[i];
            let (x2, y2) = ring[(i + 1) % n];
            i64::from(x1) * i64::from(y2) - i64::from(x2) * i64::from(y1)
        })
        .sum()
}
