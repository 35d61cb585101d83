//! Vector tile decoding.
//!
//! A tile payload is decompressed, parsed as a Mapbox vector tile, reduced
//! to a single named layer and reprojected from tile-local integer
//! coordinates to longitude/latitude. Well-known flattened properties are
//! unfurled back into structured values.

use crate::error::{Result, TilepipError};
use crate::feature::Feature;
use crate::properties::unfurl;
use crate::tile::TileId;
use flate2::read::GzDecoder;
use geo::{
    Coord, Geometry, LineString, MapCoords, MultiLineString, MultiPoint, MultiPolygon, Point,
    Polygon,
};
use geozero::mvt::{Message, Tile, tile};
use serde_json::{Map, Number, Value};
use std::borrow::Cow;
use std::io::Read;

/// Tile-local coordinate space used when a layer does not declare one.
pub const DEFAULT_EXTENT: u32 = 4096;

pub(crate) const CMD_MOVE_TO: u32 = 1;
pub(crate) const CMD_LINE_TO: u32 = 2;
pub(crate) const CMD_CLOSE_PATH: u32 = 7;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[inline]
pub(crate) fn zigzag_encode(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

#[inline]
pub(crate) fn zigzag_decode(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

#[inline]
pub(crate) fn command_encode(command_id: u32, count: u32) -> u32 {
    (command_id & 0x7) | (count << 3)
}

#[inline]
pub(crate) fn command_decode(command: u32) -> (u32, u32) {
    (command & 0x7, command >> 3)
}

/// Decodes tile payloads into features of one layer.
#[derive(Debug, Clone)]
pub struct TileDecoder {
    layer: String,
}

impl TileDecoder {
    pub fn new(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
        }
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Decode `body` (gzip-compressed or raw protobuf) fetched for `tile`.
    pub fn decode(&self, body: &[u8], tile: &TileId) -> Result<Vec<Feature>> {
        let decode_error = |message: String| TilepipError::Decode {
            tile: tile.to_string(),
            message,
        };

        let payload = decompress(body).map_err(|e| decode_error(format!("gunzip: {}", e)))?;
        let mvt = Tile::decode(payload.as_ref())
            .map_err(|e| decode_error(format!("protobuf: {}", e)))?;

        let layer = mvt
            .layers
            .into_iter()
            .find(|layer| layer.name == self.layer)
            .ok_or_else(|| TilepipError::MissingLayer {
                layer: self.layer.clone(),
                tile: tile.to_string(),
            })?;

        let extent = layer.extent.unwrap_or(DEFAULT_EXTENT);
        let mut features = Vec::with_capacity(layer.features.len());

        for (offset, feature) in layer.features.iter().enumerate() {
            let Some(geometry) = decode_geometry(feature)
                .map_err(|e| decode_error(format!("feature at offset {}: {}", offset, e)))?
            else {
                log::warn!(
                    "Skipping feature at offset {} in {} with unsupported geometry type {:?}",
                    offset,
                    tile,
                    feature.r#type
                );
                continue;
            };

            let geometry = geometry.map_coords(|c| tile.coord.to_lon_lat(c.x, c.y, extent));

            let mut properties = decode_tags(&feature.tags, &layer.keys, &layer.values)
                .map_err(|e| decode_error(format!("feature at offset {}: {}", offset, e)))?;

            let id = feature.id.and_then(|id| i64::try_from(id).ok());
            let label = properties
                .get(crate::feature::WOF_ID)
                .map(|v| v.to_string())
                .or_else(|| id.map(|id| id.to_string()))
                .unwrap_or_else(|| format!("#{}", offset));

            unfurl(&mut properties, &label)?;

            features.push(Feature::new(id, geometry, properties));
        }

        Ok(features)
    }
}

fn decompress(body: &[u8]) -> std::io::Result<Cow<'_, [u8]>> {
    if !body.starts_with(&GZIP_MAGIC) {
        return Ok(Cow::Borrowed(body));
    }

    let mut decoder = GzDecoder::new(body);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(Cow::Owned(decompressed))
}

/// Geometry in tile-local coordinates; `None` for unknown geometry types.
fn decode_geometry(feature: &tile::Feature) -> std::result::Result<Option<Geometry<f64>>, String> {
    let geom_type = feature
        .r#type
        .and_then(|t| tile::GeomType::from_i32(t))
        .unwrap_or(tile::GeomType::Unknown);

    if geom_type == tile::GeomType::Unknown {
        return Ok(None);
    }
    let parts = decode_commands(&feature.geometry)?;

    let geometry = match geom_type {
        tile::GeomType::Point => {
            let mut points: Vec<Point<f64>> =
                parts.into_iter().flatten().map(Point::from).collect();
            match points.len() {
                0 => return Err("point feature without coordinates".to_string()),
                1 => Geometry::Point(points.remove(0)),
                _ => Geometry::MultiPoint(MultiPoint::new(points)),
            }
        }
        tile::GeomType::Linestring => {
            let mut lines: Vec<LineString<f64>> = parts
                .into_iter()
                .filter(|part| part.len() >= 2)
                .map(LineString::new)
                .collect();
            match lines.len() {
                0 => return Err("linestring feature without coordinates".to_string()),
                1 => Geometry::LineString(lines.remove(0)),
                _ => Geometry::MultiLineString(MultiLineString::new(lines)),
            }
        }
        tile::GeomType::Polygon => {
            let mut polygons = assemble_polygons(parts);
            match polygons.len() {
                0 => return Err("polygon feature without rings".to_string()),
                1 => Geometry::Polygon(polygons.remove(0)),
                _ => Geometry::MultiPolygon(MultiPolygon::new(polygons)),
            }
        }
        tile::GeomType::Unknown => return Ok(None),
    };

    Ok(Some(geometry))
}

/// Run the geometry command stream, returning one coordinate list per
/// MoveTo. Closed paths repeat their first coordinate.
fn decode_commands(geometry: &[u32]) -> std::result::Result<Vec<Vec<Coord<f64>>>, String> {
    let mut parts: Vec<Vec<Coord<f64>>> = Vec::new();
    let (mut x, mut y) = (0i64, 0i64);
    let mut i = 0;

    while i < geometry.len() {
        let (command, count) = command_decode(geometry[i]);
        i += 1;

        match command {
            CMD_MOVE_TO | CMD_LINE_TO => {
                let needed = count as usize * 2;
                if i + needed > geometry.len() {
                    return Err(format!(
                        "truncated command: {} parameters missing",
                        i + needed - geometry.len()
                    ));
                }

                for _ in 0..count {
                    x += i64::from(zigzag_decode(geometry[i]));
                    y += i64::from(zigzag_decode(geometry[i + 1]));
                    i += 2;

                    let coord = Coord {
                        x: x as f64,
                        y: y as f64,
                    };

                    if command == CMD_MOVE_TO {
                        parts.push(vec![coord]);
                    } else {
                        parts
                            .last_mut()
                            .ok_or_else(|| "LineTo before MoveTo".to_string())?
                            .push(coord);
                    }
                }
            }
            CMD_CLOSE_PATH => {
                let part = parts
                    .last_mut()
                    .ok_or_else(|| "ClosePath before MoveTo".to_string())?;
                if let Some(&first) = part.first() {
                    part.push(first);
                }
            }
            other => return Err(format!("unknown command {}", other)),
        }
    }

    Ok(parts)
}

/// Twice the signed area of a ring in tile coordinates (y down). Exterior
/// rings are positive.
fn ring_area(ring: &[Coord<f64>]) -> f64 {
    ring.windows(2)
        .map(|w| w[0].x * w[1].y - w[1].x * w[0].y)
        .sum()
}

fn assemble_polygons(rings: Vec<Vec<Coord<f64>>>) -> Vec<Polygon<f64>> {
    let mut polygons = Vec::new();
    let mut exterior: Option<LineString<f64>> = None;
    let mut interiors = Vec::new();

    for ring in rings {
        if ring.len() < 4 {
            continue;
        }

        let area = ring_area(&ring);
        if area == 0.0 {
            continue;
        }

        if area > 0.0 || exterior.is_none() {
            if let Some(previous) = exterior.take() {
                polygons.push(Polygon::new(previous, std::mem::take(&mut interiors)));
            }
            exterior = Some(LineString::new(ring));
        } else {
            interiors.push(LineString::new(ring));
        }
    }

    if let Some(previous) = exterior {
        polygons.push(Polygon::new(previous, interiors));
    }

    polygons
}

fn decode_tags(
    tags: &[u32],
    keys: &[String],
    values: &[tile::Value],
) -> std::result::Result<Map<String, Value>, String> {
    if tags.len() % 2 != 0 {
        return Err(format!("odd number of tag indices ({})", tags.len()));
    }

    let mut properties = Map::new();

    for pair in tags.chunks_exact(2) {
        let key = keys
            .get(pair[0] as usize)
            .ok_or_else(|| format!("key index {} out of range", pair[0]))?;
        let value = values
            .get(pair[1] as usize)
            .ok_or_else(|| format!("value index {} out of range", pair[1]))?;

        properties.insert(key.clone(), tile_value_to_json(value));
    }

    Ok(properties)
}

fn tile_value_to_json(value: &tile::Value) -> Value {
    if let Some(s) = &value.string_value {
        Value::String(s.clone())
    } else if let Some(f) = value.float_value {
        Number::from_f64(f64::from(f)).map_or(Value::Null, Value::Number)
    } else if let Some(d) = value.double_value {
        Number::from_f64(d).map_or(Value::Null, Value::Number)
    } else if let Some(i) = value.int_value {
        Value::from(i)
    } else if let Some(u) = value.uint_value {
        Value::from(u)
    } else if let Some(s) = value.sint_value {
        Value::from(s)
    } else if let Some(b) = value.bool_value {
        Value::Bool(b)
    } else {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::TileEncoder;
    use crate::feature::WOF_ID;
    use geo::{Area, Contains, Intersects};
    use serde_json::json;
    use tilepip_types::tile::TileCoord;

    fn tile_id() -> TileId {
        TileId::new("sf", TileCoord::new(12, 655, 1583))
    }

    fn square_in(tile: &TileId, from: f64, to: f64) -> Polygon<f64> {
        let a = tile.coord.to_lon_lat(from, from, DEFAULT_EXTENT);
        let b = tile.coord.to_lon_lat(to, to, DEFAULT_EXTENT);
        Polygon::new(
            LineString::from(vec![
                (a.x, a.y),
                (b.x, a.y),
                (b.x, b.y),
                (a.x, b.y),
                (a.x, a.y),
            ]),
            vec![],
        )
    }

    #[test]
    fn test_zigzag() {
        for n in [0, -1, 1, -2, 2, 4095, -4096, i32::MAX, i32::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(n)), n);
        }
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
    }

    #[test]
    fn test_commands() {
        assert_eq!(command_decode(command_encode(CMD_LINE_TO, 3)), (CMD_LINE_TO, 3));
        assert_eq!(command_encode(CMD_MOVE_TO, 1), 9);
        assert_eq!(command_encode(CMD_CLOSE_PATH, 1), 15);
    }

    #[test]
    fn test_decode_polygon_with_hole() {
        // Exterior clockwise in tile space, hole counter-clockwise.
        let geometry = vec![
            9, 0, 0, 26, 20, 0, 0, 20, 19, 0, 15, // (0,0) (10,0) (10,10) (0,10)
            9, 4, 13, 26, 0, 4, 4, 0, 0, 3, 15, // (2,3) (2,5) (4,5) (4,3)
        ];
        let feature = tile::Feature {
            id: Some(1),
            tags: vec![],
            r#type: Some(tile::GeomType::Polygon as i32),
            geometry,
        };

        let Some(Geometry::Polygon(polygon)) = decode_geometry(&feature).unwrap() else {
            panic!("expected a polygon");
        };
        assert_eq!(polygon.interiors().len(), 1);
        assert_eq!(polygon.unsigned_area(), 100.0 - 4.0);
    }

    #[test]
    fn test_decode_multipolygon() {
        let geometry = vec![
            9, 0, 0, 26, 2, 0, 0, 2, 1, 0, 15, // (0,0) (1,0) (1,1) (0,1)
            9, 8, 1, 26, 2, 0, 0, 2, 1, 0, 15, // (4,0) (5,0) (5,1) (4,1)
        ];
        let feature = tile::Feature {
            id: None,
            tags: vec![],
            r#type: Some(tile::GeomType::Polygon as i32),
            geometry,
        };

        let geometry = decode_geometry(&feature).unwrap();
        assert!(matches!(geometry, Some(Geometry::MultiPolygon(ref mp)) if mp.0.len() == 2));
    }

    #[test]
    fn test_truncated_geometry_is_an_error() {
        let feature = tile::Feature {
            id: None,
            tags: vec![],
            r#type: Some(tile::GeomType::Point as i32),
            geometry: vec![9, 4],
        };
        assert!(decode_geometry(&feature).is_err());
    }

    #[test]
    fn test_unknown_type_with_bad_commands_is_skipped() {
        let tile = tile_id();
        let raw = TileEncoder::new("whosonfirst")
            .with_feature(Feature::new(
                Some(1),
                Geometry::Polygon(square_in(&tile, 10.0, 20.0)),
                Map::new(),
            ))
            .encode_uncompressed(&tile.coord);

        let mut mvt = Tile::decode(raw.as_slice()).unwrap();
        mvt.layers[0].features.push(tile::Feature {
            id: Some(2),
            tags: vec![],
            r#type: Some(tile::GeomType::Unknown as i32),
            geometry: vec![9, 4],
        });
        let body = mvt.encode_to_vec();

        let features = TileDecoder::new("whosonfirst").decode(&body, &tile).unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id, Some(1));
    }

    #[test]
    fn test_decode_layer_and_reproject() {
        let tile = tile_id();
        let square = square_in(&tile, 1000.0, 2000.0);

        let mut properties = Map::new();
        properties.insert(WOF_ID.into(), json!(1108830809));
        properties.insert("wof:name".into(), json!("Mission"));
        properties.insert("wof:hierarchy".into(), json!([{"locality_id": 85922583}]));

        let body = TileEncoder::new("whosonfirst")
            .with_feature(Feature::new(
                Some(1108830809),
                Geometry::Polygon(square.clone()),
                properties,
            ))
            .encode(&tile.coord)
            .unwrap();

        let features = TileDecoder::new("whosonfirst").decode(&body, &tile).unwrap();
        assert_eq!(features.len(), 1);

        let feature = &features[0];
        assert_eq!(feature.id, Some(1108830809));
        assert_eq!(feature.properties["wof:name"], json!("Mission"));
        assert_eq!(
            feature.properties["wof:hierarchy"],
            json!([{"locality_id": 85922583}])
        );

        let center = tile.coord.to_lon_lat(1500.0, 1500.0, DEFAULT_EXTENT);
        assert!(feature.geometry.intersects(&Point::from(center)));
        let Geometry::Polygon(decoded) = &feature.geometry else {
            panic!("expected a polygon");
        };
        assert!(decoded.contains(&Point::from(center)));
    }

    #[test]
    fn test_missing_layer() {
        let tile = tile_id();
        let body = TileEncoder::new("other").encode(&tile.coord).unwrap();

        let err = TileDecoder::new("whosonfirst")
            .decode(&body, &tile)
            .unwrap_err();
        assert!(matches!(err, TilepipError::MissingLayer { .. }));
    }

    #[test]
    fn test_raw_protobuf_is_accepted() {
        let tile = tile_id();
        let raw = TileEncoder::new("whosonfirst")
            .with_feature(Feature::new(
                Some(1),
                Geometry::Polygon(square_in(&tile, 10.0, 20.0)),
                Map::new(),
            ))
            .encode_uncompressed(&tile.coord);

        let features = TileDecoder::new("whosonfirst").decode(&raw, &tile).unwrap();
        assert_eq!(features.len(), 1);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let tile = tile_id();
        let err = TileDecoder::new("whosonfirst")
            .decode(&[0x1f, 0x8b, 0x00, 0x01], &tile)
            .unwrap_err();
        assert!(matches!(err, TilepipError::Decode { .. }));
    }

    #[test]
    fn test_malformed_property_fails_decoding() {
        let tile = tile_id();
        let mut properties = Map::new();
        properties.insert("wof:supersedes".into(), json!("[1,"));

        let body = TileEncoder::new("whosonfirst")
            .with_feature(Feature::new(
                Some(5),
                Geometry::Polygon(square_in(&tile, 10.0, 20.0)),
                properties,
            ))
            .encode(&tile.coord)
            .unwrap();

        let err = TileDecoder::new("whosonfirst")
            .decode(&body, &tile)
            .unwrap_err();
        assert!(matches!(err, TilepipError::PropertyUnfurl { ref feature, .. } if feature == "5"));
    }
}
