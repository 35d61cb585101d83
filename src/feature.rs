//! Decoded tile features.

use crate::error::{Result, TilepipError};
use bytes::Bytes;
use geo::Geometry;
use serde_json::{Map, Value};

pub const WOF_ID: &str = "wof:id";
pub const ALT_LABEL: &str = "src:alt_label";

/// A feature decoded from a vector tile, in longitude/latitude.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Feature id as carried by the tile encoding.
    pub id: Option<i64>,
    pub geometry: Geometry<f64>,
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(id: Option<i64>, geometry: Geometry<f64>, properties: Map<String, Value>) -> Self {
        Self {
            id,
            geometry,
            properties,
        }
    }

    /// Identifier of the place this feature describes: `wof:id` when
    /// present, otherwise the tile-level feature id.
    pub fn wof_id(&self) -> Option<i64> {
        self.properties
            .get(WOF_ID)
            .and_then(value_as_i64)
            .or(self.id)
    }

    /// Alternate geometry label (`src:alt_label`), if any.
    pub fn alt_label(&self) -> Option<&str> {
        self.properties
            .get(ALT_LABEL)
            .and_then(Value::as_str)
            .filter(|label| !label.is_empty())
    }

    /// Key the feature body is stored under in the feature cache:
    /// `{id}` or `{id}-alt-{label}`.
    pub fn cache_key(&self) -> Option<String> {
        let id = self.wof_id()?;
        Some(feature_cache_key(id, self.alt_label()))
    }

    /// The feature as a GeoJSON feature.
    pub fn to_geojson(&self) -> geojson::Feature {
        geojson::Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::from(&self.geometry))),
            id: self
                .wof_id()
                .map(|id| geojson::feature::Id::Number(serde_json::Number::from(id))),
            properties: Some(self.properties.clone()),
            foreign_members: None,
        }
    }

    /// Serialized GeoJSON body.
    pub fn to_body(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(&self.to_geojson())?;
        Ok(Bytes::from(body))
    }

    /// Parse a GeoJSON feature body.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let feature: geojson::Feature = serde_json::from_slice(body)?;
        Self::try_from(feature)
    }
}

impl TryFrom<geojson::Feature> for Feature {
    type Error = TilepipError;

    fn try_from(feature: geojson::Feature) -> Result<Self> {
        let geometry = feature
            .geometry
            .ok_or_else(|| TilepipError::InvalidInput("GeoJSON feature has no geometry".into()))?;

        let geometry = Geometry::<f64>::try_from(geometry)
            .map_err(|e| TilepipError::InvalidInput(format!("Failed to parse geometry: {}", e)))?;

        let id = match feature.id {
            Some(geojson::feature::Id::Number(n)) => n.as_i64(),
            Some(geojson::feature::Id::String(s)) => s.parse().ok(),
            None => None,
        };

        Ok(Self::new(id, geometry, feature.properties.unwrap_or_default()))
    }
}

/// Feature cache key for a place id and optional alternate geometry label.
pub fn feature_cache_key(id: i64, alt_label: Option<&str>) -> String {
    match alt_label {
        Some(label) if !label.is_empty() => format!("{}-alt-{}", id, label),
        _ => id.to_string(),
    }
}

/// Integer value of a JSON number or numeric string.
pub(crate) fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
