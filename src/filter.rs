//! Standard place results and the filters applied to them.

use crate::error::{Result, TilepipError};
use crate::feature::{Feature, value_as_i64};
use crate::properties::{BELONGS_TO, SUPERSEDED_BY, SUPERSEDES};
use crate::uri::id_to_rel_path;
use geo::{BoundingRect, Centroid};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Existential flag value for "unknown".
pub const FLAG_UNKNOWN: i64 = -1;

/// The standard result record for a matched place (an "SPR").
///
/// Existential flags are `1` (true), `0` (false) or `-1` (unknown).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceResult {
    #[serde(rename = "wof:id")]
    pub id: i64,
    #[serde(rename = "wof:parent_id")]
    pub parent_id: i64,
    #[serde(rename = "wof:name")]
    pub name: String,
    #[serde(rename = "wof:placetype")]
    pub placetype: String,
    #[serde(rename = "wof:country")]
    pub country: String,
    #[serde(rename = "wof:repo")]
    pub repo: String,
    #[serde(rename = "wof:path")]
    pub path: String,
    #[serde(rename = "wof:superseded_by")]
    pub superseded_by: Vec<i64>,
    #[serde(rename = "wof:supersedes")]
    pub supersedes: Vec<i64>,
    #[serde(rename = "wof:belongsto")]
    pub belongs_to: Vec<i64>,
    #[serde(rename = "mz:latitude")]
    pub latitude: f64,
    #[serde(rename = "mz:longitude")]
    pub longitude: f64,
    #[serde(rename = "mz:min_latitude")]
    pub min_latitude: f64,
    #[serde(rename = "mz:min_longitude")]
    pub min_longitude: f64,
    #[serde(rename = "mz:max_latitude")]
    pub max_latitude: f64,
    #[serde(rename = "mz:max_longitude")]
    pub max_longitude: f64,
    #[serde(rename = "mz:is_current")]
    pub is_current: i64,
    #[serde(rename = "mz:is_ceased")]
    pub is_ceased: i64,
    #[serde(rename = "mz:is_deprecated")]
    pub is_deprecated: i64,
    #[serde(rename = "mz:is_superseded")]
    pub is_superseded: i64,
    #[serde(rename = "mz:is_superseding")]
    pub is_superseding: i64,
    #[serde(rename = "wof:lastmodified")]
    pub last_modified: i64,
    /// Label of the alternate geometry this result was derived from.
    #[serde(rename = "src:alt_label", default, skip_serializing_if = "Option::is_none")]
    pub alt_label: Option<String>,
}

impl PlaceResult {
    /// Derive a result from a feature's properties and geometry.
    pub fn from_feature(feature: &Feature) -> Result<Self> {
        let id = feature.wof_id().ok_or_else(|| {
            TilepipError::InvalidInput("feature has no wof:id or tile feature id".to_string())
        })?;

        let props = &feature.properties;
        let int = |key: &str, default: i64| props.get(key).and_then(value_as_i64).unwrap_or(default);
        let string = |key: &str| {
            props
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let ids = |key: &str| -> Vec<i64> {
            props
                .get(key)
                .and_then(Value::as_array)
                .map(|values| values.iter().filter_map(value_as_i64).collect())
                .unwrap_or_default()
        };

        let (min_longitude, min_latitude, max_longitude, max_latitude) =
            match feature.geometry.bounding_rect() {
                Some(rect) => (rect.min().x, rect.min().y, rect.max().x, rect.max().y),
                None => (0.0, 0.0, 0.0, 0.0),
            };

        let (longitude, latitude) = label_centroid(feature)
            .or_else(|| feature.geometry.centroid().map(|p| (p.x(), p.y())))
            .unwrap_or((0.0, 0.0));

        let superseded_by = ids(SUPERSEDED_BY);
        let supersedes = ids(SUPERSEDES);

        Ok(Self {
            id,
            parent_id: int("wof:parent_id", -1),
            name: string("wof:name"),
            placetype: string("wof:placetype"),
            country: string("wof:country"),
            repo: string("wof:repo"),
            path: id_to_rel_path(id, feature.alt_label()),
            is_current: int("mz:is_current", FLAG_UNKNOWN),
            is_ceased: date_flag(props.get("edtf:cessation"), int("mz:is_ceased", FLAG_UNKNOWN)),
            is_deprecated: date_flag(
                props.get("edtf:deprecated"),
                int("mz:is_deprecated", FLAG_UNKNOWN),
            ),
            is_superseded: i64::from(!superseded_by.is_empty()),
            is_superseding: i64::from(!supersedes.is_empty()),
            superseded_by,
            supersedes,
            belongs_to: ids(BELONGS_TO),
            latitude,
            longitude,
            min_latitude,
            min_longitude,
            max_latitude,
            max_longitude,
            last_modified: int("wof:lastmodified", -1),
            alt_label: feature.alt_label().map(str::to_string),
        })
    }

    pub fn is_alternate(&self) -> bool {
        self.alt_label.is_some()
    }
}

/// Centroid from label properties, then from precomputed geometry properties.
fn label_centroid(feature: &Feature) -> Option<(f64, f64)> {
    let number = |key: &str| feature.properties.get(key).and_then(Value::as_f64);

    [("lbl:longitude", "lbl:latitude"), ("geom:longitude", "geom:latitude")]
        .into_iter()
        .find_map(|(lon, lat)| Some((number(lon)?, number(lat)?)))
}

/// Flag for an EDTF date property: set and known means 1, `uuuu` means
/// unknown, absent falls back to `fallback`.
fn date_flag(value: Option<&Value>, fallback: i64) -> i64 {
    match value.and_then(Value::as_str) {
        Some("") | None => fallback,
        Some("uuuu") => FLAG_UNKNOWN,
        Some(_) => 1,
    }
}

/// A predicate over place results. Candidates failing any filter are
/// excluded.
pub trait ResultFilter: Send + Sync {
    fn matches(&self, result: &PlaceResult) -> bool;
}

impl<F> ResultFilter for F
where
    F: Fn(&PlaceResult) -> bool + Send + Sync,
{
    fn matches(&self, result: &PlaceResult) -> bool {
        self(result)
    }
}

/// Whether `result` passes every filter.
pub fn matches_all(result: &PlaceResult, filters: &[&dyn ResultFilter]) -> bool {
    filters.iter().all(|filter| filter.matches(result))
}

/// Filter on placetype and existential flags. Empty lists match anything.
///
/// ```rust
/// use tilepip::filter::PlaceFilter;
///
/// let filter = PlaceFilter::new()
///     .with_placetypes(["neighbourhood", "microhood"])
///     .with_is_current([1, -1]);
/// assert_eq!(filter.placetypes.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceFilter {
    #[serde(default)]
    pub placetypes: Vec<String>,
    #[serde(default)]
    pub is_current: Vec<i64>,
    #[serde(default)]
    pub is_ceased: Vec<i64>,
    #[serde(default)]
    pub is_deprecated: Vec<i64>,
    #[serde(default)]
    pub is_superseded: Vec<i64>,
    #[serde(default)]
    pub is_superseding: Vec<i64>,
    /// `Some(false)` excludes alternate geometries, `Some(true)` keeps only them.
    #[serde(default)]
    pub alternate_geometry: Option<bool>,
}

impl PlaceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_placetypes<I, S>(mut self, placetypes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.placetypes = placetypes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_is_current(mut self, flags: impl IntoIterator<Item = i64>) -> Self {
        self.is_current = flags.into_iter().collect();
        self
    }

    pub fn with_is_ceased(mut self, flags: impl IntoIterator<Item = i64>) -> Self {
        self.is_ceased = flags.into_iter().collect();
        self
    }

    pub fn with_is_deprecated(mut self, flags: impl IntoIterator<Item = i64>) -> Self {
        self.is_deprecated = flags.into_iter().collect();
        self
    }

    pub fn with_is_superseded(mut self, flags: impl IntoIterator<Item = i64>) -> Self {
        self.is_superseded = flags.into_iter().collect();
        self
    }

    pub fn with_is_superseding(mut self, flags: impl IntoIterator<Item = i64>) -> Self {
        self.is_superseding = flags.into_iter().collect();
        self
    }

    pub fn with_alternate_geometry(mut self, alternate: bool) -> Self {
        self.alternate_geometry = Some(alternate);
        self
    }
}

fn flag_matches(allowed: &[i64], flag: i64) -> bool {
    allowed.is_empty() || allowed.contains(&flag)
}

impl ResultFilter for PlaceFilter {
    fn matches(&self, result: &PlaceResult) -> bool {
        if !self.placetypes.is_empty()
            && !self
                .placetypes
                .iter()
                .any(|p| p.eq_ignore_ascii_case(&result.placetype))
        {
            return false;
        }

        if let Some(alternate) = self.alternate_geometry {
            if alternate != result.is_alternate() {
                return false;
            }
        }

        flag_matches(&self.is_current, result.is_current)
            && flag_matches(&self.is_ceased, result.is_ceased)
            && flag_matches(&self.is_deprecated, result.is_deprecated)
            && flag_matches(&self.is_superseded, result.is_superseded)
            && flag_matches(&self.is_superseding, result.is_superseding)
    }
}
