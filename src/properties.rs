//! Who's On First properties that vector tiles can only carry as strings.
//!
//! Vector tile attributes are limited to scalars, so reference lists and
//! hierarchies are flattened into JSON strings when tiles are produced.
//! [`unfurl`] parses them back into structured values after decoding and
//! [`flatten`] is its inverse.

use crate::error::{Result, TilepipError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const SUPERSEDED_BY: &str = "wof:superseded_by";
pub const SUPERSEDES: &str = "wof:supersedes";
pub const BELONGS_TO: &str = "wof:belongsto";
pub const HIERARCHY: &str = "wof:hierarchy";

/// Properties holding a list of feature ids.
pub const ID_LIST_PROPERTIES: [&str; 3] = [SUPERSEDED_BY, SUPERSEDES, BELONGS_TO];

/// Structured shape of an unfurled property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyShape {
    /// `[i64]`
    IdList,
    /// `[{String: i64}]`
    Hierarchy,
}

/// Shape of a well-known flattened property, if `key` is one.
pub fn shape_of(key: &str) -> Option<PropertyShape> {
    match key {
        SUPERSEDED_BY | SUPERSEDES | BELONGS_TO => Some(PropertyShape::IdList),
        HIERARCHY => Some(PropertyShape::Hierarchy),
        _ => None,
    }
}

/// Replace flattened well-known properties with their structured values.
///
/// String values are parsed as JSON; values that are already structured are
/// checked against the expected shape. Other properties pass through
/// unchanged. `feature` only labels errors.
///
/// ```rust
/// use serde_json::{Map, Value, json};
/// use tilepip::properties::unfurl;
///
/// let mut props = Map::new();
/// props.insert("wof:belongsto".into(), Value::from("[85633793,102087579]"));
/// props.insert("wof:name".into(), Value::from("Mission"));
///
/// unfurl(&mut props, "1108830809").unwrap();
/// assert_eq!(props["wof:belongsto"], json!([85633793, 102087579]));
/// assert_eq!(props["wof:name"], json!("Mission"));
/// ```
pub fn unfurl(properties: &mut Map<String, Value>, feature: &str) -> Result<()> {
    for (key, value) in properties.iter_mut() {
        let Some(shape) = shape_of(key) else {
            continue;
        };

        if value.is_null() {
            continue;
        }

        *value = parse_shape(key, value, shape, feature)?;
    }

    Ok(())
}

/// Replace structured well-known properties with their JSON string form.
pub fn flatten(properties: &mut Map<String, Value>) -> Result<()> {
    for (key, value) in properties.iter_mut() {
        if shape_of(key).is_none() || value.is_string() || value.is_null() {
            continue;
        }

        *value = Value::String(serde_json::to_string(value)?);
    }

    Ok(())
}

fn parse_shape(key: &str, value: &Value, shape: PropertyShape, feature: &str) -> Result<Value> {
    let unfurl_error = |source| TilepipError::PropertyUnfurl {
        key: key.to_string(),
        value: value.to_string(),
        feature: feature.to_string(),
        source,
    };

    let parsed = match (shape, value) {
        (PropertyShape::IdList, Value::String(raw)) => {
            serde_json::to_value(serde_json::from_str::<Vec<i64>>(raw).map_err(unfurl_error)?)
        }
        (PropertyShape::IdList, other) => serde_json::to_value(
            serde_json::from_value::<Vec<i64>>(other.clone()).map_err(unfurl_error)?,
        ),
        (PropertyShape::Hierarchy, Value::String(raw)) => serde_json::to_value(
            serde_json::from_str::<Vec<BTreeMap<String, i64>>>(raw).map_err(unfurl_error)?,
        ),
        (PropertyShape::Hierarchy, other) => serde_json::to_value(
            serde_json::from_value::<Vec<BTreeMap<String, i64>>>(other.clone())
                .map_err(unfurl_error)?,
        ),
    };

    Ok(parsed?)
}
