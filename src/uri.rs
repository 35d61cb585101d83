//! Who's On First record paths.
//!
//! Records live at `{chunked id}/{id}.geojson`, where the id is split into
//! three digit directories (`1108830809` → `110/883/080/9`). Alternate
//! geometries append `-alt-{label}` to the file name.

use crate::error::{Result, TilepipError};
use crate::feature::feature_cache_key;

const EXTENSION: &str = ".geojson";
const ALT_SEPARATOR: &str = "-alt-";

/// A parsed record path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WofUri {
    pub id: i64,
    pub alt_label: Option<String>,
}

impl WofUri {
    /// Parse a bare id, a file name or a full relative path.
    ///
    /// ```rust
    /// use tilepip::uri::WofUri;
    ///
    /// let uri = WofUri::parse("110/883/080/9/1108830809-alt-quattroshapes.geojson").unwrap();
    /// assert_eq!(uri.id, 1108830809);
    /// assert_eq!(uri.alt_label.as_deref(), Some("quattroshapes"));
    /// assert_eq!(uri.cache_key(), "1108830809-alt-quattroshapes");
    /// ```
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = || TilepipError::InvalidInput(format!("Invalid record path '{}'", path));

        let name = path
            .trim()
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(invalid)?;
        let stem = name.strip_suffix(EXTENSION).unwrap_or(name);

        let (id, alt_label) = match stem.split_once(ALT_SEPARATOR) {
            Some((id, label)) if !label.is_empty() => (id, Some(label.to_string())),
            Some(_) => return Err(invalid()),
            None => (stem, None),
        };

        let id: i64 = id.parse().map_err(|_| invalid())?;
        if id < 0 {
            return Err(invalid());
        }

        Ok(Self { id, alt_label })
    }

    /// Key the record is stored under in the feature cache.
    pub fn cache_key(&self) -> String {
        feature_cache_key(self.id, self.alt_label.as_deref())
    }

    /// Record file name, e.g. `1108830809.geojson`.
    pub fn filename(&self) -> String {
        format!("{}{}", self.cache_key(), EXTENSION)
    }

    /// Relative path of the record.
    pub fn rel_path(&self) -> String {
        id_to_rel_path(self.id, self.alt_label.as_deref())
    }
}

/// Relative path of a record: `{chunked id}/{file name}`.
pub fn id_to_rel_path(id: i64, alt_label: Option<&str>) -> String {
    let digits = id.unsigned_abs().to_string();
    let chunks: Vec<&str> = digits
        .as_bytes()
        .chunks(3)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect();

    format!(
        "{}/{}{}",
        chunks.join("/"),
        feature_cache_key(id, alt_label),
        EXTENSION
    )
}
