//! Configuration for a tile-backed spatial database.
//!
//! All values are validated when the database is built; parse failures name
//! the offending parameter.

use serde::de::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tilepip_types::tile::MAX_ZOOM;

/// Tile database configuration.
///
/// # Example
///
/// ```rust
/// use tilepip::Config;
///
/// let json = r#"{
///     "database": "whosonfirst",
///     "zoom": 13,
///     "enable_feature_cache": true
/// }"#;
/// let config = Config::from_json(json).unwrap();
/// assert_eq!(config.layer_name(), "whosonfirst");
/// assert_eq!(config.database_ttl_seconds, 30);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Dataset name; the first segment of every tile path.
    pub database: String,

    /// Vector tile layer holding the features (defaults to `database`).
    #[serde(default)]
    pub layer: Option<String>,

    /// Zoom level at which tiles are fetched and indexed (0-24, default: 12).
    #[serde(default = "Config::default_zoom")]
    pub zoom: u8,

    /// Size hint forwarded to tile sources that keep their own cache.
    #[serde(default = "Config::default_cache_size")]
    pub cache_size: usize,

    /// Seconds an idle tile index may linger before it becomes eligible for
    /// eviction. Also the default sweep interval.
    #[serde(default = "Config::default_database_ttl_seconds")]
    pub database_ttl_seconds: u64,

    /// Push decoded feature bodies into the secondary feature cache.
    #[serde(default)]
    pub enable_feature_cache: bool,

    /// Lifetime of feature cache records, in seconds.
    #[serde(default = "Config::default_feature_cache_ttl_seconds")]
    pub feature_cache_ttl_seconds: u64,

    /// Per-request tile fetch timeout, in milliseconds.
    #[serde(default = "Config::default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Skip evicting a tile index that was re-acquired after its eviction
    /// was scheduled.
    #[serde(default = "Config::default_recheck_references_on_sweep")]
    pub recheck_references_on_sweep: bool,

    /// Largest number of tiles an intersects query may cover (0: no limit).
    #[serde(default = "Config::default_max_tile_cover")]
    pub max_tile_cover: usize,
}

impl Config {
    const fn default_zoom() -> u8 {
        12
    }

    const fn default_cache_size() -> usize {
        64
    }

    const fn default_database_ttl_seconds() -> u64 {
        30
    }

    const fn default_feature_cache_ttl_seconds() -> u64 {
        3600
    }

    const fn default_fetch_timeout_ms() -> u64 {
        3000
    }

    const fn default_recheck_references_on_sweep() -> bool {
        true
    }

    const fn default_max_tile_cover() -> usize {
        4096
    }

    /// Create a configuration for `database` with every other value defaulted.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            layer: None,
            zoom: Self::default_zoom(),
            cache_size: Self::default_cache_size(),
            database_ttl_seconds: Self::default_database_ttl_seconds(),
            enable_feature_cache: false,
            feature_cache_ttl_seconds: Self::default_feature_cache_ttl_seconds(),
            fetch_timeout_ms: Self::default_fetch_timeout_ms(),
            recheck_references_on_sweep: Self::default_recheck_references_on_sweep(),
            max_tile_cover: Self::default_max_tile_cover(),
        }
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    pub fn with_zoom(mut self, zoom: u8) -> Self {
        self.zoom = zoom;
        self
    }

    pub fn with_database_ttl(mut self, ttl: Duration) -> Self {
        self.database_ttl_seconds = ttl.as_secs();
        self
    }

    pub fn with_feature_cache(mut self, enabled: bool) -> Self {
        self.enable_feature_cache = enabled;
        self
    }

    pub fn with_feature_cache_ttl(mut self, ttl: Duration) -> Self {
        self.feature_cache_ttl_seconds = ttl.as_secs();
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_recheck_references_on_sweep(mut self, recheck: bool) -> Self {
        self.recheck_references_on_sweep = recheck;
        self
    }

    /// Limit the tiles an intersects query may cover; 0 removes the limit.
    pub fn with_max_tile_cover(mut self, max_tiles: usize) -> Self {
        self.max_tile_cover = max_tiles;
        self
    }

    /// Name of the layer features are read from.
    pub fn layer_name(&self) -> &str {
        match &self.layer {
            Some(layer) if !layer.is_empty() => layer,
            _ => &self.database,
        }
    }

    /// Tile index time-to-live as a Duration
    pub fn database_ttl(&self) -> Duration {
        Duration::from_secs(self.database_ttl_seconds)
    }

    /// Feature cache time-to-live as a Duration
    pub fn feature_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.feature_cache_ttl_seconds)
    }

    /// Tile fetch timeout as a Duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.database.is_empty() {
            return Err("Database name must not be empty".to_string());
        }

        if self.database.contains('/') {
            return Err(format!(
                "Database name '{}' must not contain '/'",
                self.database
            ));
        }

        if self.zoom > MAX_ZOOM {
            return Err(format!(
                "Zoom must be between 0 and {}, got {}",
                MAX_ZOOM, self.zoom
            ));
        }

        if self.cache_size == 0 {
            return Err("Cache size must be greater than zero".to_string());
        }

        if self.database_ttl_seconds == 0 {
            return Err("Database TTL must be greater than zero".to_string());
        }

        if self.feature_cache_ttl_seconds == 0 {
            return Err("Feature cache TTL must be greater than zero".to_string());
        }

        if self.fetch_timeout_ms == 0 {
            return Err("Fetch timeout must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Build a configuration from string parameters, as found in a
    /// database URI query string.
    ///
    /// Recognised keys: `database`, `layer`, `zoom`, `pmtiles-cache-size`,
    /// `database-ttl`, `enable-cache`, `feature-cache-ttl`, `fetch-timeout`,
    /// `max-tile-cover`.
    /// Unknown keys are ignored.
    ///
    /// ```rust
    /// use tilepip::Config;
    ///
    /// let config = Config::from_pairs([
    ///     ("database", "sf"),
    ///     ("layer", "whosonfirst"),
    ///     ("zoom", "13"),
    ///     ("enable-cache", "true"),
    /// ])
    /// .unwrap();
    /// assert_eq!(config.zoom, 13);
    /// assert!(Config::from_pairs([("database", "sf"), ("zoom", "twelve")]).is_err());
    /// ```
    pub fn from_pairs<I, K, V>(pairs: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Config::new("");

        for (key, value) in pairs {
            let value = value.as_ref();

            match key.as_ref() {
                "database" => config.database = value.to_string(),
                "layer" => config.layer = Some(value.to_string()),
                "zoom" => config.zoom = parse_param("zoom", value)?,
                "pmtiles-cache-size" => {
                    config.cache_size = parse_param("pmtiles-cache-size", value)?
                }
                "database-ttl" => config.database_ttl_seconds = parse_param("database-ttl", value)?,
                "enable-cache" => config.enable_feature_cache = parse_param("enable-cache", value)?,
                "feature-cache-ttl" => {
                    config.feature_cache_ttl_seconds = parse_param("feature-cache-ttl", value)?
                }
                "fetch-timeout" => config.fetch_timeout_ms = parse_param("fetch-timeout", value)?,
                "max-tile-cover" => config.max_tile_cover = parse_param("max-tile-cover", value)?,
                _ => {}
            }
        }

        config.validate().map_err(crate::TilepipError::InvalidConfig)?;
        Ok(config)
    }

    /// Load configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Config = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(serde_json::Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load configuration from TOML string (requires toml feature)
    #[cfg(feature = "toml")]
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        let config: Config = toml::from_str(toml_str)?;
        if let Err(e) = config.validate() {
            return Err(toml::de::Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as TOML string (requires toml feature)
    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn parse_param<T>(name: &str, value: &str) -> crate::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| {
        crate::TilepipError::InvalidConfig(format!("Failed to parse ?{}= parameter, {}", name, e))
    })
}
