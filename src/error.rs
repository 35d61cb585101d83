//! Error types for tilepip.

use std::time::Duration;
use thiserror::Error;

/// Errors produced while fetching, decoding, indexing or querying tiles.
#[derive(Error, Debug)]
pub enum TilepipError {
    /// Configuration failed validation or could not be parsed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A query argument was rejected (non-finite coordinate, empty geometry, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The tile source failed to produce a response.
    #[error("Failed to fetch {path}: {message}")]
    Transport { path: String, message: String },

    /// The tile source did not answer within the per-request timeout.
    #[error("Timed out after {timeout:?} fetching {path}")]
    Timeout { path: String, timeout: Duration },

    /// The tile source answered with a status other than 200 or 204.
    #[error("Failed to get {path}, unexpected status code {status}")]
    UnexpectedStatus { path: String, status: u16 },

    /// The tile payload could not be decompressed or decoded.
    #[error("Failed to decode tile {tile}: {message}")]
    Decode { tile: String, message: String },

    /// The tile does not contain the configured layer.
    #[error("Missing {layer} layer in tile {tile}")]
    MissingLayer { layer: String, tile: String },

    /// A flattened property could not be parsed back into its structured form.
    #[error("Failed to unmarshal {key} value ({value}) for feature {feature}: {source}")]
    PropertyUnfurl {
        key: String,
        value: String,
        feature: String,
        #[source]
        source: serde_json::Error,
    },

    /// A decoded feature could not be added to a tile's spatial index.
    #[error("Failed to index feature {feature} at offset {offset}: {message}")]
    IndexBuild {
        feature: String,
        offset: usize,
        message: String,
    },

    /// The tile cover of a query geometry could not be derived.
    #[error("Failed to derive tile cover: {0}")]
    TileCover(String),

    /// A tile index was used after it was disconnected.
    #[error("Spatial index for {0} has been disconnected")]
    Disconnected(String),

    /// Wraps an error with the tile it occurred in.
    #[error("Failed to derive features for tile {tile}: {source}")]
    Tile {
        tile: String,
        #[source]
        source: Box<TilepipError>,
    },

    /// The requested record does not exist (or the feature cache is disabled).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation is not supported by a read-only tile database.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// The secondary feature cache failed.
    #[error("Feature cache error: {0}")]
    FeatureCache(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task failed unexpectedly.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TilepipError {
    /// Attach the tile this error occurred in.
    pub fn in_tile(self, tile: impl ToString) -> Self {
        TilepipError::Tile {
            tile: tile.to_string(),
            source: Box::new(self),
        }
    }

    /// Whether this error (or the error it wraps) means "no such record".
    pub fn is_not_found(&self) -> bool {
        match self {
            TilepipError::NotFound(_) => true,
            TilepipError::Tile { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Result type for tilepip operations.
pub type Result<T> = std::result::Result<T, TilepipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_context_is_preserved() {
        let err = TilepipError::UnexpectedStatus {
            path: "/sf/12/655/1583.mvt".into(),
            status: 500,
        }
        .in_tile("sf/12/655/1583");

        let message = err.to_string();
        assert!(message.contains("sf/12/655/1583"));
        assert!(matches!(
            err,
            TilepipError::Tile { ref source, .. }
                if matches!(**source, TilepipError::UnexpectedStatus { status: 500, .. })
        ));
    }

    #[test]
    fn test_not_found_through_context() {
        let err = TilepipError::NotFound("1234".into()).in_tile("sf/1/0/0");
        assert!(err.is_not_found());
        assert!(!TilepipError::Internal("x".into()).is_not_found());
    }
}
