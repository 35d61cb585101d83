use super::{STATUS_NO_CONTENT, TileResponse, TileSource};
use crate::config::Config;
use crate::error::{Result, TilepipError};
use bytes::Bytes;
use futures::future::BoxFuture;
use quick_cache::sync::Cache;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Serves tiles from a directory tree laid out as `{dataset}/{z}/{x}/{y}.mvt`.
///
/// Missing files answer 204; paths escaping the root are rejected. Tile
/// bodies read from disk are kept in a bounded in-memory cache when one is
/// configured.
#[derive(Clone)]
pub struct DirectoryTileSource {
    root: PathBuf,
    bodies: Option<Arc<Cache<String, Bytes>>>,
}

impl fmt::Debug for DirectoryTileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryTileSource")
            .field("root", &self.root)
            .field("cached_tiles", &self.cached_tiles())
            .finish()
    }
}

impl DirectoryTileSource {
    /// A source without a body cache.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bodies: None,
        }
    }

    /// A source whose body cache holds up to `config.cache_size` tiles.
    pub fn from_config(root: impl Into<PathBuf>, config: &Config) -> Self {
        Self::new(root).with_cache_size(config.cache_size)
    }

    /// Keep up to `tiles` bodies in memory; 0 disables the cache.
    pub fn with_cache_size(mut self, tiles: usize) -> Self {
        self.bodies = (tiles > 0).then(|| Arc::new(Cache::new(tiles)));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of tile bodies currently held in memory.
    pub fn cached_tiles(&self) -> usize {
        self.bodies.as_ref().map_or(0, |bodies| bodies.len())
    }

    async fn read(&self, path: &str) -> Result<Option<Bytes>> {
        if let Some(body) = self.bodies.as_ref().and_then(|bodies| bodies.get(path)) {
            log::trace!("Serving {} from memory", path);
            return Ok(Some(body));
        }

        let file = self.resolve(path)?;
        let body = match tokio::fs::read(&file).await {
            Ok(body) => Bytes::from(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TilepipError::Transport {
                    path: path.to_string(),
                    message: e.to_string(),
                });
            }
        };

        if let Some(bodies) = &self.bodies {
            bodies.insert(path.to_string(), body.clone());
        }
        Ok(Some(body))
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));

        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(TilepipError::InvalidInput(format!(
                "Invalid tile path '{}'",
                path
            )));
        }

        Ok(self.root.join(relative))
    }
}

impl TileSource for DirectoryTileSource {
    fn fetch<'a>(&'a self, path: &'a str, _timeout: Duration) -> BoxFuture<'a, Result<TileResponse>> {
        Box::pin(async move {
            match self.read(path).await? {
                Some(body) => Ok(TileResponse::ok(body)
                    .with_header("Content-Type", "application/vnd.mapbox-vector-tile")),
                None => Ok(TileResponse::status(STATUS_NO_CONTENT)),
            }
        })
    }
}
