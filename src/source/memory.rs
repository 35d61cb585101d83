use super::{TileResponse, TileSource};
use crate::error::Result;
use crate::tile::TileId;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// In-memory tile source. Paths without a stored response answer 204.
#[derive(Debug, Default)]
pub struct MemoryTileSource {
    responses: RwLock<FxHashMap<String, TileResponse>>,
    fetches: AtomicUsize,
}

impl MemoryTileSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with status 200 for `tile`.
    pub fn insert_tile(&self, tile: &TileId, body: impl Into<Bytes>) {
        self.insert(tile.path(), TileResponse::ok(body));
    }

    /// Serve `response` for `path`.
    pub fn insert(&self, path: impl Into<String>, response: TileResponse) {
        self.responses.write().insert(path.into(), response);
    }

    pub fn remove(&self, path: &str) -> Option<TileResponse> {
        self.responses.write().remove(path)
    }

    pub fn len(&self) -> usize {
        self.responses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.read().is_empty()
    }

    /// Number of fetches served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl TileSource for MemoryTileSource {
    fn fetch<'a>(&'a self, path: &'a str, _timeout: Duration) -> BoxFuture<'a, Result<TileResponse>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let response = self
            .responses
            .read()
            .get(path)
            .cloned()
            .unwrap_or_else(TileResponse::no_content);

        Box::pin(async move { Ok(response) })
    }
}
