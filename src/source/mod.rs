//! Tile sources: where tile payloads come from.
//!
//! A [`TileSource`] answers a tile path with an HTTP-style status, headers
//! and body. Status 200 carries a tile, 204 means the dataset has no data at
//! that location, anything else is a failure.

mod directory;
mod memory;

pub use directory::DirectoryTileSource;
pub use memory::MemoryTileSource;

use crate::error::{Result, TilepipError};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::time::Duration;

pub const STATUS_OK: u16 = 200;
pub const STATUS_NO_CONTENT: u16 = 204;
pub const STATUS_NOT_FOUND: u16 = 404;

/// Response to a tile fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct TileResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl TileResponse {
    /// A 200 response carrying `body`.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: STATUS_OK,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// An empty 204 response.
    pub fn no_content() -> Self {
        Self::status(STATUS_NO_CONTENT)
    }

    /// An empty response with an arbitrary status.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Fetches tile payloads by path (`/{dataset}/{z}/{x}/{y}.mvt`).
///
/// `timeout` is advisory for implementations; callers additionally bound
/// every fetch with it.
pub trait TileSource: Send + Sync {
    fn fetch<'a>(&'a self, path: &'a str, timeout: Duration) -> BoxFuture<'a, Result<TileResponse>>;
}

/// Fetch `path` from `source`, failing with [`TilepipError::Timeout`] if the
/// source does not answer within `timeout`.
pub async fn fetch_with_timeout(
    source: &dyn TileSource,
    path: &str,
    timeout: Duration,
) -> Result<TileResponse> {
    match tokio::time::timeout(timeout, source.fetch(path, timeout)).await {
        Ok(response) => response,
        Err(_) => Err(TilepipError::Timeout {
            path: path.to_string(),
            timeout,
        }),
    }
}
