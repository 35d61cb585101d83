//! Secondary store of decoded feature bodies, keyed by place id.
//!
//! Query paths push every GeoJSON body they decode into the cache so that
//! records can later be read back by id without touching the tiles.

use crate::error::{Result, TilepipError};
use crate::feature::{ALT_LABEL, WOF_ID, feature_cache_key, value_as_i64};
use crate::uri::id_to_rel_path;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A cached feature body.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureCacheRecord {
    /// Seconds since the Unix epoch at which the record was created.
    pub created_at: u64,
    /// `{id}` or `{id}-alt-{label}`.
    pub id: String,
    /// Relative record path, e.g. `110/883/080/9/1108830809.geojson`.
    pub path: String,
    pub body: Bytes,
}

impl FeatureCacheRecord {
    /// Build a record from a GeoJSON feature body, deriving its key from
    /// `wof:id` and `src:alt_label`.
    pub fn from_body(body: Bytes) -> Result<Self> {
        let feature: Value = serde_json::from_slice(&body)?;
        let properties = feature.get("properties");

        let id = properties
            .and_then(|p| p.get(WOF_ID))
            .and_then(value_as_i64)
            .ok_or_else(|| {
                TilepipError::FeatureCache("Failed to derive ID from feature".to_string())
            })?;

        let alt_label = properties
            .and_then(|p| p.get(ALT_LABEL))
            .and_then(Value::as_str)
            .filter(|label| !label.is_empty());

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Ok(Self {
            created_at,
            id: feature_cache_key(id, alt_label),
            path: id_to_rel_path(id, alt_label),
            body,
        })
    }
}

/// Storage for feature bodies.
pub trait FeatureCache: Send + Sync {
    /// Store a GeoJSON feature body.
    fn put(&self, body: Bytes) -> BoxFuture<'_, Result<FeatureCacheRecord>>;

    /// Look up a record by key; [`TilepipError::NotFound`] when absent.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<FeatureCacheRecord>>;

    /// Drop expired records, returning how many were removed. Stores that
    /// expire records on their own can keep the default.
    fn prune_expired(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async { Ok(0) })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Run [`FeatureCache::prune_expired`] every `interval` until `shutdown` is
/// cancelled.
pub fn spawn_pruner(
    cache: Arc<dyn FeatureCache>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    log::debug!("Feature cache pruner shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = cache.prune_expired().await {
                        log::warn!("Failed to prune feature cache: {}", e);
                    }
                }
            }
        }
    })
}

/// In-memory [`FeatureCache`]. Records expire `ttl` after they were last
/// written; expired records are dropped on read, by [`prune`] or by a
/// [`spawn_pruner`] task.
///
/// [`prune`]: MemoryFeatureCache::prune
#[derive(Debug)]
pub struct MemoryFeatureCache {
    ttl: Duration,
    records: RwLock<FxHashMap<String, (Instant, FeatureCacheRecord)>>,
    closed: AtomicBool,
}

impl MemoryFeatureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: RwLock::new(FxHashMap::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Remove expired records, returning how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, (stored, _)| now.duration_since(*stored) < self.ttl);
        let pruned = before - records.len();

        if pruned > 0 {
            log::debug!("Pruned {} expired feature cache records", pruned);
        }
        pruned
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TilepipError::FeatureCache("cache is closed".to_string()));
        }
        Ok(())
    }
}

impl FeatureCache for MemoryFeatureCache {
    fn put(&self, body: Bytes) -> BoxFuture<'_, Result<FeatureCacheRecord>> {
        Box::pin(async move {
            self.ensure_open()?;
            let record = FeatureCacheRecord::from_body(body)?;

            log::trace!("Store in feature cache {}", record.id);
            self.records
                .write()
                .insert(record.id.clone(), (Instant::now(), record.clone()));
            Ok(record)
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<FeatureCacheRecord>> {
        Box::pin(async move {
            self.ensure_open()?;

            let mut records = self.records.write();
            let expired = match records.get(id) {
                Some((stored, record)) if stored.elapsed() < self.ttl => {
                    return Ok(record.clone());
                }
                Some(_) => true,
                None => false,
            };

            if expired {
                records.remove(id);
            }
            Err(TilepipError::NotFound(id.to_string()))
        })
    }

    fn prune_expired(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(self.prune()) })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            self.records.write().clear();
            Ok(())
        })
    }
}
