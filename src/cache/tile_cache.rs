//! Reference-counted cache of per-tile spatial indexes.
//!
//! A tile's index is built on first use and shared by every query against
//! that tile. Each [`TileIndexLease`] holds one reference; when the last
//! reference is released the tile is scheduled for eviction after a delay
//! chosen by the [`EvictionPolicy`]. A periodic sweep disconnects and drops
//! indexes whose eviction time has passed.

use crate::cache::eviction::EvictionPolicy;
use crate::counter::NamedCounter;
use crate::error::Result;
use crate::index::SpatialIndex;
use crate::tile::TileId;
use rustc_hash::FxHashMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Counters describing a [`TileIndexCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileCacheStats {
    /// Indexes currently cached.
    pub cached: usize,
    /// Tiles with a pending eviction.
    pub scheduled: usize,
    /// Tiles with at least one live lease.
    pub referenced: usize,
    /// Indexes built since the cache was created.
    pub built: u64,
    /// Acquires served by an existing index.
    pub hits: u64,
    /// Indexes evicted by sweeps.
    pub evicted: u64,
}

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    /// Schedule entries examined.
    pub total: usize,
    /// Indexes disconnected and removed.
    pub pruned: usize,
    pub elapsed: Duration,
}

pub struct TileIndexCache {
    indexes: tokio::sync::Mutex<FxHashMap<String, Arc<dyn SpatialIndex>>>,
    schedule: parking_lot::Mutex<FxHashMap<String, Instant>>,
    references: NamedCounter,
    ttl: Duration,
    policy: Arc<dyn EvictionPolicy>,
    recheck_references: bool,
    cached: AtomicUsize,
    built: AtomicU64,
    hits: AtomicU64,
    evicted: AtomicU64,
}

impl fmt::Debug for TileIndexCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileIndexCache")
            .field("ttl", &self.ttl)
            .field("policy", &self.policy)
            .field("recheck_references", &self.recheck_references)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TileIndexCache {
    /// Create a cache whose idle indexes linger for `policy.delay(ttl)`.
    ///
    /// With `recheck_references` set, the sweep skips tiles that were
    /// acquired again after their eviction was scheduled.
    pub fn new(ttl: Duration, policy: Arc<dyn EvictionPolicy>, recheck_references: bool) -> Self {
        Self {
            indexes: tokio::sync::Mutex::new(FxHashMap::default()),
            schedule: parking_lot::Mutex::new(FxHashMap::default()),
            references: NamedCounter::new(),
            ttl,
            policy,
            recheck_references,
            cached: AtomicUsize::new(0),
            built: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Borrow the index for `tile`, building it with `build` if it is not
    /// cached.
    ///
    /// Builds run under the cache lock, so concurrent acquires of the same
    /// tile build it once. A failed build leaves nothing cached.
    pub async fn acquire<F, Fut>(self: &Arc<Self>, tile: &TileId, build: F) -> Result<TileIndexLease>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Box<dyn SpatialIndex>>>,
    {
        let key = tile.cache_key();
        let mut indexes = self.indexes.lock().await;

        if let Some(index) = indexes.get(&key) {
            let index = Arc::clone(index);
            self.references.increment(&key, 1);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(self.lease(key, index));
        }

        let started = Instant::now();
        let index: Arc<dyn SpatialIndex> = Arc::from(build().await?);

        log::debug!(
            "Built index for {} with {} features in {:?}",
            tile,
            index.len(),
            started.elapsed()
        );

        indexes.insert(key.clone(), Arc::clone(&index));
        self.cached.store(indexes.len(), Ordering::Relaxed);
        self.built.fetch_add(1, Ordering::Relaxed);
        self.references.increment(&key, 1);

        Ok(self.lease(key, index))
    }

    fn lease(self: &Arc<Self>, key: String, index: Arc<dyn SpatialIndex>) -> TileIndexLease {
        TileIndexLease {
            cache: Arc::clone(self),
            key,
            index,
        }
    }

    /// Drop one reference to `key`. When none remain and no eviction is
    /// pending, schedule one.
    pub fn release(&self, key: &str) {
        if self.references.increment(key, -1) > 0 {
            return;
        }

        let mut schedule = self.schedule.lock();
        if !schedule.contains_key(key) {
            let due = Instant::now() + self.policy.delay(self.ttl);
            schedule.insert(key.to_string(), due);
        }
    }

    /// Current reference count for `key`.
    pub fn references(&self, key: &str) -> i32 {
        self.references.count(key)
    }

    /// Pending eviction time for `key`.
    pub fn scheduled_eviction(&self, key: &str) -> Option<Instant> {
        self.schedule.lock().get(key).copied()
    }

    pub fn stats(&self) -> TileCacheStats {
        TileCacheStats {
            cached: self.cached.load(Ordering::Relaxed),
            scheduled: self.schedule.lock().len(),
            referenced: self.references.len(),
            built: self.built.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Disconnect and remove every index whose eviction time has passed.
    ///
    /// Holds both the index and schedule locks for the whole sweep.
    /// Schedule entries for tiles that are no longer cached are dropped.
    pub async fn prune_expired(&self) -> PruneStats {
        let started = Instant::now();
        let mut indexes = self.indexes.lock().await;

        let (total, pruned) = {
            let mut schedule = self.schedule.lock();
            let total = schedule.len();
            let mut pruned = 0;

            schedule.retain(|key, due| {
                if !indexes.contains_key(key) {
                    return false;
                }
                if *due > started {
                    return true;
                }
                if self.recheck_references && self.references.count(key) > 0 {
                    log::debug!("Skipping eviction of {}, acquired since release", key);
                    return false;
                }
                if let Some(index) = indexes.remove(key) {
                    index.disconnect();
                    pruned += 1;
                }
                false
            });

            (total, pruned)
        };

        self.cached.store(indexes.len(), Ordering::Relaxed);
        self.evicted.fetch_add(pruned as u64, Ordering::Relaxed);

        let stats = PruneStats {
            total,
            pruned,
            elapsed: started.elapsed(),
        };

        if stats.total > 0 {
            log::info!(
                "Pruned {} of {} scheduled tile indexes in {:?}",
                stats.pruned,
                stats.total,
                stats.elapsed
            );
        }

        stats
    }

    /// Disconnect and remove every cached index and clear the schedule.
    /// Returns the number of indexes disconnected.
    pub async fn disconnect_all(&self) -> usize {
        let mut indexes = self.indexes.lock().await;
        self.schedule.lock().clear();

        let count = indexes.len();
        for (key, index) in indexes.drain() {
            log::debug!("Disconnecting index {}", key);
            index.disconnect();
        }
        self.cached.store(0, Ordering::Relaxed);

        count
    }

    /// Run [`prune_expired`] every `interval` until `shutdown` is cancelled.
    ///
    /// [`prune_expired`]: TileIndexCache::prune_expired
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        log::debug!("Tile index sweeper shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        cache.prune_expired().await;
                    }
                }
            }
        })
    }
}

/// One reference to a cached tile index, released on drop.
pub struct TileIndexLease {
    cache: Arc<TileIndexCache>,
    key: String,
    index: Arc<dyn SpatialIndex>,
}

impl TileIndexLease {
    /// Cache key of the leased tile.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn index(&self) -> &Arc<dyn SpatialIndex> {
        &self.index
    }
}

impl Deref for TileIndexLease {
    type Target = dyn SpatialIndex;

    fn deref(&self) -> &Self::Target {
        self.index.as_ref()
    }
}

impl fmt::Debug for TileIndexLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileIndexLease")
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for TileIndexLease {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::eviction::FixedDelay;
    use crate::error::TilepipError;
    use crate::index::RTreeIndex;
    use tilepip_types::tile::TileCoord;

    fn cache(recheck: bool) -> Arc<TileIndexCache> {
        Arc::new(TileIndexCache::new(
            Duration::from_secs(30),
            Arc::new(FixedDelay(Duration::from_secs(5))),
            recheck,
        ))
    }

    fn tile() -> TileId {
        TileId::new("sf", TileCoord::new(12, 655, 1583))
    }

    async fn build() -> Result<Box<dyn SpatialIndex>> {
        Ok(Box::new(RTreeIndex::new("sf/12/655/1583")))
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_builds_once() {
        let cache = cache(true);
        let tile = tile();

        let first = cache.acquire(&tile, build).await.unwrap();
        let second = cache
            .acquire(&tile, || async { Err(TilepipError::Internal("rebuilt".into())) })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(first.index(), second.index()));
        assert_eq!(cache.references(&tile.cache_key()), 2);

        let stats = cache.stats();
        assert_eq!(stats.built, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.cached, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_schedules_once() {
        let cache = cache(true);
        let tile = tile();
        let key = tile.cache_key();

        let leases: Vec<_> = futures::future::join_all((0..5).map(|_| cache.acquire(&tile, build)))
            .await
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(cache.references(&key), 5);
        assert!(cache.scheduled_eviction(&key).is_none());

        drop(leases);
        assert_eq!(cache.references(&key), 0);

        let due = cache.scheduled_eviction(&key).unwrap();
        cache.release(&key);
        assert_eq!(cache.scheduled_eviction(&key), Some(due));
        assert_eq!(cache.stats().scheduled, 1);
        assert_eq!(cache.references(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_failure_caches_nothing() {
        let cache = cache(true);
        let tile = tile();

        let err = cache
            .acquire(&tile, || async { Err(TilepipError::Internal("boom".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, TilepipError::Internal(_)));

        assert_eq!(cache.stats().cached, 0);
        assert_eq!(cache.references(&tile.cache_key()), 0);

        cache.acquire(&tile, build).await.unwrap();
        assert_eq!(cache.stats().built, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_after_delay() {
        let cache = cache(true);
        let tile = tile();

        let lease = cache.acquire(&tile, build).await.unwrap();
        let index = Arc::clone(lease.index());
        drop(lease);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.prune_expired().await.pruned, 0);
        assert_eq!(cache.stats().cached, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let stats = cache.prune_expired().await;
        assert_eq!(stats.pruned, 1);
        assert_eq!(stats.total, 1);

        assert_eq!(cache.stats().cached, 0);
        assert_eq!(cache.stats().scheduled, 0);
        assert_eq!(cache.stats().evicted, 1);
        assert!(matches!(
            index.point_in_polygon(&geo::Point::new(0.0, 0.0), &[]),
            Err(TilepipError::Disconnected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquired_tile_survives_sweep() {
        let cache = cache(true);
        let tile = tile();
        let key = tile.cache_key();

        drop(cache.acquire(&tile, build).await.unwrap());
        let lease = cache.acquire(&tile, build).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.prune_expired().await.pruned, 0);
        assert_eq!(cache.stats().cached, 1);
        assert!(cache.scheduled_eviction(&key).is_none());

        drop(lease);
        assert!(cache.scheduled_eviction(&key).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_only_eviction_without_recheck() {
        let cache = cache(false);
        let tile = tile();

        drop(cache.acquire(&tile, build).await.unwrap());
        let lease = cache.acquire(&tile, build).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.prune_expired().await.pruned, 1);
        assert!(lease.point_in_polygon(&geo::Point::new(0.0, 0.0), &[]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_schedule_entries_are_dropped() {
        let cache = cache(true);
        cache.release("nothing-12-0-0.db");
        assert_eq!(cache.stats().scheduled, 1);

        let stats = cache.prune_expired().await;
        assert_eq!(stats.pruned, 0);
        assert_eq!(cache.stats().scheduled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all() {
        let cache = cache(true);
        let a = TileId::new("sf", TileCoord::new(12, 1, 1));
        let b = TileId::new("sf", TileCoord::new(12, 1, 2));

        drop(cache.acquire(&a, build).await.unwrap());
        let lease = cache.acquire(&b, build).await.unwrap();

        assert_eq!(cache.disconnect_all().await, 2);
        assert_eq!(cache.stats().cached, 0);
        assert_eq!(cache.stats().scheduled, 0);
        assert!(lease.point_in_polygon(&geo::Point::new(0.0, 0.0), &[]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_and_stops() {
        let cache = cache(true);
        let tile = tile();
        let token = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(Duration::from_secs(1), token.clone());

        drop(cache.acquire(&tile, build).await.unwrap());

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(cache.stats().cached, 0);
        assert_eq!(cache.stats().evicted, 1);

        token.cancel();
        sweeper.await.unwrap();
    }
}
