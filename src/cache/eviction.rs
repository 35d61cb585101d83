//! When idle tile indexes are evicted.

use rand::Rng;
use std::fmt::Debug;
use std::time::Duration;

/// Decides how long an unreferenced tile index lingers before the sweep
/// may evict it.
pub trait EvictionPolicy: Send + Sync + Debug {
    fn delay(&self, ttl: Duration) -> Duration;
}

/// Uniformly random delay in `[0, ttl / 3)`, spreading evictions of tiles
/// released together across several sweeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitteredTtl;

impl EvictionPolicy for JitteredTtl {
    fn delay(&self, ttl: Duration) -> Duration {
        let window_ms = u64::try_from(ttl.as_millis() / 3).unwrap_or(u64::MAX);
        if window_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..window_ms))
    }
}

/// The same delay for every tile, whatever the TTL.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl EvictionPolicy for FixedDelay {
    fn delay(&self, _ttl: Duration) -> Duration {
        self.0
    }
}
