//! Geometry intersection queries.
//!
//! Every tile covering the query geometry is fetched and decoded
//! concurrently, without touching the index cache. Fragments of the same
//! place from different tiles are merged before the containment check.

use super::internal::DatabaseInner;
use crate::error::{Result, TilepipError};
use crate::feature::Feature;
use crate::filter::{PlaceResult, ResultFilter, matches_all};
use crate::tile::{TileId, tile_cover_bounded};
use futures::stream::{self, BoxStream, StreamExt};
use geo::{Geometry, Intersects, MultiPolygon};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Fragments are grouped by place id, then alternate geometry label.
pub(crate) type FragmentKey = (i64, Option<String>);

pub(crate) type Fragments = BTreeMap<FragmentKey, SmallVec<[Feature; 2]>>;

/// Fetch and decode every tile covering `geometry`, grouping fragments by
/// place.
///
/// The first failing tile cancels the rest; all spawned tasks have finished
/// or been aborted by the time this returns.
pub(crate) async fn collect_fragments(
    inner: &Arc<DatabaseInner>,
    geometry: &Geometry<f64>,
) -> Result<Fragments> {
    let cover = tile_cover_bounded(geometry, inner.config.zoom, inner.config.max_tile_cover)?;
    log::debug!("Intersects query covers {} tiles", cover.len());

    let fragments = Arc::new(parking_lot::Mutex::new(Fragments::new()));
    let cancel = inner.shutdown.child_token();
    let mut tasks = JoinSet::new();

    for coord in cover {
        let tile = TileId::new(inner.config.database.clone(), coord);
        let inner = Arc::clone(inner);
        let fragments = Arc::clone(&fragments);
        let cancel = cancel.clone();

        tasks.spawn(async move { load_tile(&inner, &tile, &fragments, &cancel).await });
    }

    let mut first_error: Option<TilepipError> = None;

    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(TilepipError::Internal(format!("tile task failed: {}", e))),
        };

        if let Err(e) = outcome
            && first_error.is_none()
        {
            cancel.cancel();
            tasks.abort_all();
            first_error = Some(e);
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    let fragments = std::mem::take(&mut *fragments.lock());
    Ok(fragments)
}

/// Fetch one tile and add its features, unless the query is cancelled
/// first.
async fn load_tile(
    inner: &DatabaseInner,
    tile: &TileId,
    fragments: &parking_lot::Mutex<Fragments>,
    cancel: &CancellationToken,
) -> Result<()> {
    let features = tokio::select! {
        biased;

        _ = cancel.cancelled() => return Ok(()),

        result = inner.features_for_tile(tile) => result.map_err(|e| e.in_tile(tile))?,
    };

    add_fragments(&mut fragments.lock(), features, tile);
    Ok(())
}

/// Add one tile's features, skipping repeats within the tile and features
/// without a usable id.
fn add_fragments(fragments: &mut Fragments, features: Vec<Feature>, tile: &TileId) {
    let mut seen = FxHashSet::default();

    for feature in features {
        let Some(id) = feature.wof_id() else {
            log::warn!("Skipping feature without id in {}", tile);
            continue;
        };
        if id < 0 {
            log::warn!("Skipping feature with invalid id {} in {}", id, tile);
            continue;
        }

        let key = (id, feature.alt_label().map(str::to_string));
        if !seen.insert(key.clone()) {
            continue;
        }
        fragments.entry(key).or_default().push(feature);
    }
}

/// Combine fragments of one place into a single feature.
///
/// A lone fragment is returned as is. Polygonal fragments are flattened
/// into one multipolygon; other geometry types are skipped. If nothing
/// polygonal remains, the first fragment's geometry is kept.
pub(crate) fn merge_fragments(fragments: SmallVec<[Feature; 2]>) -> Option<Feature> {
    let mut fragments = fragments.into_iter();
    let mut merged = fragments.next()?;
    let rest: Vec<Feature> = fragments.collect();

    if rest.is_empty() {
        return Some(merged);
    }

    let mut polygons = Vec::new();
    for geometry in std::iter::once(&merged.geometry).chain(rest.iter().map(|f| &f.geometry)) {
        match geometry {
            Geometry::Polygon(polygon) => polygons.push(polygon.clone()),
            Geometry::MultiPolygon(multi) => polygons.extend(multi.0.iter().cloned()),
            other => log::warn!(
                "Unsupported geometry type {} for merging feature {:?}",
                geometry_kind(other),
                merged.wof_id()
            ),
        }
    }

    if polygons.is_empty() {
        return Some(merged);
    }

    merged.geometry = Geometry::MultiPolygon(MultiPolygon(polygons));
    Some(merged)
}

fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

enum StreamState {
    Pending,
    Emitting(std::collections::btree_map::IntoIter<FragmentKey, SmallVec<[Feature; 2]>>),
    Done,
}

/// Stream the places intersecting `geometry` that pass every filter, in
/// id order. An error ends the stream.
pub(crate) fn intersects_stream<'a>(
    inner: &'a Arc<DatabaseInner>,
    geometry: &'a Geometry<f64>,
    filters: &'a [&'a dyn ResultFilter],
) -> BoxStream<'a, Result<PlaceResult>> {
    stream::unfold(StreamState::Pending, move |state| async move {
        let mut candidates = match state {
            StreamState::Done => return None,
            StreamState::Emitting(candidates) => candidates,
            StreamState::Pending => {
                let collected = match inner.ensure_open() {
                    Ok(()) => collect_fragments(inner, geometry).await,
                    Err(e) => Err(e),
                };
                inner.intersects_queries.fetch_add(1, Ordering::Relaxed);

                match collected {
                    Ok(fragments) => fragments.into_iter(),
                    Err(e) => return Some((Err(e), StreamState::Done)),
                }
            }
        };

        loop {
            let (_, fragments) = candidates.next()?;

            if !fragments.iter().any(|f| f.geometry.intersects(geometry)) {
                continue;
            }
            let Some(feature) = merge_fragments(fragments) else {
                continue;
            };

            let result = match PlaceResult::from_feature(&feature) {
                Ok(result) => result,
                Err(e) => return Some((Err(e), StreamState::Done)),
            };
            if !matches_all(&result, filters) {
                continue;
            }

            if inner.feature_cache.is_some() {
                match feature.to_body() {
                    Ok(body) => inner.cache_features(vec![body]).await,
                    Err(e) => log::warn!("Failed to serialize feature {}: {}", result.id, e),
                }
            }

            return Some((Ok(result), StreamState::Emitting(candidates)));
        }
    })
    .boxed()
}
