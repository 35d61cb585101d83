mod common;

use common::*;
use futures::StreamExt;
use geo::Geometry;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tilepip::source::MemoryTileSource;
use tilepip::{Config, Feature, PlaceFilter, TileDatabase, TileDatabaseBuilder, TilepipError};

fn database(source: Arc<MemoryTileSource>) -> TileDatabase {
    TileDatabaseBuilder::new(Config::new(DATASET).with_zoom(ZOOM).with_feature_cache(true))
        .tile_source(source)
        .build()
        .unwrap()
}

async fn cached_geometry(db: &TileDatabase, id: i64) -> Geometry<f64> {
    let body = db.read(&format!("{}.geojson", id)).await.unwrap();
    Feature::from_body(&body).unwrap().geometry
}

#[tokio::test]
async fn test_fragments_merge_across_tiles() {
    init_logging();
    let west = origin_tile();
    let east = offset(west, 1, 0);

    let source = Arc::new(MemoryTileSource::new());
    insert(&source, west, vec![place(42, "locality", tile_rect(west, 0.5, 0.2, 1.0, 0.8))]);
    insert(&source, east, vec![place(42, "locality", tile_rect(east, 0.0, 0.2, 0.5, 0.8))]);
    let db = database(source);

    let results = db.intersects(&query_box(west, east), &[]).await.unwrap();
    assert_eq!(ids(&results), vec![42]);

    match cached_geometry(&db, 42).await {
        Geometry::MultiPolygon(multi) => assert_eq!(multi.0.len(), 2),
        other => panic!("expected a multipolygon, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disjoint_places_are_excluded() {
    let coord = origin_tile();
    let source = Arc::new(MemoryTileSource::new());
    insert(
        &source,
        coord,
        vec![
            place(1, "locality", tile_rect(coord, 0.1, 0.1, 0.3, 0.3)),
            place(2, "locality", tile_rect(coord, 0.7, 0.7, 0.9, 0.9)),
        ],
    );
    let db = database(source);

    let query = Geometry::Polygon(tile_rect(coord, 0.0, 0.0, 0.5, 0.5));
    let results = db.intersects(&query, &[]).await.unwrap();
    assert_eq!(ids(&results), vec![1]);
}

#[tokio::test]
async fn test_intersects_applies_filters() {
    let coord = origin_tile();
    let source = Arc::new(MemoryTileSource::new());
    insert(
        &source,
        coord,
        vec![
            place(1, "locality", tile_rect(coord, 0.1, 0.1, 0.9, 0.9)),
            place(2, "neighbourhood", tile_rect(coord, 0.2, 0.2, 0.4, 0.4)),
        ],
    );
    let db = database(source);

    let query = Geometry::Point(at(coord, 0.3, 0.3));
    let neighbourhoods = PlaceFilter::new().with_placetypes(["neighbourhood"]);
    let results = db.intersects(&query, &[&neighbourhoods]).await.unwrap();
    assert_eq!(ids(&results), vec![2]);
    assert_eq!(db.stats().intersects_queries, 1);
}

#[tokio::test]
async fn test_partial_failure_leaks_no_tasks() {
    init_logging();
    let origin = origin_tile();
    let failing = tile_id(offset(origin, 1, 0));
    let source = Arc::new(SlowSource::new(&failing, Duration::from_secs(30)));

    let db = TileDatabaseBuilder::new(Config::new(DATASET).with_zoom(ZOOM))
        .tile_source(Arc::clone(&source) as _)
        .build()
        .unwrap();

    let query = query_box(origin, offset(origin, 2, 0));
    let started = tokio::time::Instant::now();
    let err = db.intersects(&query, &[]).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        TilepipError::Tile { tile, source } => {
            assert_eq!(tile, failing.to_string());
            assert!(matches!(*source, TilepipError::UnexpectedStatus { status: 500, .. }));
        }
        other => panic!("unexpected error {:?}", other),
    }

    assert!(source.started.load(Ordering::SeqCst) <= 3);
    assert_eq!(source.in_flight(), 0);
}

#[tokio::test]
async fn test_dropped_query_leaks_no_tasks() {
    let origin = origin_tile();
    let failing = tile_id(offset(origin, 9, 9));
    let source = Arc::new(SlowSource::new(&failing, Duration::from_secs(30)));

    let db = TileDatabaseBuilder::new(Config::new(DATASET).with_zoom(ZOOM))
        .tile_source(Arc::clone(&source) as _)
        .build()
        .unwrap();

    let query = query_box(origin, offset(origin, 2, 2));
    let timed_out = tokio::time::timeout(Duration::from_millis(50), db.intersects(&query, &[])).await;
    assert!(timed_out.is_err());

    // Aborted tasks drop their fetches once the runtime gets to them.
    for _ in 0..100 {
        if source.in_flight() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(source.in_flight(), 0);
}

#[tokio::test]
async fn test_empty_cover_tiles_are_skipped() {
    let origin = origin_tile();
    let source = Arc::new(MemoryTileSource::new());
    insert(&source, origin, vec![place(7, "locality", tile_rect(origin, 0.4, 0.4, 0.6, 0.6))]);
    let db = database(source);

    let query = query_box(origin, offset(origin, 1, 1));
    let results = db.intersects(&query, &[]).await.unwrap();
    assert_eq!(ids(&results), vec![7]);
}

/// Nine tiles with one to three places each, plus one place split across
/// the boundary of the centre tile and its eastern neighbour.
#[tokio::test]
async fn test_three_by_three_cover() {
    init_logging();
    let origin = origin_tile();
    let source = Arc::new(MemoryTileSource::new());
    let mut expected = Vec::new();

    for dy in 0..3u32 {
        for dx in 0..3u32 {
            let coord = offset(origin, dx, dy);
            let n = i64::from(dy * 3 + dx);
            let mut features = Vec::new();

            for k in 0..=(n % 3) {
                let id = 1000 + n * 10 + k;
                expected.push(id);
                features.push(place(id, "locality", tile_rect(coord, 0.45, 0.45, 0.55, 0.55)));
            }

            if (dx, dy) == (1, 1) {
                features.push(place(42, "campus", tile_rect(coord, 0.8, 0.3, 1.0, 0.7)));
            }
            if (dx, dy) == (2, 1) {
                features.push(place(42, "campus", tile_rect(coord, 0.0, 0.3, 0.2, 0.7)));
            }

            insert(&source, coord, features);
        }
    }
    expected.push(42);
    expected.sort_unstable();

    let db = database(Arc::clone(&source));
    let query = query_box(origin, offset(origin, 2, 2));

    let streamed: Vec<i64> = db
        .intersects_stream(&query, no_filters())
        .map(|result| result.unwrap().id)
        .collect()
        .await;

    assert_eq!(streamed.len(), 19);
    assert_eq!(streamed, expected);
    assert_eq!(source.fetch_count(), 9);

    match cached_geometry(&db, 42).await {
        Geometry::MultiPolygon(multi) => assert_eq!(multi.0.len(), 2),
        other => panic!("expected a multipolygon, got {:?}", other),
    }
    match cached_geometry(&db, 1000).await {
        Geometry::Polygon(_) => {}
        other => panic!("expected a polygon, got {:?}", other),
    }
}

#[tokio::test]
async fn test_large_cover_is_allowed_when_configured() {
    let origin = origin_tile();
    let corner = offset(origin, 69, 69);
    let source = Arc::new(MemoryTileSource::new());
    insert(&source, origin, vec![place(7, "region", tile_rect(origin, 0.6, 0.6, 0.9, 0.9))]);
    insert(&source, corner, vec![place(8, "region", tile_rect(corner, 0.1, 0.1, 0.4, 0.4))]);

    // 70 x 70 tiles at zoom 12.
    let query = Geometry::Rect(geo::Rect::new(at(origin, 0.5, 0.5).0, at(corner, 0.5, 0.5).0));

    let err = database(Arc::clone(&source)).intersects(&query, &[]).await.unwrap_err();
    assert!(matches!(err, TilepipError::TileCover(_)));
    assert_eq!(source.fetch_count(), 0);

    let db = TileDatabaseBuilder::new(Config::new(DATASET).with_zoom(ZOOM).with_max_tile_cover(0))
        .tile_source(Arc::clone(&source) as _)
        .build()
        .unwrap();

    let results = db.intersects(&query, &[]).await.unwrap();
    assert_eq!(ids(&results), vec![7, 8]);
    assert_eq!(source.fetch_count(), 4900);
}
