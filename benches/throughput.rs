//! Throughput benchmarks for the GeoKV storage layer.
//!
//! These measure the collection store and the geometry predicates under
//! the workloads a fleet-tracking deployment actually runs: point upserts,
//! point lookups, and radius searches.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use geokv::collection::Collection;
use geokv::geojson::{Object, Position};

fn point(lat: f64, lon: f64) -> Object {
    Object::SimplePoint(Position::from_latlon(lat, lon))
}

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_point", |b| {
        let mut col = Collection::new();
        let mut i = 0u64;
        b.iter(|| {
            let id = format!("truck:{}", i);
            col.set(&id, point(33.0 + (i % 100) as f64 * 0.001, -112.0), &[]);
            i += 1;
        });
    });

    group.bench_function("set_point_with_fields", |b| {
        let mut col = Collection::new();
        let fields = vec![("speed".to_string(), 55.0), ("heading".to_string(), 90.0)];
        let mut i = 0u64;
        b.iter(|| {
            let id = format!("truck:{}", i);
            col.set(&id, point(33.0, -112.0), &fields);
            i += 1;
        });
    });

    group.bench_function("set_replace_existing", |b| {
        let mut col = Collection::new();
        col.set("truck:1", point(33.0, -112.0), &[]);
        let mut i = 0u64;
        b.iter(|| {
            col.set("truck:1", point(33.0 + (i % 100) as f64 * 0.0001, -112.0), &[]);
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let mut col = Collection::new();
    for i in 0..100_000 {
        let id = format!("truck:{}", i);
        col.set(&id, point(33.0 + (i % 1000) as f64 * 0.001, -112.0), &[]);
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let id = format!("truck:{}", i % 100_000);
            black_box(col.get(&id));
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let id = format!("missing:{}", i);
            black_box(col.get(&id));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark spatial queries
fn bench_nearby(c: &mut Criterion) {
    let mut col = Collection::new();
    for i in 0..10_000 {
        let id = format!("truck:{}", i);
        let lat = 33.0 + (i % 100) as f64 * 0.01;
        let lon = -112.0 + (i / 100) as f64 * 0.01;
        col.set(&id, point(lat, lon), &[]);
    }
    let center = Position::from_latlon(33.5, -111.5);

    let mut group = c.benchmark_group("nearby");

    group.bench_function("radius_5km", |b| {
        b.iter(|| {
            let mut hits = 0u64;
            col.nearby(&center, 5_000.0, |_, _, _, _| {
                hits += 1;
                true
            });
            black_box(hits)
        });
    });

    group.bench_function("knn_10", |b| {
        b.iter(|| {
            let mut hits = 0u64;
            col.nearest(&center, |_, _, _, _| {
                hits += 1;
                hits < 10
            });
            black_box(hits)
        });
    });

    group.finish();
}

/// Benchmark geometry predicates
fn bench_geometry(c: &mut Criterion) {
    let poly = Object::parse_json(
        r#"{"type":"Polygon","coordinates":[[[-112.3,33.3],[-111.7,33.3],[-111.7,33.7],[-112.3,33.7],[-112.3,33.3]]]}"#,
    )
    .unwrap();
    let inside = point(33.5, -112.0);
    let outside = point(40.0, -100.0);

    let mut group = c.benchmark_group("geometry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("point_within_polygon", |b| {
        b.iter(|| black_box(inside.within(&poly)));
    });

    group.bench_function("point_outside_polygon", |b| {
        b.iter(|| black_box(outside.within(&poly)));
    });

    group.bench_function("within_circle", |b| {
        let center = Position::from_latlon(33.5, -112.0);
        b.iter(|| black_box(inside.within_circle(&center, 10_000.0)));
    });

    group.finish();
}

criterion_group!(benches, bench_set, bench_get, bench_nearby, bench_geometry);
criterion_main!(benches);
