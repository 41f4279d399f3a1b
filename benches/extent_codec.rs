// Extent Codec benchmarks (C6): page encode/decode throughput per
// PageType, plus the cost of framing a multi-page extent and reading
// it back, across compression algorithms.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tsdb_engine::codec::codec_for;
use tsdb_engine::common::{MetricUuid, PageType, Point, PointFlags, TimestampS};
use tsdb_engine::compression::CompressionAlgorithm;
use tsdb_engine::page::Page;
use tsdb_engine::storage::extent::{build_extent, parse_extent};

fn raw_points(n: usize, start: TimestampS) -> Vec<Point> {
    (0..n as i64)
        .map(|i| Point::raw(start + i, (i as f64 * 0.37).sin() * 100.0, PointFlags::empty()))
        .collect()
}

fn page_of(page_type: PageType, n: usize, start: TimestampS) -> Page {
    let points = raw_points(n, start);
    let codec = codec_for(page_type);
    let data = codec.encode(&points, 1).unwrap();
    Page {
        metric: MetricUuid::new_v4(),
        section: tsdb_engine::common::Section::tier(0),
        page_type,
        start_time_s: start,
        end_time_s: start + n as i64 - 1,
        update_every_s: 1,
        entries: n as u32,
        data,
    }
}

fn bench_codec_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_encode");
    for page_type in [PageType::Array32, PageType::Gorilla] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{page_type:?}")), &page_type, |b, &page_type| {
            let points = raw_points(1024, 1_700_000_000);
            let codec = codec_for(page_type);
            b.iter(|| black_box(codec.encode(&points, 1).unwrap()));
        });
    }
    group.finish();
}

fn bench_codec_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_decode");
    for page_type in [PageType::Array32, PageType::Gorilla] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{page_type:?}")), &page_type, |b, &page_type| {
            let points = raw_points(1024, 1_700_000_000);
            let codec = codec_for(page_type);
            let data = codec.encode(&points, 1).unwrap();
            b.iter(|| black_box(codec.decode(&data, points.len() as u32, 1_700_000_000, 1).unwrap()));
        });
    }
    group.finish();
}

fn bench_build_extent(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_extent");
    for algo in [CompressionAlgorithm::None, CompressionAlgorithm::Lz4] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{algo:?}")), &algo, |b, &algo| {
            let pages: Vec<Page> = (0..16).map(|i| page_of(PageType::Array32, 1024, 1_700_000_000 + i * 1024)).collect();
            b.iter(|| black_box(build_extent(&pages, algo).unwrap()));
        });
    }
    group.finish();
}

fn bench_parse_extent_roundtrip(c: &mut Criterion) {
    let pages: Vec<Page> = (0..16).map(|i| page_of(PageType::Array32, 1024, 1_700_000_000 + i * 1024)).collect();
    let extent = build_extent(&pages, CompressionAlgorithm::Lz4).unwrap();

    c.bench_function("parse_and_decode_extent", |b| {
        b.iter(|| {
            let parsed = parse_extent(black_box(&extent.bytes)).unwrap();
            black_box(parsed.decode_pages(&extent.bytes).unwrap());
        });
    });
}

criterion_group!(benches, bench_codec_encode, bench_codec_decode, bench_build_extent, bench_parse_extent_roundtrip);
criterion_main!(benches);
