//! Performance benchmarks for ingestion and delta queries.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use osutrack::{
    BeatmapId, Clock, ManualClock, Mode, RawScore, RawSnapshot, StatFields, Timestamp, Tracker,
    TrackerConfig, UserId,
};
use std::sync::Arc;
use tempfile::TempDir;

const USER: UserId = UserId(2);
const START: Timestamp = Timestamp(1_500_000_000_000_000);

fn create_tracker(dir: &TempDir) -> (Tracker, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START));
    let tracker = Tracker::with_clock(
        TrackerConfig {
            row_cache_size: 1000,
            ..TrackerConfig::at(dir.path().join("store"))
        },
        clock.clone(),
    )
    .unwrap();
    (tracker, clock)
}

fn raw(playcount: i64) -> RawSnapshot {
    let fields = StatFields {
        playcount,
        count300: playcount * 400,
        total_score: playcount * 1_000_000,
        pp_rank: 5000,
        pp_raw: 4000.0,
        accuracy: 98.5,
        level: 99.0,
        ..Default::default()
    };
    RawSnapshot::from_stats(USER, "peppy", &fields)
}

fn build_history(tracker: &Tracker, clock: &ManualClock, size: i64) {
    for playcount in 0..size {
        tracker.ingest(USER, Mode::Standard, raw(playcount)).unwrap();
        clock.advance_secs(600);
    }
}

/// Benchmark ingesting a changed payload
fn bench_ingest_changed(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = create_tracker(&dir);
    let mut playcount = 0;

    c.bench_function("ingest_changed", |b| {
        b.iter(|| {
            playcount += 1;
            clock.advance_secs(1);
            black_box(tracker.ingest(USER, Mode::Standard, raw(playcount)).unwrap());
        });
    });
}

/// Benchmark ingesting a payload identical to the last stored one
fn bench_ingest_unchanged(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (tracker, _clock) = create_tracker(&dir);
    tracker.ingest(USER, Mode::Standard, raw(1)).unwrap();

    c.bench_function("ingest_unchanged", |b| {
        b.iter(|| {
            black_box(tracker.ingest(USER, Mode::Standard, raw(1)).unwrap());
        });
    });
}

/// Benchmark score ingestion with a rising best
fn bench_ingest_score(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (tracker, _clock) = create_tracker(&dir);
    tracker.track_user(USER, "peppy").unwrap();
    let mut score = 0u64;

    c.bench_function("ingest_score", |b| {
        b.iter(|| {
            score += 1;
            let raw = RawScore {
                score: Some(score.to_string()),
                rank: Some("A".into()),
                date: Some("2020-01-01 00:00:00".into()),
                ..Default::default()
            };
            black_box(
                tracker
                    .ingest_score(USER, BeatmapId(75), Mode::Standard, raw)
                    .unwrap(),
            );
        });
    });
}

/// Benchmark delta over a full history of varying size
fn bench_compute_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_delta");

    for history_size in [100, 1000, 10000] {
        group.bench_with_input(
            BenchmarkId::new("history_rows", history_size),
            &history_size,
            |b, &size| {
                let dir = TempDir::new().unwrap();
                let (tracker, clock) = create_tracker(&dir);
                build_history(&tracker, &clock, size);
                let now = clock.now();

                b.iter(|| {
                    black_box(
                        tracker
                            .compute_delta(USER, Mode::Standard, START, now)
                            .unwrap(),
                    );
                });
            },
        );
    }

    group.finish();
}

/// Benchmark latest-changes lookups, which should not scan history
fn bench_latest_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("latest_changes");

    for history_size in [100, 10000] {
        group.bench_with_input(
            BenchmarkId::new("history_rows", history_size),
            &history_size,
            |b, &size| {
                let dir = TempDir::new().unwrap();
                let (tracker, clock) = create_tracker(&dir);
                build_history(&tracker, &clock, size);

                b.iter(|| {
                    black_box(tracker.latest_changes(USER, Mode::Standard).unwrap());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ingest_changed,
    bench_ingest_unchanged,
    bench_ingest_score,
    bench_compute_delta,
    bench_latest_changes,
);

criterion_main!(benches);
