//! Integration tests for the tracker.

use osutrack::{
    BeatmapId, DeltaResult, IngestResult, ManualClock, Mode, RawBeatmap, RawScore, RawSnapshot,
    ScoreIngestResult, ScoreOutcome, SkipReason, StatField, StatFields, Timestamp, Tracker,
    TrackerConfig, UserId,
};
use std::sync::Arc;
use tempfile::TempDir;

const PEPPY: UserId = UserId(2);
const STD: Mode = Mode::Standard;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_tracker(dir: &TempDir) -> (Tracker, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_500_000_000)));
    let tracker = Tracker::with_clock(
        TrackerConfig {
            row_cache_size: 64,
            ..TrackerConfig::at(dir.path().join("store"))
        },
        clock.clone(),
    )
    .unwrap();
    (tracker, clock)
}

fn stats(playcount: i64, pp_raw: f64, pp_rank: i64) -> StatFields {
    StatFields {
        count300: playcount * 300,
        count100: playcount * 20,
        count50: playcount * 2,
        playcount,
        ranked_score: playcount * 100_000,
        total_score: playcount * 250_000,
        pp_rank,
        level: 50.0 + playcount as f64 / 1000.0,
        pp_raw,
        accuracy: 97.25,
        count_rank_ss: 1,
        count_rank_s: 10,
        count_rank_a: 30,
        pp_country_rank: pp_rank / 20,
    }
}

fn raw(fields: &StatFields) -> RawSnapshot {
    RawSnapshot::from_stats(PEPPY, "peppy", fields)
}

fn score(beatmap: u32, value: i64, date: &str) -> RawScore {
    RawScore {
        beatmap_id: Some(beatmap.to_string()),
        score: Some(value.to_string()),
        pp: Some("123.45".into()),
        enabled_mods: Some("0".into()),
        rank: Some("S".into()),
        date: Some(date.into()),
    }
}

// --- Ingestion ---

#[test]
fn test_idempotent_ingest() {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = test_tracker(&dir);
    let fields = stats(100, 1000.0, 5000);

    let first = tracker.ingest(PEPPY, STD, raw(&fields)).unwrap();
    assert!(matches!(first, IngestResult::Stored(_)));

    clock.advance_secs(60);
    let second = tracker.ingest(PEPPY, STD, raw(&fields)).unwrap();
    assert_eq!(second, IngestResult::Skipped(SkipReason::Unchanged));

    assert_eq!(tracker.stats().snapshot_count, 1);
}

#[test]
fn test_unchanged_polls_store_one_row_but_move_last_seen() {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = test_tracker(&dir);
    let fields = stats(100, 1000.0, 5000);

    for _ in 0..10 {
        tracker.ingest(PEPPY, STD, raw(&fields)).unwrap();
        clock.advance_secs(300);
    }

    assert_eq!(tracker.stats().snapshot_count, 1);
    let user = tracker.user(PEPPY).unwrap();
    assert_eq!(user.first_seen, Timestamp::from_secs(1_500_000_000));
    assert_eq!(user.last_seen, Timestamp::from_secs(1_500_000_000 + 9 * 300));
}

#[test]
fn test_modes_are_independent_series() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = test_tracker(&dir);
    let fields = stats(100, 1000.0, 5000);

    tracker.ingest(PEPPY, Mode::Standard, raw(&fields)).unwrap();
    let taiko = tracker.ingest(PEPPY, Mode::Taiko, raw(&fields)).unwrap();

    assert!(matches!(taiko, IngestResult::Stored(_)));
    assert_eq!(tracker.stats().snapshot_count, 2);
    assert!(tracker.latest_snapshot(PEPPY, Mode::Mania).unwrap().is_none());
}

#[test]
fn test_playcount_drop_flagged_not_discarded() {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = test_tracker(&dir);

    tracker.ingest(PEPPY, STD, raw(&stats(100, 1000.0, 5000))).unwrap();
    clock.advance_secs(60);

    let dropped = StatFields {
        playcount: 90,
        ..stats(100, 1000.0, 5000)
    };
    let result = tracker.ingest(PEPPY, STD, raw(&dropped)).unwrap();

    let IngestResult::Anomaly(snapshot) = &result else {
        panic!("expected an anomaly, got {result:?}");
    };
    assert_eq!(snapshot.regressions.len(), 1);
    assert_eq!(snapshot.regressions[0].field, StatField::Playcount);
    assert_eq!(tracker.stats().snapshot_count, 2);

    // The flag survives a reopen.
    drop(tracker);
    let (tracker, _) = test_tracker(&dir);
    let latest = tracker.latest_snapshot(PEPPY, STD).unwrap().unwrap();
    assert!(latest.is_anomaly());
}

#[test]
fn test_capture_times_strictly_increase() {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = test_tracker(&dir);

    for i in 0..20 {
        tracker
            .ingest(PEPPY, STD, raw(&stats(100 + i, 1000.0, 5000)))
            .unwrap();
        // The clock sometimes stands still or runs backwards.
        match i % 3 {
            0 => {}
            1 => clock.advance_secs(-5),
            _ => clock.advance_secs(30),
        }
    }

    let history = tracker
        .history(PEPPY, STD, Timestamp::MIN, Timestamp::MAX)
        .unwrap();
    assert_eq!(history.len(), 20);
    assert!(history
        .windows(2)
        .all(|pair| pair[0].captured_at < pair[1].captured_at));
}

#[test]
fn test_rename_tracked() {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = test_tracker(&dir);

    tracker.ingest(PEPPY, STD, raw(&stats(1, 10.0, 100))).unwrap();
    clock.advance_secs(60);
    let renamed = RawSnapshot::from_stats(PEPPY, "peppy2", &stats(2, 10.0, 100));
    tracker.ingest(PEPPY, STD, renamed).unwrap();

    assert_eq!(tracker.user(PEPPY).unwrap().username, "peppy2");
    assert!(tracker.user_by_name("peppy").is_none());
    assert_eq!(tracker.user_by_name("PEPPY2").unwrap().id, PEPPY);
}

// --- Deltas ---

#[test]
fn test_delta_playcount() {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = test_tracker(&dir);

    let t1 = tracker
        .ingest(PEPPY, STD, raw(&stats(100, 1000.0, 5000)))
        .unwrap()
        .snapshot()
        .unwrap()
        .captured_at;
    clock.advance_secs(3600);
    let t2 = tracker
        .ingest(PEPPY, STD, raw(&stats(150, 1010.5, 4800)))
        .unwrap()
        .snapshot()
        .unwrap()
        .captured_at;

    let result = tracker.compute_delta(PEPPY, STD, t1, t2).unwrap();
    let delta = result.delta().unwrap();
    assert_eq!(delta.changes.playcount, 50);
    assert!((delta.changes.pp_raw - 10.5).abs() < 1e-9);
    assert_eq!(delta.changes.pp_rank.delta, -200);
    assert!(delta.changes.pp_rank.improved);

    let same = tracker.compute_delta(PEPPY, STD, t2, t2).unwrap();
    assert!(same.delta().unwrap().changes.is_zero(0.0));
}

#[test]
fn test_delta_before_any_snapshot() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = test_tracker(&dir);

    let result = tracker
        .compute_delta(PEPPY, STD, Timestamp::from_secs(0), Timestamp::MAX)
        .unwrap();
    assert_eq!(result, DeltaResult::NoBaseline);
}

#[test]
fn test_delta_queries_do_not_write() {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = test_tracker(&dir);

    tracker.ingest(PEPPY, STD, raw(&stats(100, 1000.0, 5000))).unwrap();
    clock.advance_secs(60);
    tracker.ingest(PEPPY, STD, raw(&stats(110, 1001.0, 4990))).unwrap();

    let before = tracker.stats();
    tracker
        .compute_delta(PEPPY, STD, Timestamp::MIN, Timestamp::MAX)
        .unwrap();
    tracker.latest_changes(PEPPY, STD).unwrap();
    tracker.changes_since_pp_gain(PEPPY, STD).unwrap();
    tracker
        .history(PEPPY, STD, Timestamp::MIN, Timestamp::MAX)
        .unwrap();
    assert_eq!(tracker.stats(), before);
}

#[test]
fn test_update_composite() {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = test_tracker(&dir);

    let first = tracker
        .update(
            PEPPY,
            STD,
            raw(&stats(100, 1000.0, 5000)),
            vec![score(10, 900_000, "2017-01-01 10:00:00")],
        )
        .unwrap();
    assert!(first.changes.delta().unwrap().first_update);
    assert_eq!(first.new_hiscores.len(), 1);

    clock.advance_secs(600);
    let second = tracker
        .update(
            PEPPY,
            STD,
            raw(&stats(120, 1020.0, 4900)),
            vec![
                score(10, 900_000, "2017-01-01 10:00:00"),
                score(11, 700_000, "2017-01-01 10:05:00"),
            ],
        )
        .unwrap();

    let changes = second.changes.delta().unwrap();
    assert!(!changes.first_update);
    assert_eq!(changes.changes.playcount, 20);
    // Beatmap 10 was a redelivery; only beatmap 11 is new.
    assert_eq!(second.new_hiscores.len(), 1);
    assert_eq!(second.new_hiscores[0].beatmap_id, BeatmapId(11));
}

#[test]
fn test_update_rejects_bad_score_before_writing() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = test_tracker(&dir);

    let mut bad = score(10, 900_000, "2017-01-01 10:00:00");
    bad.rank = None;

    let result = tracker.update(PEPPY, STD, raw(&stats(100, 1000.0, 5000)), vec![bad]);
    assert!(result.is_err());
    assert_eq!(tracker.stats().snapshot_count, 0);
    assert!(tracker.user(PEPPY).is_none());
}

// --- Hiscores ---

#[test]
fn test_hiscore_ranking() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = test_tracker(&dir);
    tracker.track_user(PEPPY, "peppy").unwrap();
    let map = BeatmapId(75);

    let first = tracker
        .ingest_score(PEPPY, map, STD, score(75, 900_000, "2017-01-01 10:00:00"))
        .unwrap();
    assert!(matches!(first, ScoreIngestResult::New(_)));

    let improved = tracker
        .ingest_score(PEPPY, map, STD, score(75, 950_000, "2017-01-02 10:00:00"))
        .unwrap();
    let ScoreIngestResult::Improved { previous_best, .. } = &improved else {
        panic!("expected an improvement, got {improved:?}");
    };
    assert_eq!(previous_best.score, 900_000);
    assert_eq!(tracker.current_best(PEPPY, map, STD).unwrap().unwrap().score, 950_000);

    let worse = tracker
        .ingest_score(PEPPY, map, STD, score(75, 800_000, "2017-01-03 10:00:00"))
        .unwrap();
    assert!(matches!(worse, ScoreIngestResult::Unchanged(_)));
    assert_eq!(tracker.current_best(PEPPY, map, STD).unwrap().unwrap().score, 950_000);

    let history = tracker.score_history(PEPPY, map, STD).unwrap();
    assert_eq!(
        history.iter().map(|r| r.score).collect::<Vec<_>>(),
        vec![900_000, 950_000, 800_000]
    );
    assert!(history[2].is_history_only());
}

#[test]
fn test_hiscore_tie_keeps_earlier_play() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = test_tracker(&dir);
    tracker.track_user(PEPPY, "peppy").unwrap();
    let map = BeatmapId(75);

    tracker
        .ingest_score(PEPPY, map, STD, score(75, 900_000, "2017-01-01 10:00:00"))
        .unwrap();
    let tie = tracker
        .ingest_score(PEPPY, map, STD, score(75, 900_000, "2017-01-05 10:00:00"))
        .unwrap();
    assert!(matches!(tie, ScoreIngestResult::Unchanged(_)));

    let best = tracker.current_best(PEPPY, map, STD).unwrap().unwrap();
    assert_eq!(best.score_time, Timestamp::parse_api("2017-01-01 10:00:00").unwrap());

    // The same score played even earlier arrives last and takes the slot.
    let earlier = tracker
        .ingest_score(PEPPY, map, STD, score(75, 900_000, "2016-12-30 10:00:00"))
        .unwrap();
    let ScoreIngestResult::Improved {
        record,
        previous_best,
    } = &earlier
    else {
        panic!("expected the earlier tie to take the best slot, got {earlier:?}");
    };
    assert!(earlier.is_new_best());
    assert_eq!(previous_best.id, best.id);

    let best = tracker.current_best(PEPPY, map, STD).unwrap().unwrap();
    assert_eq!(best.id, record.id);
    assert_eq!(best.outcome, ScoreOutcome::Improved);

    let bests = tracker
        .new_hiscores(PEPPY, STD, Timestamp::MIN, Timestamp::MAX)
        .unwrap();
    assert_eq!(bests.last().map(|r| r.id), Some(record.id));
    assert_eq!(bests.len(), 2);
}

#[test]
fn test_hiscore_redelivery_recorded_once() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = test_tracker(&dir);
    tracker.track_user(PEPPY, "peppy").unwrap();
    let map = BeatmapId(75);

    let first = tracker
        .ingest_score(PEPPY, map, STD, score(75, 900_000, "2017-01-01 10:00:00"))
        .unwrap();
    let again = tracker
        .ingest_score(PEPPY, map, STD, score(75, 900_000, "2017-01-01 10:00:00"))
        .unwrap();

    assert!(!again.appended());
    assert_eq!(again.record().id, first.record().id);
    assert_eq!(tracker.stats().score_count, 1);
}

#[test]
fn test_score_event_counts() {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = test_tracker(&dir);
    tracker.track_user(PEPPY, "peppy").unwrap();

    let week_start = clock_now(&clock);
    clock.advance_secs(60);
    tracker
        .ingest_score(PEPPY, BeatmapId(1), STD, score(1, 500_000, "2017-01-01 10:00:00"))
        .unwrap();
    clock.advance_secs(60);
    tracker
        .ingest_score(PEPPY, BeatmapId(1), STD, score(1, 600_000, "2017-01-02 10:00:00"))
        .unwrap();
    clock.advance_secs(60);
    tracker
        .ingest_score(PEPPY, BeatmapId(2), STD, score(2, 300_000, "2017-01-03 10:00:00"))
        .unwrap();
    clock.advance_secs(60);
    tracker
        .ingest_score(PEPPY, BeatmapId(2), STD, score(2, 200_000, "2017-01-04 10:00:00"))
        .unwrap();
    let week_end = clock_now(&clock);

    let counts = tracker
        .count_score_events(PEPPY, STD, week_start, week_end)
        .unwrap();
    assert_eq!(counts.new, 2);
    assert_eq!(counts.improved, 1);
    assert_eq!(counts.unchanged, 1);

    let bests = tracker.new_hiscores(PEPPY, STD, week_start, week_end).unwrap();
    assert_eq!(bests.len(), 3);

    // The range is half-open at the start.
    let later = tracker
        .count_score_events(PEPPY, STD, Timestamp::from_secs(week_start.as_secs() + 120), week_end)
        .unwrap();
    assert_eq!(later.total(), 2);
}

fn clock_now(clock: &ManualClock) -> Timestamp {
    use osutrack::Clock;
    clock.now()
}

// --- Reference data ---

#[test]
fn test_delete_user_cascades() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = test_tracker(&dir);

    tracker.ingest(PEPPY, STD, raw(&stats(1, 10.0, 100))).unwrap();
    tracker
        .ingest_score(PEPPY, BeatmapId(1), STD, score(1, 100, "2017-01-01 10:00:00"))
        .unwrap();

    assert_eq!(tracker.delete_user(PEPPY).unwrap(), 2);
    assert!(tracker.user(PEPPY).is_none());
    assert!(tracker.latest_snapshot(PEPPY, STD).unwrap().is_none());
    assert!(tracker.current_best(PEPPY, BeatmapId(1), STD).unwrap().is_none());

    // Tracking again starts from scratch.
    let again = tracker.ingest(PEPPY, STD, raw(&stats(1, 10.0, 100))).unwrap();
    assert!(matches!(again, IngestResult::Stored(_)));
    assert!(tracker.latest_changes(PEPPY, STD).unwrap().delta().unwrap().first_update);
}

#[test]
fn test_beatmaps_and_online_activity() {
    let dir = TempDir::new().unwrap();
    let (tracker, clock) = test_tracker(&dir);

    let map = RawBeatmap::from_api_response(
        r#"[{
            "beatmapset_id": "1", "beatmap_id": "75", "approved": "1",
            "total_length": "142", "hit_length": "109", "version": "Normal",
            "diff_size": "4", "diff_overall": "6", "diff_approach": "6", "diff_drain": "6",
            "mode": "0", "approved_date": "2007-10-06 17:46:31",
            "last_update": "2007-10-06 17:46:31", "artist": "Kenji Ninuma",
            "title": "DISCO PRINCE", "creator": "peppy", "bpm": "119.999",
            "source": "", "difficultyrating": "2.4"
        }]"#,
    )
    .unwrap()
    .remove(0);

    assert!(tracker.upsert_beatmap(&map).unwrap());
    assert!(!tracker.upsert_beatmap(&map).unwrap());
    assert_eq!(
        tracker.beatmap(BeatmapId(75), STD).unwrap().title,
        "DISCO PRINCE"
    );

    let start = clock_now(&clock);
    tracker.record_online(1200, 3, 40).unwrap();
    clock.advance_secs(300);
    tracker.record_online(1300, 3, 41).unwrap();

    let samples = tracker.online_activity(start, clock_now(&clock)).unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(tracker.latest_online().unwrap().unwrap().users, 1300);

    let stats = tracker.stats();
    assert_eq!(stats.beatmap_count, 1);
    assert_eq!(stats.online_count, 2);
}

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let (tracker, clock) = test_tracker(&dir);
        tracker.ingest(PEPPY, STD, raw(&stats(100, 1000.0, 5000))).unwrap();
        clock.advance_secs(60);
        tracker.ingest(PEPPY, STD, raw(&stats(150, 1005.0, 4900))).unwrap();
        tracker
            .ingest_score(PEPPY, BeatmapId(1), STD, score(1, 100, "2017-01-01 10:00:00"))
            .unwrap();
        tracker.sync().unwrap();
    }

    let (tracker, _) = test_tracker(&dir);
    let stats = tracker.stats();
    assert_eq!(stats.snapshot_count, 2);
    assert_eq!(stats.score_count, 1);
    assert_eq!(stats.user_count, 1);

    let changes = tracker.latest_changes(PEPPY, STD).unwrap();
    assert_eq!(changes.delta().unwrap().changes.playcount, 50);
}
