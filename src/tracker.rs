//! Ingestion coordinator and query surface.

use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::delta::{self, DeltaResult};
use crate::detect::{ChangeDetector, Decision};
use crate::error::{Result, TrackerError};
use crate::hiscores::{self, ScoreEventCounts, ScoreIngestResult};
use crate::locks::KeyLocks;
use crate::query::QueryOptions;
use crate::raw::{RawBeatmap, RawScore, RawSnapshot, ValidatedScore, ValidatedSnapshot};
use crate::records::{ScoreKey, SeriesKey};
use crate::store::SnapshotStore;
use crate::types::{
    Beatmap, BeatmapId, Mode, OnlineActivity, ScoreFingerprint, ScoreOutcome, ScoreRecord,
    StatSnapshot, StoreStats, Timestamp, TrackedUser, UserId,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why an incoming snapshot was not stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Every field matches the last stored snapshot.
    Unchanged,
    /// The payload was fetched no later than the last stored capture.
    Stale { last: Timestamp, fetched_at: Timestamp },
}

/// Outcome of ingesting one stats payload.
#[derive(Clone, Debug, PartialEq)]
pub enum IngestResult {
    Stored(StatSnapshot),
    Skipped(SkipReason),
    /// Stored with regression markers.
    Anomaly(StatSnapshot),
}

impl IngestResult {
    pub fn snapshot(&self) -> Option<&StatSnapshot> {
        match self {
            IngestResult::Stored(snapshot) | IngestResult::Anomaly(snapshot) => Some(snapshot),
            IngestResult::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, IngestResult::Skipped(_))
    }
}

/// Everything one poll of a user produced.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateSummary {
    pub stats: IngestResult,
    /// Delta between the two most recent snapshots after this update.
    pub changes: DeltaResult,
    /// Scores from this poll that became the best on their beatmap.
    pub new_hiscores: Vec<ScoreRecord>,
}

/// Tracks player stats over time.
///
/// Ingestion calls for different (user, mode) pairs run in parallel; calls
/// for the same pair are serialized so the compare-then-append against the
/// last snapshot is atomic. Reads never block on ingestion of other keys.
///
/// ```no_run
/// use osutrack::{Mode, RawSnapshot, Tracker, TrackerConfig, UserId};
///
/// # fn main() -> osutrack::Result<()> {
/// let tracker = Tracker::open(TrackerConfig::at("./osutrack-data"))?;
/// let body = r#"[{"user_id": "2", "username": "peppy"}]"#;
/// if let Some(raw) = RawSnapshot::from_api_response(body)? {
///     let result = tracker.ingest(UserId(2), Mode::Standard, raw)?;
///     println!("{result:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Tracker {
    config: TrackerConfig,
    store: SnapshotStore,
    detector: ChangeDetector,
    series_locks: KeyLocks<SeriesKey>,
    score_locks: KeyLocks<ScoreKey>,
}

impl Tracker {
    /// Open or create a tracker using wall-clock time.
    pub fn open(config: TrackerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TrackerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let detector = ChangeDetector::new(config.float_epsilon);
        let store = SnapshotStore::open_or_create(config.clone(), clock)?;
        Ok(Self {
            config,
            store,
            detector,
            series_locks: KeyLocks::new(),
            score_locks: KeyLocks::new(),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn default_options(&self) -> QueryOptions {
        QueryOptions {
            timeout: self.config.query_timeout(),
        }
    }

    // --- Ingestion ---

    /// Ingest one stats payload for `(user, mode)`.
    ///
    /// Validation happens before anything is written. Redelivering the same
    /// payload is safe: the second call compares equal to the stored row and
    /// is skipped.
    #[tracing::instrument(level = "debug", skip(self, raw))]
    pub fn ingest(&self, user: UserId, mode: Mode, raw: RawSnapshot) -> Result<IngestResult> {
        let valid = raw.validate()?;
        if valid.user_id != user {
            return Err(TrackerError::validation(
                "user_id",
                format!("payload is for user {}, expected {user}", valid.user_id),
            ));
        }

        self.series_locks
            .with(&(user, mode), || self.ingest_locked(user, mode, &valid, raw.fetched_at))
    }

    fn ingest_locked(
        &self,
        user: UserId,
        mode: Mode,
        valid: &ValidatedSnapshot,
        fetched_at: Option<Timestamp>,
    ) -> Result<IngestResult> {
        // Unknown users are created once the payload is known to be fresh.
        if self.store.user(user).is_some() {
            self.store.touch_user(user)?;
        }

        retry_on_conflict(self.config.conflict_retries, user, mode, || {
            self.try_ingest(user, mode, valid, fetched_at)
        })
    }

    fn try_ingest(
        &self,
        user: UserId,
        mode: Mode,
        valid: &ValidatedSnapshot,
        fetched_at: Option<Timestamp>,
    ) -> Result<IngestResult> {
        let last = self.store.last_snapshot(user, mode)?;

        let captured_at = match (fetched_at, &last) {
            (Some(at), Some(last)) if at <= last.captured_at => {
                warn!(
                    user = %user,
                    %mode,
                    last = ?last.captured_at,
                    fetched_at = ?at,
                    "out-of-order snapshot delivery"
                );
                return Ok(IngestResult::Skipped(SkipReason::Stale {
                    last: last.captured_at,
                    fetched_at: at,
                }));
            }
            (Some(at), _) => at,
            (None, Some(last)) => {
                let now = self.store.now();
                if now <= last.captured_at {
                    warn!(user = %user, %mode, now = ?now, last = ?last.captured_at, "clock behind last capture");
                    last.captured_at.next()
                } else {
                    now
                }
            }
            (None, None) => self.store.now(),
        };

        let regressions = match self.detector.evaluate(last.as_ref(), &valid.fields) {
            Decision::Discard => {
                // Fresh but unchanged stats can still carry a rename.
                self.store.upsert_user(user, &valid.username)?;
                debug!(user = %user, %mode, "snapshot unchanged");
                return Ok(IngestResult::Skipped(SkipReason::Unchanged));
            }
            Decision::Persist => Vec::new(),
            Decision::Anomaly(regressions) => {
                for r in &regressions {
                    warn!(
                        user = %user,
                        %mode,
                        field = %r.field,
                        previous = r.previous,
                        current = r.current,
                        "monotonic field regressed"
                    );
                }
                regressions
            }
        };

        self.store.upsert_user(user, &valid.username)?;

        let head = last.as_ref().map(|s| s.id);
        let snapshot = self.store.append_snapshot(
            head,
            user,
            mode,
            captured_at,
            valid.fields.clone(),
            regressions,
        )?;

        if snapshot.is_anomaly() {
            info!(user = %user, %mode, id = %snapshot.id, "stored anomalous snapshot");
            Ok(IngestResult::Anomaly(snapshot))
        } else {
            info!(user = %user, %mode, id = %snapshot.id, "stored snapshot");
            Ok(IngestResult::Stored(snapshot))
        }
    }

    /// Ingest one hiscore for a tracked user.
    #[tracing::instrument(level = "debug", skip(self, raw))]
    pub fn ingest_score(
        &self,
        user: UserId,
        beatmap: BeatmapId,
        mode: Mode,
        raw: RawScore,
    ) -> Result<ScoreIngestResult> {
        let valid = raw.validate()?;
        if let Some(reported) = valid.beatmap_id {
            if reported != beatmap {
                return Err(TrackerError::validation(
                    "beatmap_id",
                    format!("payload is for beatmap {reported}, expected {beatmap}"),
                ));
            }
        }
        if self.store.user(user).is_none() {
            return Err(TrackerError::UserNotFound(user));
        }

        let key = (user, beatmap, mode);
        self.score_locks
            .with(&key, || self.ingest_score_locked(key, &valid))
    }

    fn ingest_score_locked(&self, key: ScoreKey, valid: &ValidatedScore) -> Result<ScoreIngestResult> {
        let (user, beatmap, mode) = key;
        let fingerprint = hiscores::fingerprint(user, beatmap, mode, &valid.fields);

        retry_on_conflict(self.config.conflict_retries, user, mode, || {
            self.try_ingest_score(key, valid, fingerprint)
        })
    }

    fn try_ingest_score(
        &self,
        key: ScoreKey,
        valid: &ValidatedScore,
        fingerprint: ScoreFingerprint,
    ) -> Result<ScoreIngestResult> {
        let (user, beatmap, mode) = key;

        if let Some(existing) = self.store.find_score(key, &fingerprint)? {
            debug!(user = %user, beatmap = %beatmap, %mode, id = %existing.id, "score already recorded");
            self.store.touch_user(user)?;
            return Ok(ScoreIngestResult::Recorded(existing));
        }

        let expected_len = self.store.score_len(key);
        let best = self.store.best_score(key)?;
        let outcome = hiscores::classify(best.as_ref(), &valid.fields);

        let record = self.store.append_score(
            expected_len,
            user,
            beatmap,
            mode,
            valid.fields.clone(),
            outcome,
            fingerprint,
        )?;

        Ok(match (outcome, best) {
            (ScoreOutcome::Improved, Some(previous_best)) => {
                info!(
                    user = %user,
                    beatmap = %beatmap,
                    %mode,
                    score = record.score,
                    previous = previous_best.score,
                    "improved best score"
                );
                ScoreIngestResult::Improved {
                    record,
                    previous_best,
                }
            }
            (ScoreOutcome::Unchanged, _) => {
                debug!(user = %user, beatmap = %beatmap, %mode, score = record.score, "score kept for history");
                ScoreIngestResult::Unchanged(record)
            }
            _ => {
                info!(user = %user, beatmap = %beatmap, %mode, score = record.score, "new best score");
                ScoreIngestResult::New(record)
            }
        })
    }

    /// Ingest a stats payload and a batch of hiscores from one poll.
    ///
    /// Every score payload is validated before anything is written. Each
    /// score must name its beatmap.
    #[tracing::instrument(level = "debug", skip(self, raw, scores))]
    pub fn update(
        &self,
        user: UserId,
        mode: Mode,
        raw: RawSnapshot,
        scores: Vec<RawScore>,
    ) -> Result<UpdateSummary> {
        let mut checked = Vec::with_capacity(scores.len());
        for score in scores {
            let beatmap = score
                .validate()?
                .beatmap_id
                .ok_or_else(|| TrackerError::missing("beatmap_id"))?;
            checked.push((beatmap, score));
        }

        let stats = self.ingest(user, mode, raw)?;

        let mut new_hiscores = Vec::new();
        for (beatmap, score) in checked {
            let result = self.ingest_score(user, beatmap, mode, score)?;
            if result.is_new_best() {
                new_hiscores.push(result.record().clone());
            }
        }

        let changes = self.latest_changes(user, mode)?;

        Ok(UpdateSummary {
            stats,
            changes,
            new_hiscores,
        })
    }

    // --- Stat queries ---

    /// Delta over `[from, to]` for `(user, mode)`.
    pub fn compute_delta(
        &self,
        user: UserId,
        mode: Mode,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<DeltaResult> {
        self.compute_delta_with(user, mode, from, to, &self.default_options())
    }

    pub fn compute_delta_with(
        &self,
        user: UserId,
        mode: Mode,
        from: Timestamp,
        to: Timestamp,
        options: &QueryOptions,
    ) -> Result<DeltaResult> {
        delta::compute_delta(&self.store, user, mode, from, to, &options.deadline())
    }

    /// Delta between the two most recent snapshots.
    pub fn latest_changes(&self, user: UserId, mode: Mode) -> Result<DeltaResult> {
        delta::latest_changes(&self.store, user, mode, &self.default_options().deadline())
    }

    /// Delta since just before the most recent pp change.
    pub fn changes_since_pp_gain(&self, user: UserId, mode: Mode) -> Result<DeltaResult> {
        delta::changes_since_pp_gain(
            &self.store,
            user,
            mode,
            self.detector.epsilon(),
            &self.default_options().deadline(),
        )
    }

    /// Stored snapshots with `from <= captured_at <= to`, oldest first.
    pub fn history(
        &self,
        user: UserId,
        mode: Mode,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<StatSnapshot>> {
        self.history_with(user, mode, from, to, &self.default_options())
    }

    pub fn history_with(
        &self,
        user: UserId,
        mode: Mode,
        from: Timestamp,
        to: Timestamp,
        options: &QueryOptions,
    ) -> Result<Vec<StatSnapshot>> {
        if from > to {
            return Err(TrackerError::validation(
                "range",
                format!("start {from:?} is after end {to:?}"),
            ));
        }
        self.store
            .history(user, mode, from, to, &options.deadline())
    }

    pub fn latest_snapshot(&self, user: UserId, mode: Mode) -> Result<Option<StatSnapshot>> {
        self.store.last_snapshot(user, mode)
    }

    // --- Score queries ---

    pub fn current_best(
        &self,
        user: UserId,
        beatmap: BeatmapId,
        mode: Mode,
    ) -> Result<Option<ScoreRecord>> {
        self.store.best_score((user, beatmap, mode))
    }

    /// Every score recorded for a beatmap, in the order they arrived.
    pub fn score_history(
        &self,
        user: UserId,
        beatmap: BeatmapId,
        mode: Mode,
    ) -> Result<Vec<ScoreRecord>> {
        self.store
            .score_history((user, beatmap, mode), &self.default_options().deadline())
    }

    /// Score rows recorded in `(from, to]`, by outcome.
    pub fn count_score_events(
        &self,
        user: UserId,
        mode: Mode,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<ScoreEventCounts> {
        let records = self.score_events(user, mode, from, to)?;
        Ok(ScoreEventCounts::tally(&records))
    }

    /// Scores recorded in `(from, to]` that took the best slot on arrival.
    pub fn new_hiscores(
        &self,
        user: UserId,
        mode: Mode,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<ScoreRecord>> {
        let mut records = self.score_events(user, mode, from, to)?;
        records.retain(|record| !record.is_history_only());
        Ok(records)
    }

    fn score_events(
        &self,
        user: UserId,
        mode: Mode,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<ScoreRecord>> {
        if from > to {
            return Err(TrackerError::validation(
                "range",
                format!("start {from:?} is after end {to:?}"),
            ));
        }
        self.store
            .score_events(user, mode, from, to, &self.default_options().deadline())
    }

    // --- Reference data ---

    /// Start tracking a user without ingesting stats.
    pub fn track_user(&self, user: UserId, username: &str) -> Result<TrackedUser> {
        let username = username.trim();
        if username.is_empty() {
            return Err(TrackerError::missing("username"));
        }
        self.store.upsert_user(user, username)
    }

    pub fn user(&self, user: UserId) -> Option<TrackedUser> {
        self.store.user(user)
    }

    /// Case-insensitive lookup by current username.
    pub fn user_by_name(&self, name: &str) -> Option<TrackedUser> {
        self.store.user_by_name(name)
    }

    /// Stop tracking a user and drop their snapshots and scores.
    pub fn delete_user(&self, user: UserId) -> Result<u64> {
        self.store.delete_user(user)
    }

    /// Validate and store beatmap metadata. Returns false if nothing changed.
    pub fn upsert_beatmap(&self, raw: &RawBeatmap) -> Result<bool> {
        let beatmap = raw.validate()?;
        self.store.upsert_beatmap(beatmap)
    }

    pub fn beatmap(&self, beatmap: BeatmapId, mode: Mode) -> Option<Beatmap> {
        self.store.beatmap(beatmap, mode)
    }

    // --- Online activity ---

    pub fn record_online(&self, users: u32, operators: u32, voiced: u32) -> Result<OnlineActivity> {
        self.store.append_online(users, operators, voiced)
    }

    /// Samples with `from <= recorded_at <= to`, oldest first.
    pub fn online_activity(&self, from: Timestamp, to: Timestamp) -> Result<Vec<OnlineActivity>> {
        if from > to {
            return Err(TrackerError::validation(
                "range",
                format!("start {from:?} is after end {to:?}"),
            ));
        }
        self.store
            .online_between(from, to, &self.default_options().deadline())
    }

    pub fn latest_online(&self) -> Result<Option<OnlineActivity>> {
        self.store.latest_online()
    }

    // --- Store ---

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }
}

/// Run `attempt` again while its conditional append loses a race, up to
/// `retries` extra tries. Callers already hold the key lock, so a conflict
/// means another writer reached the store without it.
fn retry_on_conflict<T>(
    retries: u32,
    user: UserId,
    mode: Mode,
    mut attempt: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt() {
            Err(TrackerError::ConcurrencyConflict { .. }) if attempts <= retries => {
                warn!(user = %user, %mode, attempts, "append lost a race, retrying");
            }
            Err(TrackerError::ConcurrencyConflict { .. }) => {
                return Err(TrackerError::ConcurrencyConflict {
                    user,
                    mode,
                    attempts,
                });
            }
            other => return other,
        }
    }
}
