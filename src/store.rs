//! Snapshot store tying the row log, the indices and the reference tables together.

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::query::Deadline;
use crate::records::{
    LoggedRow, Row, RowLog, ScoreEntry, ScoreKey, SeriesIndex, SeriesKey, SnapshotEntry,
};
use crate::reference::ReferenceTables;
use crate::types::{
    Beatmap, BeatmapId, Mode, OnlineActivity, Regression, RowId, ScoreFields, ScoreFingerprint,
    ScoreOutcome, ScoreRecord, StatFields, StatSnapshot, StoreStats, Timestamp, TrackedUser,
    UserId,
};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"OTS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const LOG_FILE: &str = "rows.log";
const USER_CHECKPOINT_FILE: &str = "users.bin";

/// Durable, append-only storage for snapshots, scores and reference data.
///
/// All writes are serialized through one lock. Snapshot and score appends
/// are conditional on the series head the caller observed, so a caller that
/// raced another writer gets a [`TrackerError::ConcurrencyConflict`] instead
/// of a duplicate row.
pub(crate) struct SnapshotStore {
    config: TrackerConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: RowLog,
    index: SeriesIndex,
    reference: ReferenceTables,

    /// Decoded rows by frame offset.
    cache: Mutex<LruCache<u64, LoggedRow>>,

    clock: Arc<dyn Clock>,

    write_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: TrackerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config, clock)
        } else if config.create_if_missing {
            Self::create(config, clock)
        } else {
            Err(TrackerError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: TrackerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        info!(path = %config.path.display(), "created store");
        Self::open(config, clock)
    }

    /// Open an existing store and rebuild its indices from the log.
    pub fn open(config: TrackerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log = RowLog::open_with_sync_interval(config.path.join(LOG_FILE), config.sync_interval)?;
        let index = SeriesIndex::new();
        let reference = ReferenceTables::new();

        let replayed = Self::replay(&log, &index, &reference)?;

        match reference.load_checkpoint(config.path.join(USER_CHECKPOINT_FILE)) {
            Ok(moved) => debug!(moved, "applied user checkpoint"),
            Err(e) => warn!(error = %e, "ignoring unreadable user checkpoint"),
        }

        info!(
            path = %config.path.display(),
            rows = replayed,
            users = reference.user_count(),
            "opened store"
        );

        let cache_size = NonZeroUsize::new(config.row_cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            index,
            reference,
            cache: Mutex::new(LruCache::new(cache_size)),
            clock,
            write_lock: Mutex::new(()),
        })
    }

    /// Rebuild the indices and reference tables from the log, in log order.
    fn replay(log: &RowLog, index: &SeriesIndex, reference: &ReferenceTables) -> Result<u64> {
        let mut count = 0u64;
        for item in log.iter_from(0) {
            let (offset, logged) = item?;
            Self::apply(index, reference, offset, &logged);
            count += 1;
        }
        Ok(count)
    }

    /// Apply one logged row to the in-memory state.
    fn apply(index: &SeriesIndex, reference: &ReferenceTables, offset: u64, logged: &LoggedRow) {
        match &logged.row {
            Row::Snapshot {
                user_id,
                mode,
                captured_at,
                regressions,
                ..
            } => {
                index.insert_snapshot(
                    (*user_id, *mode),
                    SnapshotEntry {
                        id: logged.id,
                        offset,
                        captured_at: *captured_at,
                        anomaly: !regressions.is_empty(),
                    },
                );
                reference.touch(*user_id, logged.recorded_at);
            }
            Row::Score {
                user_id,
                beatmap_id,
                mode,
                fields,
                outcome,
                fingerprint,
            } => {
                index.insert_score(
                    (*user_id, *beatmap_id, *mode),
                    ScoreEntry {
                        id: logged.id,
                        offset,
                        score: fields.score,
                        score_time: fields.score_time,
                        recorded_at: logged.recorded_at,
                        fingerprint: *fingerprint,
                        outcome: *outcome,
                    },
                );
                reference.touch(*user_id, logged.recorded_at);
            }
            Row::Online { .. } => {
                index.insert_online(logged.recorded_at, logged.id, offset);
            }
            Row::User { user_id, username } => {
                reference.apply_user(*user_id, username, logged.recorded_at);
            }
            Row::UserDeleted { user_id } => {
                index.purge_user(*user_id);
                reference.remove_user(*user_id);
            }
            Row::Beatmap(beatmap) => {
                reference.apply_beatmap(beatmap.clone());
            }
        }
    }

    /// Append under the write lock and apply to the in-memory state.
    fn commit(&self, row: Row) -> Result<(LoggedRow, u64)> {
        let recorded_at = self.clock.now();
        let (logged, offset) = self.log.append(row, recorded_at)?;
        Self::apply(&self.index, &self.reference, offset, &logged);
        self.cache.lock().put(offset, logged.clone());
        Ok((logged, offset))
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // --- Users ---

    /// Start tracking a user, or record a rename. Writes a row only when
    /// the user is new or the name changed.
    pub fn upsert_user(&self, id: UserId, username: &str) -> Result<TrackedUser> {
        let _lock = self.write_lock.lock();

        if let Some(existing) = self.reference.user(id) {
            if existing.username == username {
                self.reference.touch(id, self.clock.now());
                return self.reference.user(id).ok_or(TrackerError::UserNotFound(id));
            }
            info!(user = %id, from = %existing.username, to = %username, "user renamed");
        } else {
            info!(user = %id, username = %username, "tracking new user");
        }

        self.commit(Row::User {
            user_id: id,
            username: username.to_string(),
        })?;
        self.reference.user(id).ok_or(TrackerError::UserNotFound(id))
    }

    /// Move a user's `last_seen` to now.
    pub fn touch_user(&self, id: UserId) -> Result<()> {
        if self.reference.touch(id, self.clock.now()) {
            Ok(())
        } else {
            Err(TrackerError::UserNotFound(id))
        }
    }

    /// Stop tracking a user and drop everything recorded for them.
    /// Returns the number of snapshot and score rows dropped.
    pub fn delete_user(&self, id: UserId) -> Result<u64> {
        let _lock = self.write_lock.lock();

        if !self.reference.contains_user(id) {
            return Err(TrackerError::UserNotFound(id));
        }

        let before = self.index.snapshot_count() + self.index.score_count();
        self.commit(Row::UserDeleted { user_id: id })?;
        let after = self.index.snapshot_count() + self.index.score_count();

        // Cached rows of the user are unreachable through the index now.
        self.cache.lock().clear();

        let removed = before.saturating_sub(after);
        info!(user = %id, removed, "deleted user");
        Ok(removed)
    }

    pub fn user(&self, id: UserId) -> Option<TrackedUser> {
        self.reference.user(id)
    }

    pub fn user_by_name(&self, name: &str) -> Option<TrackedUser> {
        self.reference.user_by_name(name)
    }

    // --- Snapshots ---

    /// Append a snapshot if the series head is still `expected_head`.
    pub fn append_snapshot(
        &self,
        expected_head: Option<RowId>,
        user: UserId,
        mode: Mode,
        captured_at: Timestamp,
        fields: StatFields,
        regressions: Vec<Regression>,
    ) -> Result<StatSnapshot> {
        let _lock = self.write_lock.lock();

        if !self.reference.contains_user(user) {
            return Err(TrackerError::UserNotFound(user));
        }

        let head = self.index.last_snapshot((user, mode));
        if head.map(|h| h.id) != expected_head {
            debug!(user = %user, %mode, ?expected_head, "snapshot head moved");
            return Err(TrackerError::ConcurrencyConflict {
                user,
                mode,
                attempts: 1,
            });
        }
        if let Some(head) = head {
            if captured_at <= head.captured_at {
                return Err(TrackerError::NonMonotonicTimestamp {
                    last: head.captured_at,
                    got: captured_at,
                });
            }
        }

        let (logged, _) = self.commit(Row::Snapshot {
            user_id: user,
            mode,
            captured_at,
            fields,
            regressions,
        })?;
        snapshot_from(logged)
    }

    pub fn last_snapshot_entry(&self, user: UserId, mode: Mode) -> Option<SnapshotEntry> {
        self.index.last_snapshot((user, mode))
    }

    pub fn last_snapshot(&self, user: UserId, mode: Mode) -> Result<Option<StatSnapshot>> {
        self.last_snapshot_entry(user, mode)
            .map(|entry| self.load_snapshot(&entry))
            .transpose()
    }

    /// Up to `n` most recent snapshots, newest first.
    pub fn latest_snapshots(&self, user: UserId, mode: Mode, n: usize) -> Result<Vec<StatSnapshot>> {
        self.latest_snapshot_entries((user, mode), n)
            .iter()
            .map(|entry| self.load_snapshot(entry))
            .collect()
    }

    pub(crate) fn latest_snapshot_entries(&self, key: SeriesKey, n: usize) -> Vec<SnapshotEntry> {
        self.index.latest_snapshots(key, n)
    }

    pub(crate) fn anchor_at_or_before(&self, key: SeriesKey, at: Timestamp) -> Option<SnapshotEntry> {
        self.index.anchor_at_or_before(key, at)
    }

    pub(crate) fn anomalies_between(&self, key: SeriesKey, after: Timestamp, upto: Timestamp) -> usize {
        self.index.anomalies_between(key, after, upto)
    }

    /// Snapshots with `from <= captured_at <= to`, oldest first.
    pub(crate) fn history(
        &self,
        user: UserId,
        mode: Mode,
        from: Timestamp,
        to: Timestamp,
        deadline: &Deadline,
    ) -> Result<Vec<StatSnapshot>> {
        let entries = self.index.snapshots_between((user, mode), from, to);
        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            deadline.check()?;
            out.push(self.load_snapshot(entry)?);
        }
        Ok(out)
    }

    pub(crate) fn load_snapshot(&self, entry: &SnapshotEntry) -> Result<StatSnapshot> {
        snapshot_from(self.read_row(entry.offset)?)
    }

    // --- Scores ---

    pub fn score_len(&self, key: ScoreKey) -> usize {
        self.index.score_len(key)
    }

    /// Append a score if the key still holds `expected_len` rows.
    #[allow(clippy::too_many_arguments)]
    pub fn append_score(
        &self,
        expected_len: usize,
        user: UserId,
        beatmap: BeatmapId,
        mode: Mode,
        fields: ScoreFields,
        outcome: ScoreOutcome,
        fingerprint: ScoreFingerprint,
    ) -> Result<ScoreRecord> {
        let _lock = self.write_lock.lock();

        if !self.reference.contains_user(user) {
            return Err(TrackerError::UserNotFound(user));
        }
        if self.index.score_len((user, beatmap, mode)) != expected_len {
            return Err(TrackerError::ConcurrencyConflict {
                user,
                mode,
                attempts: 1,
            });
        }

        let (logged, _) = self.commit(Row::Score {
            user_id: user,
            beatmap_id: beatmap,
            mode,
            fields,
            outcome,
            fingerprint,
        })?;
        score_from(logged)
    }

    pub fn best_score(&self, key: ScoreKey) -> Result<Option<ScoreRecord>> {
        self.index
            .best_score(key)
            .map(|entry| self.load_score(entry.offset))
            .transpose()
    }

    pub fn find_score(&self, key: ScoreKey, fingerprint: &ScoreFingerprint) -> Result<Option<ScoreRecord>> {
        self.index
            .find_fingerprint(key, fingerprint)
            .map(|entry| self.load_score(entry.offset))
            .transpose()
    }

    /// Every row recorded for a score key, in append order.
    pub(crate) fn score_history(&self, key: ScoreKey, deadline: &Deadline) -> Result<Vec<ScoreRecord>> {
        let entries = self.index.score_series(key);
        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            deadline.check()?;
            out.push(self.load_score(entry.offset)?);
        }
        Ok(out)
    }

    /// Scores recorded for (user, mode) with `from < recorded_at <= to`.
    pub(crate) fn score_events(
        &self,
        user: UserId,
        mode: Mode,
        from: Timestamp,
        to: Timestamp,
        deadline: &Deadline,
    ) -> Result<Vec<ScoreRecord>> {
        let entries = self.index.score_events_between((user, mode), from, to);
        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            deadline.check()?;
            out.push(self.load_score(entry.offset)?);
        }
        Ok(out)
    }

    fn load_score(&self, offset: u64) -> Result<ScoreRecord> {
        score_from(self.read_row(offset)?)
    }

    // --- Online activity ---

    pub fn append_online(&self, users: u32, operators: u32, voiced: u32) -> Result<OnlineActivity> {
        let _lock = self.write_lock.lock();
        let (logged, _) = self.commit(Row::Online {
            users,
            operators,
            voiced,
        })?;
        online_from(logged)
    }

    pub(crate) fn online_between(
        &self,
        from: Timestamp,
        to: Timestamp,
        deadline: &Deadline,
    ) -> Result<Vec<OnlineActivity>> {
        let offsets = self.index.online_between(from, to);
        let mut out = Vec::with_capacity(offsets.len());
        for offset in offsets {
            deadline.check()?;
            out.push(online_from(self.read_row(offset)?)?);
        }
        Ok(out)
    }

    pub fn latest_online(&self) -> Result<Option<OnlineActivity>> {
        self.index
            .last_online()
            .map(|offset| self.read_row(offset).and_then(online_from))
            .transpose()
    }

    // --- Beatmaps ---

    /// Insert or replace beatmap metadata. Returns false if nothing changed.
    pub fn upsert_beatmap(&self, beatmap: Beatmap) -> Result<bool> {
        let _lock = self.write_lock.lock();
        if !self.reference.beatmap_differs(&beatmap) {
            return Ok(false);
        }
        debug!(beatmap = %beatmap.beatmap_id, mode = %beatmap.mode, "storing beatmap");
        self.commit(Row::Beatmap(beatmap))?;
        Ok(true)
    }

    pub fn beatmap(&self, id: BeatmapId, mode: Mode) -> Option<Beatmap> {
        self.reference.beatmap(id, mode)
    }

    // --- Store ---

    fn read_row(&self, offset: u64) -> Result<LoggedRow> {
        if let Some(row) = self.cache.lock().get(&offset) {
            return Ok(row.clone());
        }
        let row = self.log.read_at(offset)?;
        self.cache.lock().put(offset, row.clone());
        Ok(row)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            snapshot_count: self.index.snapshot_count(),
            score_count: self.index.score_count(),
            online_count: self.index.online_count(),
            user_count: self.reference.user_count(),
            beatmap_count: self.reference.beatmap_count(),
            log_size_bytes: self.log.size(),
        }
    }

    /// Flush the log and write the user checkpoint.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()?;
        self.reference
            .save_checkpoint(self.config.path.join(USER_CHECKPOINT_FILE))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(TrackerError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut header = [0u8; 5];
        file.read_exact(&mut header)?;
        if &header[0..4] != STORE_MAGIC {
            return Err(TrackerError::InvalidFormat("invalid store magic".into()));
        }
        if header[4] != STORE_VERSION {
            return Err(TrackerError::InvalidFormat(format!(
                "unsupported store version: {}",
                header[4]
            )));
        }
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| TrackerError::Locked)?;
        Ok(lock_file)
    }
}

impl Drop for SnapshotStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        if let Err(e) = self.sync() {
            warn!(error = %e, "sync on close failed");
        }
    }
}

fn snapshot_from(logged: LoggedRow) -> Result<StatSnapshot> {
    match logged.row {
        Row::Snapshot {
            user_id,
            mode,
            captured_at,
            fields,
            regressions,
        } => Ok(StatSnapshot {
            id: logged.id,
            user_id,
            mode,
            captured_at,
            recorded_at: logged.recorded_at,
            fields,
            regressions,
        }),
        other => Err(TrackerError::Corruption(format!(
            "row {} is {:?}, expected a snapshot",
            logged.id,
            other.kind()
        ))),
    }
}

fn score_from(logged: LoggedRow) -> Result<ScoreRecord> {
    match logged.row {
        Row::Score {
            user_id,
            beatmap_id,
            mode,
            fields,
            outcome,
            ..
        } => Ok(ScoreRecord {
            id: logged.id,
            user_id,
            beatmap_id,
            mode,
            score: fields.score,
            pp: fields.pp,
            enabled_mods: fields.enabled_mods,
            rank: fields.rank,
            score_time: fields.score_time,
            recorded_at: logged.recorded_at,
            outcome,
        }),
        other => Err(TrackerError::Corruption(format!(
            "row {} is {:?}, expected a score",
            logged.id,
            other.kind()
        ))),
    }
}

fn online_from(logged: LoggedRow) -> Result<OnlineActivity> {
    match logged.row {
        Row::Online {
            users,
            operators,
            voiced,
        } => Ok(OnlineActivity {
            id: logged.id,
            recorded_at: logged.recorded_at,
            users,
            operators,
            voiced,
        }),
        other => Err(TrackerError::Corruption(format!(
            "row {} is {:?}, expected an online sample",
            logged.id,
            other.kind()
        ))),
    }
}
